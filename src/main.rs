//! SchemaFlow Ontology - schema mirror, change review and entity enrichment
//!
//! Keeps a durable mirror of each registered datasource's schema:
//! - Refresh: re-discover a datasource and reconcile the mirror by natural key
//! - Review: every detected delta becomes a change that reviewers approve or reject
//! - Ontology: selected tables become domain entities, named and described
//!   by a language model in batches

mod audit;
mod auth;
mod changes;
mod config;
mod connection;
mod db;
mod enrichment;
mod error;
mod introspection;
mod models;
mod ontology;
mod provenance;
mod refresh;
mod routes;
mod state;
mod sync;
mod tasks;

use crate::config::{DatabaseConfig, Settings};
use crate::db::PgStore;
use crate::enrichment::{HttpLlmClient, LlmClient};
use crate::routes::create_router;
use crate::state::{AppState, Stores};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("Starting SchemaFlow Ontology...");

    // Load configuration
    let settings = Settings::load()?;
    info!("Configuration loaded successfully");

    let jwt_secret = settings.jwt_secret.clone().unwrap_or_else(|| {
        warn!("JWT_SECRET not set, using default (INSECURE - set in production!)");
        "schemaflow-dev-secret-change-in-production".to_string()
    });

    let pool = init_database_pool(&settings.database).await?;
    info!("Database pool created successfully");

    let store = Arc::new(PgStore::new(pool));
    store.migrate().await?;
    info!("Metadata tables initialized");

    let llm: Option<Arc<dyn LlmClient>> = match &settings.llm {
        Some(config) => {
            info!("Enrichment enabled with model '{}'", config.model);
            Some(Arc::new(HttpLlmClient::new(config)?))
        }
        None => {
            warn!("LLM_BASE_URL not set, entity enrichment is disabled");
            None
        }
    };

    let state = Arc::new(AppState::new(Stores::shared(store), &settings, llm, jwt_secret)?);

    // Build the router
    let app = create_router(state.clone(), &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("Server listening on http://{}", addr);
    info!("   POST /api/datasources                                  - Register a datasource");
    info!("   POST /api/projects/:id/datasources/:ds/refresh        - Refresh the schema mirror");
    info!("   GET  /api/projects/:id/changes                        - List detected changes");
    info!("   POST /api/projects/:id/changes/resolve                - Approve selected, reject the rest");
    info!("   POST /api/projects/:id/changes/reject-all             - Reject every pending change");
    info!("   POST /api/projects/:id/entities/discover              - Build entities from tables");
    info!("   POST /api/projects/:id/entities/enrich                - Name and describe entities");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Waiting for background tasks...");
    state.tasks.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemaflow_ontology=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Initialize the metadata database pool
async fn init_database_pool(config: &DatabaseConfig) -> anyhow::Result<deadpool_postgres::Pool> {
    use deadpool_postgres::{Config, ManagerConfig, PoolConfig, RecyclingMethod, Runtime};

    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(config.max_pool_size));

    // Create pool with TLS support if needed
    let pool = if config.require_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| anyhow::anyhow!("Failed to create TLS pool: {}", e))?
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(|e| anyhow::anyhow!("Failed to create pool: {}", e))?
    };

    // Test the connection
    let client = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get pool connection: {}", e))?;
    client
        .query_one("SELECT 1 as ok", &[])
        .await
        .map_err(|e| anyhow::anyhow!("Failed to verify database connection: {}", e))?;

    info!("Database connection successful (TLS: {})", config.require_tls);
    Ok(pool)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
