//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod changes;
mod datasource;
mod ontology;

use crate::audit::{AuditAction, AuditEntry};
use crate::auth::auth_middleware;
use crate::config::Settings;
use crate::error::ApiResult;
use crate::models::SuccessResponse;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName, Method},
    middleware::from_fn_with_state,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;
use uuid::Uuid;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    let api = Router::new()
        // Datasources and the schema mirror
        .route("/datasources", post(datasource::register_datasource))
        .route(
            "/projects/{project_id}/datasources/{datasource_id}/refresh",
            post(datasource::refresh_datasource),
        )
        .route("/projects/{project_id}/tables", get(datasource::list_tables))
        .route(
            "/projects/{project_id}/relationships",
            get(datasource::list_relationships).post(ontology::create_relationship),
        )

        // Pending changes
        .route("/projects/{project_id}/changes", get(changes::list_changes))
        .route("/projects/{project_id}/changes/resolve", post(changes::resolve_changes))
        .route("/projects/{project_id}/changes/reject-all", post(changes::reject_all_changes))

        // Ontology
        .route("/projects/{project_id}/entities", get(ontology::list_entities))
        .route("/projects/{project_id}/entities/discover", post(ontology::discover_entities))
        .route("/projects/{project_id}/entities/enrich", post(ontology::enrich_entities))
        .route("/projects/{project_id}/questions", get(ontology::list_questions))
        .route("/entities/{id}", patch(ontology::update_entity))
        .route("/entities/{id}/aliases", post(ontology::add_alias))
        .route(
            "/relationships/{id}",
            patch(ontology::update_relationship).delete(ontology::delete_relationship),
        )

        // Audit
        .route("/projects/{project_id}/audit", get(list_audit))
        .route_layer(from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        // Health check
        .route("/health", get(health_check))
        .nest("/api", api)
        // Apply middleware and state
        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let methods = [Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS];
    let headers = [
        header::CONTENT_TYPE,
        header::AUTHORIZATION,
        header::ACCEPT,
        HeaderName::from_static("x-edit-source"),
    ];

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers)
            .max_age(Duration::from_secs(3600))
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .max_age(Duration::from_secs(3600))
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    action: Option<AuditAction>,
    limit: Option<usize>,
}

async fn list_audit(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<SuccessResponse<Vec<AuditEntry>>>> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let entries = state.audit.list(project_id, query.action, limit).await;
    Ok(Json(SuccessResponse::with_data(
        format!("{} audit entr(ies).", entries.len()),
        entries,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Claims, Role};
    use crate::config::{CorsConfig, DatabaseConfig, EnrichmentConfig, ServerConfig, SyncConfig};
    use crate::db::{ChangeStore, MemoryStore, OntologyStore, SchemaStore};
    use crate::enrichment::llm::{GenerateRequest, LlmClient, LlmResponse};
    use crate::error::AppError;
    use crate::models::{NewEntity, STRUCTURAL_CONFIDENCE};
    use crate::provenance::Provenance;
    use crate::introspection::fixtures::{column, StaticDiscoverer};
    use crate::models::ChangeStatus;
    use crate::state::{AppState, Stores};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::sync::Arc;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    fn settings() -> Settings {
        Settings {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            cors: CorsConfig::default(),
            sync: SyncConfig::default(),
            enrichment: EnrichmentConfig::default(),
            llm: None,
            jwt_secret: Some(SECRET.to_string()),
        }
    }

    fn token(role: Role) -> String {
        let claims = Claims {
            sub: "ana".to_string(),
            role,
            exp: chrono::Utc::now().timestamp() + 600,
            iat: chrono::Utc::now().timestamp(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn app(store: Arc<MemoryStore>) -> (Router, SharedState) {
        app_with_llm(store, None)
    }

    fn app_with_llm(
        store: Arc<MemoryStore>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> (Router, SharedState) {
        let settings = settings();
        let state = Arc::new(
            AppState::new(Stores::shared(store), &settings, llm, SECRET.to_string()).unwrap(),
        );
        (create_router(state.clone(), &settings), state)
    }

    /// Names every table listed in the prompt after itself
    struct EchoLlm;

    #[async_trait::async_trait]
    impl LlmClient for EchoLlm {
        async fn generate(&self, request: GenerateRequest) -> Result<LlmResponse, AppError> {
            let entities: Vec<serde_json::Value> = request
                .prompt
                .lines()
                .filter_map(|l| l.strip_prefix("- "))
                .map(|t| {
                    serde_json::json!({
                        "table_name": t,
                        "entity_name": format!("Entity {}", t),
                        "description": "Echoed",
                    })
                })
                .collect();
            Ok(LlmResponse {
                content: serde_json::json!({ "entities": entities }).to_string(),
                conversation_id: None,
            })
        }
    }

    fn post(uri: &str, role: Role, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token(role)))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// Mirror with one auto-selected new table and its pending change
    async fn seeded(store: &Arc<MemoryStore>, state: &SharedState, project: Uuid) {
        let discoverer = StaticDiscoverer::new()
            .with_table("public", "users", vec![column("id", "integer", 1)]);
        state
            .refresh
            .refresh(project, Uuid::new_v4(), &discoverer, true, None)
            .await
            .unwrap();
        assert_eq!(store.list_changes(project, Some(ChangeStatus::Pending)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (app, _) = app(Arc::new(MemoryStore::new()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_token() {
        let (app, _) = app(Arc::new(MemoryStore::new()));
        let uri = format!("/api/projects/{}/changes", Uuid::new_v4());
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_reject_all_requires_admin() {
        let store = Arc::new(MemoryStore::new());
        let (app, state) = app(store.clone());
        let project = Uuid::new_v4();
        seeded(&store, &state, project).await;

        let uri = format!("/api/projects/{}/changes/reject-all", project);
        let response = app.clone().oneshot(post(&uri, Role::Developer, "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app.oneshot(post(&uri, Role::Admin, "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let changes = store.list_changes(project, None).await.unwrap();
        assert_eq!(changes[0].status, ChangeStatus::Rejected);
        assert_eq!(changes[0].reviewed_by.as_deref(), Some("ana"));
        let users = store.find_table(project, Some("public"), "users").await.unwrap().unwrap();
        assert!(!users.is_selected);
    }

    #[tokio::test]
    async fn test_resolve_dispatches_entity_discovery() {
        let store = Arc::new(MemoryStore::new());
        let (app, state) = app(store.clone());
        let project = Uuid::new_v4();
        seeded(&store, &state, project).await;

        let uri = format!("/api/projects/{}/changes/resolve", project);
        let response = app
            .oneshot(post(&uri, Role::Admin, r#"{"tables": ["users"]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.tasks.shutdown().await;
        let entities = crate::db::OntologyStore::list_entities(store.as_ref(), project)
            .await
            .unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].primary_table, "users");
    }

    #[tokio::test]
    async fn test_blank_selection_names_are_rejected() {
        let (app, _) = app(Arc::new(MemoryStore::new()));
        let uri = format!("/api/projects/{}/changes/resolve", Uuid::new_v4());
        let response = app
            .oneshot(post(&uri, Role::Admin, r#"{"tables": [" "]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_enrich_route_runs_batches_concurrently() {
        let store = Arc::new(MemoryStore::new());
        let project = Uuid::new_v4();
        for i in 0..45 {
            let table = format!("t{:02}", i);
            let entity = NewEntity {
                project_id: project,
                name: table.clone(),
                primary_schema: "public".to_string(),
                primary_table: table,
                primary_column: "id".to_string(),
                confidence: STRUCTURAL_CONFIDENCE,
                created_by: Provenance::Inferred,
            }
            .into_entity();
            OntologyStore::create_entity(store.as_ref(), &entity).await.unwrap();
        }
        let (app, _) = app_with_llm(store.clone(), Some(Arc::new(EchoLlm)));

        let uri = format!("/api/projects/{}/entities/enrich", project);
        let response = app.oneshot(post(&uri, Role::Developer, "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["data"]["entitiesEnriched"], 45);
        assert_eq!(body["data"]["batches"], 3);
    }

    #[tokio::test]
    async fn test_enrichment_without_model_is_a_config_error() {
        let (app, _) = app(Arc::new(MemoryStore::new()));
        let uri = format!("/api/projects/{}/entities/enrich", Uuid::new_v4());
        let response = app.oneshot(post(&uri, Role::Developer, "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
