//! Application state management
//!
//! Contains shared state accessible across all handlers. Services are built
//! once over the persistence traits so tests can swap in the memory store.

use crate::audit::AuditLog;
use crate::changes::ChangeResolver;
use crate::config::Settings;
use crate::connection::DatasourceRegistry;
use crate::db::{ChangeStore, OntologyStore, SchemaStore};
use crate::enrichment::{EnrichmentPipeline, LlmClient, QuestionQueue};
use crate::error::AppError;
use crate::ontology::{EntityDiscovery, OntologyService};
use crate::refresh::RefreshService;
use crate::sync::AutoSelectPolicy;
use crate::tasks::BackgroundTasks;
use std::sync::Arc;

/// The three persistence seams, usually one store behind all of them
#[derive(Clone)]
pub struct Stores {
    pub schema: Arc<dyn SchemaStore>,
    pub changes: Arc<dyn ChangeStore>,
    pub ontology: Arc<dyn OntologyStore>,
}

impl Stores {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: SchemaStore + ChangeStore + OntologyStore + 'static,
    {
        Self {
            schema: store.clone(),
            changes: store.clone(),
            ontology: store,
        }
    }
}

/// Application state shared across all handlers
pub struct AppState {
    pub stores: Stores,

    /// Registered datasources and their connection pools
    pub datasources: DatasourceRegistry,

    pub refresh: RefreshService,
    pub resolver: ChangeResolver,
    pub discovery: EntityDiscovery,
    pub ontology: OntologyService,

    /// `None` when no language model is configured
    pub enrichment: Option<EnrichmentPipeline>,
    pub questions: Arc<QuestionQueue>,

    pub audit: Arc<AuditLog>,
    pub tasks: BackgroundTasks,

    /// Secret for verifying bearer tokens
    pub jwt_secret: String,
}

impl AppState {
    pub fn new(
        stores: Stores,
        settings: &Settings,
        llm: Option<Arc<dyn LlmClient>>,
        jwt_secret: String,
    ) -> Result<Self, AppError> {
        let policy = Arc::new(AutoSelectPolicy::from_config(&settings.sync)?);
        let audit = Arc::new(AuditLog::new());
        let questions = Arc::new(QuestionQueue::new());

        let enrichment = llm.map(|llm| {
            EnrichmentPipeline::new(
                stores.schema.clone(),
                stores.ontology.clone(),
                llm,
                questions.clone(),
                audit.clone(),
                settings.enrichment.clone(),
            )
        });

        Ok(Self {
            datasources: DatasourceRegistry::new(settings.database.max_pool_size),
            refresh: RefreshService::new(
                stores.schema.clone(),
                stores.changes.clone(),
                stores.ontology.clone(),
                policy.clone(),
                audit.clone(),
            ),
            resolver: ChangeResolver::new(stores.schema.clone(), stores.changes.clone()),
            discovery: EntityDiscovery::new(
                stores.schema.clone(),
                stores.ontology.clone(),
                policy,
            ),
            ontology: OntologyService::new(
                stores.schema.clone(),
                stores.ontology.clone(),
                audit.clone(),
            ),
            enrichment,
            questions,
            audit,
            tasks: BackgroundTasks::new(),
            stores,
            jwt_secret,
        })
    }

    pub fn enrichment(&self) -> Result<&EnrichmentPipeline, AppError> {
        self.enrichment.as_ref().ok_or_else(|| {
            AppError::Config("Enrichment is disabled: LLM_BASE_URL is not set".to_string())
        })
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
