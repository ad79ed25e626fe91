//! Refresh service
//!
//! One refresh of a datasource: synchronize the mirror, then record the
//! deltas as changes. Recording changes is best-effort; the refresh succeeds
//! as long as the mirror itself is up to date.

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::changes::ChangeClassifier;
use crate::db::{ChangeStore, OntologyStore, SchemaStore, TableKey};
use crate::error::AppError;
use crate::introspection::SchemaDiscoverer;
use crate::models::split_qualified;
use crate::sync::{AutoSelectPolicy, RefreshResult, SchemaSynchronizer};
use crate::tasks::KeyedLocks;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    #[serde(flatten)]
    pub result: RefreshResult,
    /// `None` when the deltas could not be recorded as changes
    pub changes_recorded: Option<usize>,
    /// Entities flagged because their primary table disappeared
    pub entities_marked_stale: u64,
}

pub struct RefreshService {
    synchronizer: SchemaSynchronizer,
    changes: Arc<dyn ChangeStore>,
    ontology: Arc<dyn OntologyStore>,
    audit: Arc<AuditLog>,
    locks: KeyedLocks<Uuid>,
}

impl RefreshService {
    pub fn new(
        schema: Arc<dyn SchemaStore>,
        changes: Arc<dyn ChangeStore>,
        ontology: Arc<dyn OntologyStore>,
        policy: Arc<AutoSelectPolicy>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            synchronizer: SchemaSynchronizer::new(schema, policy),
            changes,
            ontology,
            audit,
            locks: KeyedLocks::new(),
        }
    }

    /// Refreshes of the same datasource are serialized
    pub async fn refresh(
        &self,
        project_id: Uuid,
        datasource_id: Uuid,
        discoverer: &dyn SchemaDiscoverer,
        auto_select: bool,
        actor: Option<&str>,
    ) -> Result<RefreshOutcome, AppError> {
        let _guard = self.locks.lock(&datasource_id).await;

        let result = self
            .synchronizer
            .sync(project_id, datasource_id, discoverer, auto_select)
            .await?;

        let changes_recorded =
            match ChangeClassifier::record(self.changes.as_ref(), project_id, &result).await {
                Ok(changes) => Some(changes.len()),
                Err(e) => {
                    warn!(
                        "Change detection failed for datasource {}, schema is still refreshed: {}",
                        datasource_id, e
                    );
                    self.audit
                        .record(
                            AuditEntry::new(project_id, AuditAction::ChangeDetectionFailed, "datasource")
                                .actor(actor)
                                .resource(datasource_id)
                                .details(json!({ "error": e.to_string() })),
                        )
                        .await;
                    None
                }
            };

        let entities_marked_stale = self.mark_stale_entities(project_id, &result).await;

        info!(
            "Refreshed datasource {}: {} tables upserted, {} removed, {} relationships created, {} changes recorded",
            datasource_id,
            result.tables_upserted,
            result.tables_deleted,
            result.relationships_created,
            changes_recorded.map_or_else(|| "no".to_string(), |n| n.to_string())
        );
        self.audit
            .record(
                AuditEntry::new(project_id, AuditAction::SchemaRefreshed, "datasource")
                    .actor(actor)
                    .resource(datasource_id)
                    .details(json!({
                        "fingerprint": result.fingerprint,
                        "newTables": result.new_table_names,
                        "removedTables": result.removed_table_names,
                        "changesRecorded": changes_recorded,
                    })),
            )
            .await;

        Ok(RefreshOutcome {
            result,
            changes_recorded,
            entities_marked_stale,
        })
    }

    async fn mark_stale_entities(&self, project_id: Uuid, result: &RefreshResult) -> u64 {
        let removed: Vec<TableKey> = result
            .removed_table_names
            .iter()
            .filter_map(|name| match split_qualified(name) {
                (Some(schema), table) => Some((schema.to_string(), table.to_string())),
                (None, _) => None,
            })
            .collect();
        if removed.is_empty() {
            return 0;
        }

        match self.ontology.mark_entities_stale(project_id, &removed).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to mark entities stale for project {}: {}", project_id, e);
                0
            }
        }
    }
}
