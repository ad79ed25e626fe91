//! Audit log
//!
//! Append-only, in-memory record of refreshes, change resolutions,
//! enrichment runs and rejected writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub project_id: Uuid,
    /// Reviewer identity, `None` for system actions
    pub actor: Option<String>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Option<Uuid>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Schema actions
    SchemaRefreshed,
    ChangeDetectionFailed,

    // Review actions
    ChangesResolved,
    ChangesRejected,

    // Ontology actions
    EntitiesDiscovered,
    EntitiesEnriched,
    EnrichmentFailed,
    PrecedenceViolation,
}

impl AuditEntry {
    pub fn new(project_id: Uuid, action: AuditAction, resource_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            project_id,
            actor: None,
            action,
            resource_type: resource_type.into(),
            resource_id: None,
            details: None,
        }
    }

    pub fn actor(mut self, actor: Option<&str>) -> Self {
        self.actor = actor.map(str::to_string);
        self
    }

    pub fn resource(mut self, id: Uuid) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Default)]
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, entry: AuditEntry) {
        self.entries.write().await.push(entry);
    }

    /// Most recent first
    pub async fn list(
        &self,
        project_id: Uuid,
        action: Option<AuditAction>,
        limit: usize,
    ) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .filter(|e| e.project_id == project_id && action.map_or(true, |a| e.action == a))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let log = AuditLog::new();
        let project = Uuid::new_v4();

        log.record(AuditEntry::new(project, AuditAction::SchemaRefreshed, "datasource")).await;
        log.record(AuditEntry::new(project, AuditAction::EnrichmentFailed, "project")).await;
        log.record(AuditEntry::new(Uuid::new_v4(), AuditAction::SchemaRefreshed, "datasource")).await;

        let all = log.list(project, None, 10).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].action, AuditAction::EnrichmentFailed);

        let failures = log.list(project, Some(AuditAction::EnrichmentFailed), 10).await;
        assert_eq!(failures.len(), 1);
    }
}
