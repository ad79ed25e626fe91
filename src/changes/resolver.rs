//! Change resolver
//!
//! Applies review decisions to pending changes and keeps the selection flag
//! of the underlying table or column in lockstep with the decision, so a
//! rejected element never stays in the effective schema.
//!
//! Both operations only touch changes that are still pending, and a failure
//! on one change is logged and counted without stopping the rest.

use crate::db::{ChangeStore, SchemaStore};
use crate::error::AppError;
use crate::models::{split_qualified, ChangeStatus, PendingChange, SchemaDelta};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Tables and `table.column` names the reviewer wants in the schema.
/// Either qualified (`public.orders`) or bare (`orders`) names match.
#[derive(Debug, Clone, Default)]
pub struct SelectionSet {
    tables: HashSet<String>,
    columns: HashSet<String>,
}

impl SelectionSet {
    pub fn new(
        tables: impl IntoIterator<Item = String>,
        columns: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            tables: tables.into_iter().collect(),
            columns: columns.into_iter().collect(),
        }
    }

    pub fn contains_table(&self, table_name: &str) -> bool {
        let (_, bare) = split_qualified(table_name);
        self.tables.contains(table_name) || self.tables.contains(bare)
    }

    pub fn contains_column(&self, table_name: &str, column_name: &str) -> bool {
        let (_, bare) = split_qualified(table_name);
        self.columns.contains(&format!("{}.{}", table_name, column_name))
            || self.columns.contains(&format!("{}.{}", bare, column_name))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionSummary {
    pub approved: usize,
    pub rejected: usize,
    /// Pending changes this operation has no decision for
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Approve,
    Reject,
    Skip,
}

impl Decision {
    fn status(self) -> Option<ChangeStatus> {
        match self {
            Decision::Approve => Some(ChangeStatus::Approved),
            Decision::Reject => Some(ChangeStatus::Rejected),
            Decision::Skip => None,
        }
    }
}

pub struct ChangeResolver {
    schema: Arc<dyn SchemaStore>,
    changes: Arc<dyn ChangeStore>,
}

impl ChangeResolver {
    pub fn new(schema: Arc<dyn SchemaStore>, changes: Arc<dyn ChangeStore>) -> Self {
        Self { schema, changes }
    }

    /// Approve pending changes whose element is in `selection`, reject the rest
    pub async fn resolve_by_selection(
        &self,
        project_id: Uuid,
        selection: &SelectionSet,
        reviewer: Option<&str>,
    ) -> Result<ResolutionSummary, AppError> {
        let summary = self
            .resolve_with(project_id, reviewer, |delta| match delta {
                SchemaDelta::NewTable { table_name } => {
                    if selection.contains_table(table_name) {
                        Decision::Approve
                    } else {
                        Decision::Reject
                    }
                }
                SchemaDelta::NewColumn { table_name, column_name, .. }
                | SchemaDelta::ModifiedColumn { table_name, column_name, .. } => {
                    if selection.contains_column(table_name, column_name) {
                        Decision::Approve
                    } else {
                        Decision::Reject
                    }
                }
                SchemaDelta::DroppedTable { .. } | SchemaDelta::DroppedColumn { .. } => {
                    Decision::Skip
                }
            })
            .await?;

        info!(
            "Resolved changes for project {}: {} approved, {} rejected, {} skipped, {} failed",
            project_id, summary.approved, summary.rejected, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    /// Reject every pending change
    pub async fn reject_all(
        &self,
        project_id: Uuid,
        reviewer: Option<&str>,
    ) -> Result<ResolutionSummary, AppError> {
        let summary = self
            .resolve_with(project_id, reviewer, |_| Decision::Reject)
            .await?;

        info!(
            "Rejected all changes for project {}: {} rejected, {} failed",
            project_id, summary.rejected, summary.failed
        );
        Ok(summary)
    }

    async fn resolve_with<F>(
        &self,
        project_id: Uuid,
        reviewer: Option<&str>,
        decide: F,
    ) -> Result<ResolutionSummary, AppError>
    where
        F: Fn(&SchemaDelta) -> Decision,
    {
        let pending = self
            .changes
            .list_changes(project_id, Some(ChangeStatus::Pending))
            .await?;

        let mut summary = ResolutionSummary::default();
        for change in &pending {
            let decision = decide(&change.delta);
            let Some(status) = decision.status() else {
                summary.skipped += 1;
                continue;
            };

            if let Err(e) = self.apply(project_id, change, decision, status, reviewer).await {
                warn!(
                    "Failed to resolve change {} ({} on {}): {}",
                    change.id,
                    change.change_type(),
                    change.delta.table_name(),
                    e
                );
                summary.failed += 1;
                continue;
            }

            match decision {
                Decision::Approve => summary.approved += 1,
                Decision::Reject => summary.rejected += 1,
                Decision::Skip => {}
            }
        }
        Ok(summary)
    }

    async fn apply(
        &self,
        project_id: Uuid,
        change: &PendingChange,
        decision: Decision,
        status: ChangeStatus,
        reviewer: Option<&str>,
    ) -> Result<(), AppError> {
        self.changes
            .update_change_status(change.id, status, reviewer)
            .await?;

        let selected = decision == Decision::Approve;
        if let Err(e) = self.sync_selection(change.datasource_id, &change.delta, selected).await {
            // Back to pending so the next run retries both halves
            if let Err(revert) = self
                .changes
                .update_change_status(change.id, ChangeStatus::Pending, None)
                .await
            {
                warn!(
                    "Change {} in project {} is {} but its selection was not updated: {}",
                    change.id,
                    project_id,
                    status.as_str(),
                    revert
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Flip the selection flag of the element a change is about, inside the
    /// datasource that reported it. Rows that no longer exist have nothing to
    /// keep in step.
    async fn sync_selection(
        &self,
        datasource_id: Uuid,
        delta: &SchemaDelta,
        selected: bool,
    ) -> Result<(), AppError> {
        match delta {
            SchemaDelta::NewTable { table_name } => {
                let (schema, bare) = split_qualified(table_name);
                match self.schema.find_datasource_table(datasource_id, schema, bare).await? {
                    Some(table) => self.schema.set_table_selected(table.id, selected).await,
                    None => {
                        warn!("Table {} no longer in the mirror, selection unchanged", table_name);
                        Ok(())
                    }
                }
            }
            SchemaDelta::NewColumn { table_name, column_name, .. } => {
                let (schema, bare) = split_qualified(table_name);
                let Some(table) =
                    self.schema.find_datasource_table(datasource_id, schema, bare).await?
                else {
                    warn!("Table {} no longer in the mirror, selection unchanged", table_name);
                    return Ok(());
                };
                match self.schema.find_column(table.id, column_name).await? {
                    Some(column) => self.schema.set_column_selected(column.id, selected).await,
                    None => {
                        warn!(
                            "Column {}.{} no longer in the mirror, selection unchanged",
                            table_name, column_name
                        );
                        Ok(())
                    }
                }
            }
            // A type change does not alter membership in the schema
            SchemaDelta::ModifiedColumn { .. }
            | SchemaDelta::DroppedTable { .. }
            | SchemaDelta::DroppedColumn { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_EXCLUDE_PATTERNS;
    use crate::changes::ChangeClassifier;
    use crate::db::MemoryStore;
    use crate::introspection::fixtures::{column, StaticDiscoverer};
    use crate::db::TableKey;
    use crate::models::{
        ChangeType, ColumnUpsert, RelationshipKind, RelationshipUpsert, SchemaColumn,
        SchemaRelationship, SchemaTable, TableUpsert, UpsertOutcome,
    };
    use crate::sync::{AutoSelectPolicy, SchemaSynchronizer};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: Arc<MemoryStore>,
        resolver: ChangeResolver,
        project: Uuid,
    }

    /// Mirror with an existing `orders` table, then a refresh that adds
    /// `users`, `tmp_staging` and `orders.currency`
    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let policy = Arc::new(AutoSelectPolicy::new(DEFAULT_EXCLUDE_PATTERNS).unwrap());
        let sync = SchemaSynchronizer::new(store.clone(), policy);
        let (project, datasource) = (Uuid::new_v4(), Uuid::new_v4());

        let before = StaticDiscoverer::new()
            .with_table("public", "orders", vec![column("id", "integer", 1)]);
        sync.sync(project, datasource, &before, true).await.unwrap();

        let after = StaticDiscoverer::new()
            .with_table(
                "public",
                "orders",
                vec![column("id", "integer", 1), column("currency", "text", 2)],
            )
            .with_table("public", "users", vec![column("id", "integer", 1)])
            .with_table("public", "tmp_staging", vec![column("id", "integer", 1)]);
        let result = sync.sync(project, datasource, &after, true).await.unwrap();
        ChangeClassifier::record(store.as_ref(), project, &result).await.unwrap();

        Fixture {
            resolver: ChangeResolver::new(store.clone(), store.clone()),
            store,
            project,
        }
    }

    impl Fixture {
        async fn table_selected(&self, name: &str) -> bool {
            self.store
                .find_table(self.project, None, name)
                .await
                .unwrap()
                .unwrap()
                .is_selected
        }

        async fn column_selected(&self, table: &str, name: &str) -> bool {
            let table = self.store.find_table(self.project, None, table).await.unwrap().unwrap();
            self.store
                .find_column(table.id, name)
                .await
                .unwrap()
                .unwrap()
                .is_selected
        }
    }

    #[test]
    fn test_selection_set_matches_qualified_and_bare_names() {
        let selection = SelectionSet::new(
            vec!["orders".to_string(), "sales.invoices".to_string()],
            vec!["public.orders.total".to_string(), "users.email".to_string()],
        );
        assert!(selection.contains_table("public.orders"));
        assert!(selection.contains_table("sales.invoices"));
        assert!(!selection.contains_table("public.invoices"));
        assert!(selection.contains_column("public.orders", "total"));
        assert!(selection.contains_column("public.users", "email"));
        assert!(!selection.contains_column("public.orders", "email"));
    }

    #[tokio::test]
    async fn test_reject_all_deselects_rejected_rows() {
        let f = fixture().await;
        assert!(f.table_selected("users").await);

        let summary = f.resolver.reject_all(f.project, Some("reviewer")).await.unwrap();
        assert_eq!(summary.rejected, 3);
        assert_eq!(summary.failed, 0);

        let changes = f.store.list_changes(f.project, None).await.unwrap();
        for change in &changes {
            assert_eq!(change.status, ChangeStatus::Rejected);
            assert_eq!(change.reviewed_by.as_deref(), Some("reviewer"));
        }
        assert!(!f.table_selected("users").await);
        assert!(!f.table_selected("tmp_staging").await);
        assert!(!f.column_selected("orders", "currency").await);
        // The existing table is not part of any change
        assert!(f.table_selected("orders").await);

        let again = f.resolver.reject_all(f.project, None).await.unwrap();
        assert_eq!(again, ResolutionSummary::default());
    }

    #[tokio::test]
    async fn test_resolve_by_selection() {
        let f = fixture().await;
        let selection = SelectionSet::new(
            vec!["tmp_staging".to_string()],
            vec!["orders.currency".to_string()],
        );

        let summary = f
            .resolver
            .resolve_by_selection(f.project, &selection, Some("reviewer"))
            .await
            .unwrap();
        assert_eq!(summary.approved, 2);
        assert_eq!(summary.rejected, 1);

        let status_of = |changes: &[PendingChange], table: &str, ty: ChangeType| {
            changes
                .iter()
                .find(|c| c.change_type() == ty && c.delta.table_name() == table)
                .map(|c| c.status)
        };
        let changes = f.store.list_changes(f.project, None).await.unwrap();
        assert_eq!(status_of(&changes, "public.tmp_staging", ChangeType::NewTable), Some(ChangeStatus::Approved));
        assert_eq!(status_of(&changes, "public.users", ChangeType::NewTable), Some(ChangeStatus::Rejected));
        assert_eq!(status_of(&changes, "public.orders", ChangeType::NewColumn), Some(ChangeStatus::Approved));

        assert!(f.table_selected("tmp_staging").await);
        assert!(!f.table_selected("users").await);
        assert!(f.column_selected("orders", "currency").await);
    }

    #[tokio::test]
    async fn test_auto_applied_changes_are_never_touched() {
        let store = Arc::new(MemoryStore::new());
        let project = Uuid::new_v4();
        let result = crate::sync::RefreshResult {
            removed_table_names: vec!["public.legacy".to_string()],
            ..Default::default()
        };
        ChangeClassifier::record(store.as_ref(), project, &result).await.unwrap();

        let resolver = ChangeResolver::new(store.clone(), store.clone());
        let summary = resolver.reject_all(project, None).await.unwrap();
        assert_eq!(summary, ResolutionSummary::default());

        let changes = store.list_changes(project, None).await.unwrap();
        assert_eq!(changes[0].status, ChangeStatus::AutoApplied);
    }

    /// Fails status updates for one table, delegates everything else
    struct FlakyChanges {
        inner: Arc<MemoryStore>,
        project: Uuid,
        poisoned: String,
    }

    #[async_trait]
    impl ChangeStore for FlakyChanges {
        async fn create_changes(&self, changes: &[PendingChange]) -> Result<(), AppError> {
            self.inner.create_changes(changes).await
        }

        async fn list_changes(
            &self,
            project_id: Uuid,
            status: Option<ChangeStatus>,
        ) -> Result<Vec<PendingChange>, AppError> {
            self.inner.list_changes(project_id, status).await
        }

        async fn update_change_status(
            &self,
            id: Uuid,
            status: ChangeStatus,
            reviewed_by: Option<&str>,
        ) -> Result<(), AppError> {
            let changes = self.inner.list_changes(self.project, None).await?;
            if changes.iter().any(|c| c.id == id && c.delta.table_name() == self.poisoned) {
                return Err(AppError::Internal("disk full".to_string()));
            }
            self.inner.update_change_status(id, status, reviewed_by).await
        }
    }

    #[tokio::test]
    async fn test_one_failed_update_does_not_block_the_rest() {
        let f = fixture().await;
        let flaky = Arc::new(FlakyChanges {
            inner: f.store.clone(),
            project: f.project,
            poisoned: "public.users".to_string(),
        });
        let resolver = ChangeResolver::new(f.store.clone(), flaky);

        let summary = resolver.reject_all(f.project, None).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rejected, 2);

        let still_pending = f
            .store
            .list_changes(f.project, Some(ChangeStatus::Pending))
            .await
            .unwrap();
        assert_eq!(still_pending.len(), 1);
        assert_eq!(still_pending[0].delta.table_name(), "public.users");
        // The status write failed first, so the selection was never touched
        assert!(f.table_selected("users").await);
        assert!(!f.table_selected("tmp_staging").await);
    }

    /// Fails selection writes for one table, delegates everything else
    struct FlakySchema {
        inner: Arc<MemoryStore>,
        poisoned: Uuid,
    }

    #[async_trait]
    impl SchemaStore for FlakySchema {
        async fn list_tables(&self, datasource_id: Uuid) -> Result<Vec<SchemaTable>, AppError> {
            self.inner.list_tables(datasource_id).await
        }

        async fn list_project_tables(&self, project_id: Uuid) -> Result<Vec<SchemaTable>, AppError> {
            self.inner.list_project_tables(project_id).await
        }

        async fn get_table(&self, id: Uuid) -> Result<Option<SchemaTable>, AppError> {
            self.inner.get_table(id).await
        }

        async fn find_table(
            &self,
            project_id: Uuid,
            schema_name: Option<&str>,
            table_name: &str,
        ) -> Result<Option<SchemaTable>, AppError> {
            self.inner.find_table(project_id, schema_name, table_name).await
        }

        async fn find_datasource_table(
            &self,
            datasource_id: Uuid,
            schema_name: Option<&str>,
            table_name: &str,
        ) -> Result<Option<SchemaTable>, AppError> {
            self.inner.find_datasource_table(datasource_id, schema_name, table_name).await
        }

        async fn upsert_table(&self, upsert: TableUpsert) -> Result<SchemaTable, AppError> {
            self.inner.upsert_table(upsert).await
        }

        async fn soft_delete_tables_except(
            &self,
            datasource_id: Uuid,
            active: &HashSet<TableKey>,
        ) -> Result<Vec<SchemaTable>, AppError> {
            self.inner.soft_delete_tables_except(datasource_id, active).await
        }

        async fn set_table_selected(&self, id: Uuid, selected: bool) -> Result<(), AppError> {
            if id == self.poisoned {
                return Err(AppError::Internal("connection reset".to_string()));
            }
            self.inner.set_table_selected(id, selected).await
        }

        async fn list_columns(&self, table_id: Uuid) -> Result<Vec<SchemaColumn>, AppError> {
            self.inner.list_columns(table_id).await
        }

        async fn get_column(&self, id: Uuid) -> Result<Option<SchemaColumn>, AppError> {
            self.inner.get_column(id).await
        }

        async fn find_column(
            &self,
            table_id: Uuid,
            column_name: &str,
        ) -> Result<Option<SchemaColumn>, AppError> {
            self.inner.find_column(table_id, column_name).await
        }

        async fn upsert_column(&self, upsert: ColumnUpsert) -> Result<SchemaColumn, AppError> {
            self.inner.upsert_column(upsert).await
        }

        async fn soft_delete_columns_except(
            &self,
            table_id: Uuid,
            active: &HashSet<String>,
        ) -> Result<Vec<SchemaColumn>, AppError> {
            self.inner.soft_delete_columns_except(table_id, active).await
        }

        async fn set_column_selected(&self, id: Uuid, selected: bool) -> Result<(), AppError> {
            self.inner.set_column_selected(id, selected).await
        }

        async fn list_relationships(
            &self,
            project_id: Uuid,
        ) -> Result<Vec<SchemaRelationship>, AppError> {
            self.inner.list_relationships(project_id).await
        }

        async fn get_relationship(&self, id: Uuid) -> Result<Option<SchemaRelationship>, AppError> {
            self.inner.get_relationship(id).await
        }

        async fn find_relationship(
            &self,
            source_column_id: Uuid,
            target_column_id: Uuid,
            kind: RelationshipKind,
        ) -> Result<Option<SchemaRelationship>, AppError> {
            self.inner.find_relationship(source_column_id, target_column_id, kind).await
        }

        async fn upsert_relationship(
            &self,
            upsert: RelationshipUpsert,
        ) -> Result<(SchemaRelationship, UpsertOutcome), AppError> {
            self.inner.upsert_relationship(upsert).await
        }

        async fn update_relationship(&self, relationship: &SchemaRelationship) -> Result<(), AppError> {
            self.inner.update_relationship(relationship).await
        }

        async fn soft_delete_orphan_relationships(&self, project_id: Uuid) -> Result<u64, AppError> {
            self.inner.soft_delete_orphan_relationships(project_id).await
        }
    }

    #[tokio::test]
    async fn test_failed_selection_puts_the_change_back() {
        let f = fixture().await;
        let users = f.store.find_table(f.project, None, "users").await.unwrap().unwrap();
        let flaky = Arc::new(FlakySchema {
            inner: f.store.clone(),
            poisoned: users.id,
        });
        let resolver = ChangeResolver::new(flaky, f.store.clone());

        let summary = resolver.reject_all(f.project, Some("reviewer")).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rejected, 2);

        let still_pending = f
            .store
            .list_changes(f.project, Some(ChangeStatus::Pending))
            .await
            .unwrap();
        assert_eq!(still_pending.len(), 1);
        assert_eq!(still_pending[0].delta.table_name(), "public.users");
        assert_eq!(still_pending[0].reviewed_by, None);
        assert_eq!(still_pending[0].reviewed_at, None);
        assert!(f.table_selected("users").await);

        // Once the store recovers the next run finishes the job
        let summary = f.resolver.reject_all(f.project, None).await.unwrap();
        assert_eq!(summary.rejected, 1);
        assert!(!f.table_selected("users").await);
    }

    #[tokio::test]
    async fn test_resolution_stays_inside_the_reporting_datasource() {
        let f = fixture().await;
        let policy = Arc::new(AutoSelectPolicy::new(DEFAULT_EXCLUDE_PATTERNS).unwrap());
        let sync = SchemaSynchronizer::new(f.store.clone(), policy);
        let other = Uuid::new_v4();
        let tables = StaticDiscoverer::new()
            .with_table("public", "users", vec![column("id", "integer", 1)]);
        sync.sync(f.project, other, &tables, true).await.unwrap();

        let summary = f.resolver.reject_all(f.project, None).await.unwrap();
        assert_eq!(summary.rejected, 3);

        let changes = f.store.list_changes(f.project, None).await.unwrap();
        let reporting = changes[0].datasource_id;
        assert!(changes.iter().all(|c| c.datasource_id == reporting));

        let selected_in = |datasource: Uuid| {
            let store = f.store.clone();
            async move {
                store
                    .find_datasource_table(datasource, Some("public"), "users")
                    .await
                    .unwrap()
                    .unwrap()
                    .is_selected
            }
        };
        assert!(!selected_in(reporting).await);
        assert!(selected_in(other).await);
    }
}
