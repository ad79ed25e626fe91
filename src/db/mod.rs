//! Persistence layer
//!
//! Storage traits for the schema mirror, pending changes and the ontology,
//! with an in-memory implementation (tests, single-node dev) and a
//! PostgreSQL implementation backed by deadpool.

pub mod memory;
pub mod postgres;
pub mod queries;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::AppError;
use crate::models::{
    ChangeStatus, ColumnUpsert, EnrichmentCommit, EntityEnrichment, OntologyEntity,
    OntologyEntityAlias, PendingChange, RelationshipKind, RelationshipUpsert, SchemaColumn,
    SchemaRelationship, SchemaTable, TableUpsert, UpsertOutcome,
};
use async_trait::async_trait;
use std::collections::HashSet;
use uuid::Uuid;

/// (schema name, table name)
pub type TableKey = (String, String);

/// Mirror of tables, columns and relationships.
///
/// Listing and lookup methods only return live rows; soft-deleted rows are
/// kept for audit but are invisible here.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn list_tables(&self, datasource_id: Uuid) -> Result<Vec<SchemaTable>, AppError>;

    async fn list_project_tables(&self, project_id: Uuid) -> Result<Vec<SchemaTable>, AppError>;

    async fn get_table(&self, id: Uuid) -> Result<Option<SchemaTable>, AppError>;

    /// Look a table up by name inside a project; `schema_name` narrows the
    /// search when the caller has it
    async fn find_table(
        &self,
        project_id: Uuid,
        schema_name: Option<&str>,
        table_name: &str,
    ) -> Result<Option<SchemaTable>, AppError>;

    /// Like [`find_table`](Self::find_table), restricted to one datasource
    async fn find_datasource_table(
        &self,
        datasource_id: Uuid,
        schema_name: Option<&str>,
        table_name: &str,
    ) -> Result<Option<SchemaTable>, AppError>;

    /// Insert or update by natural key. Revives a soft-deleted row.
    async fn upsert_table(&self, upsert: TableUpsert) -> Result<SchemaTable, AppError>;

    /// Soft-delete every live table of the datasource whose key is not in
    /// `active`, together with its columns. Returns the tables removed.
    async fn soft_delete_tables_except(
        &self,
        datasource_id: Uuid,
        active: &HashSet<TableKey>,
    ) -> Result<Vec<SchemaTable>, AppError>;

    /// Deselecting a table also deselects its columns
    async fn set_table_selected(&self, id: Uuid, selected: bool) -> Result<(), AppError>;

    async fn list_columns(&self, table_id: Uuid) -> Result<Vec<SchemaColumn>, AppError>;

    async fn get_column(&self, id: Uuid) -> Result<Option<SchemaColumn>, AppError>;

    async fn find_column(
        &self,
        table_id: Uuid,
        column_name: &str,
    ) -> Result<Option<SchemaColumn>, AppError>;

    /// Insert or update by (table, column name). Revives a soft-deleted row.
    async fn upsert_column(&self, upsert: ColumnUpsert) -> Result<SchemaColumn, AppError>;

    /// Soft-delete every live column of the table whose name is not in
    /// `active`. Returns the columns removed.
    async fn soft_delete_columns_except(
        &self,
        table_id: Uuid,
        active: &HashSet<String>,
    ) -> Result<Vec<SchemaColumn>, AppError>;

    /// Selecting a column also selects its owning table
    async fn set_column_selected(&self, id: Uuid, selected: bool) -> Result<(), AppError>;

    async fn list_relationships(&self, project_id: Uuid)
        -> Result<Vec<SchemaRelationship>, AppError>;

    async fn get_relationship(&self, id: Uuid) -> Result<Option<SchemaRelationship>, AppError>;

    async fn find_relationship(
        &self,
        source_column_id: Uuid,
        target_column_id: Uuid,
        kind: RelationshipKind,
    ) -> Result<Option<SchemaRelationship>, AppError>;

    /// Insert or update by (source column, target column, kind). An existing
    /// row, live or removed, whose effective source outranks
    /// `upsert.created_by` is returned untouched as [`UpsertOutcome::Protected`].
    async fn upsert_relationship(
        &self,
        upsert: RelationshipUpsert,
    ) -> Result<(SchemaRelationship, UpsertOutcome), AppError>;

    async fn update_relationship(&self, relationship: &SchemaRelationship) -> Result<(), AppError>;

    /// Soft-delete live relationships whose source or target column is gone
    async fn soft_delete_orphan_relationships(&self, project_id: Uuid) -> Result<u64, AppError>;
}

/// Pending change records
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// All-or-nothing batch insert
    async fn create_changes(&self, changes: &[PendingChange]) -> Result<(), AppError>;

    async fn list_changes(
        &self,
        project_id: Uuid,
        status: Option<ChangeStatus>,
    ) -> Result<Vec<PendingChange>, AppError>;

    async fn update_change_status(
        &self,
        id: Uuid,
        status: ChangeStatus,
        reviewed_by: Option<&str>,
    ) -> Result<(), AppError>;
}

/// Ontology entities and aliases
#[async_trait]
pub trait OntologyStore: Send + Sync {
    async fn list_entities(&self, project_id: Uuid) -> Result<Vec<OntologyEntity>, AppError>;

    async fn get_entity(&self, id: Uuid) -> Result<Option<OntologyEntity>, AppError>;

    async fn create_entity(&self, entity: &OntologyEntity) -> Result<(), AppError>;

    async fn update_entity(&self, entity: &OntologyEntity) -> Result<(), AppError>;

    async fn list_aliases(&self, entity_id: Uuid) -> Result<Vec<OntologyEntityAlias>, AppError>;

    /// Fails with `Conflict` when the (entity, alias) pair exists
    async fn create_alias(&self, alias: &OntologyEntityAlias) -> Result<(), AppError>;

    /// Commit a whole enrichment run atomically: names, descriptions,
    /// semantic confidence and aliases. Aliases already present are skipped.
    /// Entities now owned by a source that outranks `Inferred` are left
    /// alone, aliases included, and reported in [`EnrichmentCommit::skipped`].
    async fn apply_enrichment(
        &self,
        project_id: Uuid,
        updates: &[EntityEnrichment],
    ) -> Result<EnrichmentCommit, AppError>;

    /// Flag entities whose primary table was removed from the mirror
    async fn mark_entities_stale(&self, project_id: Uuid, tables: &[TableKey])
        -> Result<u64, AppError>;
}
