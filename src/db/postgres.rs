//! PostgreSQL store
//!
//! Implements the persistence traits over a deadpool pool. Natural-key
//! upserts are single `INSERT ... ON CONFLICT` statements; every multi-row
//! write runs inside one transaction.

use super::queries;
use super::{ChangeStore, OntologyStore, SchemaStore, TableKey};
use crate::error::AppError;
use crate::models::{
    ChangeStatus, ColumnUpsert, EnrichmentCommit, EntityEnrichment, OntologyEntity,
    OntologyEntityAlias, PendingChange, RelationshipKind, RelationshipUpsert, SchemaColumn,
    SchemaDelta, SchemaRelationship, SchemaTable, SuggestedAction, TableUpsert, UpsertOutcome,
    ALIAS_SOURCE_ENRICHMENT, SEMANTIC_CONFIDENCE,
};
use crate::provenance::Provenance;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use serde_json::Value;
use std::collections::HashSet;
use tokio_postgres::Row;
use tracing::debug;
use uuid::Uuid;

/// Metadata store backed by PostgreSQL
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create the metadata tables if they do not exist
    pub async fn migrate(&self) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client.batch_execute(queries::CREATE_METADATA_TABLES).await?;
        debug!("Metadata tables ready");
        Ok(())
    }
}

fn table_from_row(row: &Row) -> SchemaTable {
    SchemaTable {
        id: row.get("id"),
        project_id: row.get("project_id"),
        datasource_id: row.get("datasource_id"),
        schema_name: row.get("schema_name"),
        table_name: row.get("table_name"),
        row_count: row.get("row_count"),
        is_selected: row.get("is_selected"),
        removed_at: row.get("removed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn column_from_row(row: &Row) -> SchemaColumn {
    SchemaColumn {
        id: row.get("id"),
        table_id: row.get("table_id"),
        column_name: row.get("column_name"),
        data_type: row.get("data_type"),
        is_nullable: row.get("is_nullable"),
        is_primary_key: row.get("is_primary_key"),
        is_unique: row.get("is_unique"),
        ordinal_position: row.get("ordinal_position"),
        default_value: row.get("default_value"),
        is_selected: row.get("is_selected"),
        removed_at: row.get("removed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn relationship_from_row(row: &Row) -> Result<SchemaRelationship, AppError> {
    Ok(SchemaRelationship {
        id: row.get("id"),
        project_id: row.get("project_id"),
        source_table_id: row.get("source_table_id"),
        source_column_id: row.get("source_column_id"),
        target_table_id: row.get("target_table_id"),
        target_column_id: row.get("target_column_id"),
        kind: row.get::<_, String>("kind").parse().map_err(AppError::Internal)?,
        cardinality: row
            .get::<_, String>("cardinality")
            .parse()
            .map_err(AppError::Internal)?,
        confidence: row.get("confidence"),
        is_approved: row.get("is_approved"),
        created_by: Provenance::from(row.get::<_, String>("created_by")),
        updated_by: row.get::<_, Option<String>>("updated_by").map(Provenance::from),
        removed_at: row.get("removed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn change_from_row(row: &Row) -> Result<PendingChange, AppError> {
    let change_type = row
        .get::<_, String>("change_type")
        .parse()
        .map_err(AppError::Internal)?;
    let old_value: Option<Value> = row.get("old_value");
    let new_value: Option<Value> = row.get("new_value");
    let delta = SchemaDelta::from_parts(
        change_type,
        row.get("table_name"),
        row.get("column_name"),
        old_value.as_ref(),
        new_value.as_ref(),
    )
    .map_err(AppError::Internal)?;

    let action: Option<String> = row.get("suggested_action");
    let payload: Option<Value> = row.get("suggested_payload");
    let suggestion = action.and_then(|tag| SuggestedAction::from_parts(&tag, payload.as_ref()));

    Ok(PendingChange {
        id: row.get("id"),
        project_id: row.get("project_id"),
        datasource_id: row.get("datasource_id"),
        delta,
        source: crate::models::ChangeSource::SchemaRefresh,
        status: row
            .get::<_, String>("status")
            .parse()
            .map_err(AppError::Internal)?,
        suggestion,
        reviewed_by: row.get("reviewed_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        reviewed_at: row.get("reviewed_at"),
    })
}

fn entity_from_row(row: &Row) -> OntologyEntity {
    OntologyEntity {
        id: row.get("id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        description: row.get("description"),
        domain: row.get("domain"),
        primary_schema: row.get("primary_schema"),
        primary_table: row.get("primary_table"),
        primary_column: row.get("primary_column"),
        confidence: row.get("confidence"),
        created_by: Provenance::from(row.get::<_, String>("created_by")),
        updated_by: row.get::<_, Option<String>>("updated_by").map(Provenance::from),
        is_stale: row.get("is_stale"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn alias_from_row(row: &Row) -> OntologyEntityAlias {
    OntologyEntityAlias {
        id: row.get("id"),
        entity_id: row.get("entity_id"),
        alias: row.get("alias"),
        source: row.get("source"),
        created_at: row.get("created_at"),
    }
}

fn split_keys(keys: &[TableKey]) -> (Vec<&str>, Vec<&str>) {
    keys.iter().map(|(s, t)| (s.as_str(), t.as_str())).unzip()
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
}

#[async_trait]
impl SchemaStore for PgStore {
    async fn list_tables(&self, datasource_id: Uuid) -> Result<Vec<SchemaTable>, AppError> {
        let client = self.pool.get().await?;
        let rows = client.query(&queries::list_tables(), &[&datasource_id]).await?;
        Ok(rows.iter().map(table_from_row).collect())
    }

    async fn list_project_tables(&self, project_id: Uuid) -> Result<Vec<SchemaTable>, AppError> {
        let client = self.pool.get().await?;
        let rows = client.query(&queries::list_project_tables(), &[&project_id]).await?;
        Ok(rows.iter().map(table_from_row).collect())
    }

    async fn get_table(&self, id: Uuid) -> Result<Option<SchemaTable>, AppError> {
        let client = self.pool.get().await?;
        let row = client.query_opt(&queries::get_table(), &[&id]).await?;
        Ok(row.as_ref().map(table_from_row))
    }

    async fn find_table(
        &self,
        project_id: Uuid,
        schema_name: Option<&str>,
        table_name: &str,
    ) -> Result<Option<SchemaTable>, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(&queries::find_table(), &[&project_id, &schema_name, &table_name])
            .await?;
        Ok(row.as_ref().map(table_from_row))
    }

    async fn find_datasource_table(
        &self,
        datasource_id: Uuid,
        schema_name: Option<&str>,
        table_name: &str,
    ) -> Result<Option<SchemaTable>, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &queries::find_datasource_table(),
                &[&datasource_id, &schema_name, &table_name],
            )
            .await?;
        Ok(row.as_ref().map(table_from_row))
    }

    async fn upsert_table(&self, upsert: TableUpsert) -> Result<SchemaTable, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &queries::upsert_table(),
                &[
                    &Uuid::new_v4(),
                    &upsert.project_id,
                    &upsert.datasource_id,
                    &upsert.schema_name,
                    &upsert.table_name,
                    &upsert.row_count,
                    &upsert.select,
                ],
            )
            .await?;
        Ok(table_from_row(&row))
    }

    async fn soft_delete_tables_except(
        &self,
        datasource_id: Uuid,
        active: &HashSet<TableKey>,
    ) -> Result<Vec<SchemaTable>, AppError> {
        let keys: Vec<TableKey> = active.iter().cloned().collect();
        let (schemas, names) = split_keys(&keys);

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let rows = tx
            .query(
                &queries::soft_delete_tables_except(),
                &[&datasource_id, &schemas, &names],
            )
            .await?;
        let removed: Vec<SchemaTable> = rows.iter().map(table_from_row).collect();
        let ids: Vec<Uuid> = removed.iter().map(|t| t.id).collect();
        if !ids.is_empty() {
            tx.execute(queries::SOFT_DELETE_COLUMNS_OF_TABLES, &[&ids]).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn set_table_selected(&self, id: Uuid, selected: bool) -> Result<(), AppError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let updated = tx.execute(queries::SET_TABLE_SELECTED, &[&id, &selected]).await?;
        if updated == 0 {
            return Err(AppError::NotFound(format!("Table {} not found", id)));
        }
        if !selected {
            tx.execute(queries::DESELECT_TABLE_COLUMNS, &[&id]).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_columns(&self, table_id: Uuid) -> Result<Vec<SchemaColumn>, AppError> {
        let client = self.pool.get().await?;
        let rows = client.query(&queries::list_columns(), &[&table_id]).await?;
        Ok(rows.iter().map(column_from_row).collect())
    }

    async fn get_column(&self, id: Uuid) -> Result<Option<SchemaColumn>, AppError> {
        let client = self.pool.get().await?;
        let row = client.query_opt(&queries::get_column(), &[&id]).await?;
        Ok(row.as_ref().map(column_from_row))
    }

    async fn find_column(
        &self,
        table_id: Uuid,
        column_name: &str,
    ) -> Result<Option<SchemaColumn>, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(&queries::find_column(), &[&table_id, &column_name])
            .await?;
        Ok(row.as_ref().map(column_from_row))
    }

    async fn upsert_column(&self, upsert: ColumnUpsert) -> Result<SchemaColumn, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &queries::upsert_column(),
                &[
                    &Uuid::new_v4(),
                    &upsert.table_id,
                    &upsert.column_name,
                    &upsert.data_type,
                    &upsert.is_nullable,
                    &upsert.is_primary_key,
                    &upsert.is_unique,
                    &upsert.ordinal_position,
                    &upsert.default_value,
                    &upsert.select,
                ],
            )
            .await?;
        Ok(column_from_row(&row))
    }

    async fn soft_delete_columns_except(
        &self,
        table_id: Uuid,
        active: &HashSet<String>,
    ) -> Result<Vec<SchemaColumn>, AppError> {
        let names: Vec<&str> = active.iter().map(String::as_str).collect();
        let client = self.pool.get().await?;
        let rows = client
            .query(&queries::soft_delete_columns_except(), &[&table_id, &names])
            .await?;
        Ok(rows.iter().map(column_from_row).collect())
    }

    async fn set_column_selected(&self, id: Uuid, selected: bool) -> Result<(), AppError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(queries::SET_COLUMN_SELECTED, &[&id, &selected])
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Column {} not found", id)))?;
        if selected {
            let table_id: Uuid = row.get("table_id");
            tx.execute(queries::SELECT_TABLE_OF_COLUMN, &[&table_id]).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_relationships(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<SchemaRelationship>, AppError> {
        let client = self.pool.get().await?;
        let rows = client.query(&queries::list_relationships(), &[&project_id]).await?;
        rows.iter().map(relationship_from_row).collect()
    }

    async fn get_relationship(&self, id: Uuid) -> Result<Option<SchemaRelationship>, AppError> {
        let client = self.pool.get().await?;
        let row = client.query_opt(&queries::get_relationship(), &[&id]).await?;
        row.as_ref().map(relationship_from_row).transpose()
    }

    async fn find_relationship(
        &self,
        source_column_id: Uuid,
        target_column_id: Uuid,
        kind: RelationshipKind,
    ) -> Result<Option<SchemaRelationship>, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &queries::find_relationship(),
                &[&source_column_id, &target_column_id, &kind.as_str()],
            )
            .await?;
        row.as_ref().map(relationship_from_row).transpose()
    }

    async fn upsert_relationship(
        &self,
        upsert: RelationshipUpsert,
    ) -> Result<(SchemaRelationship, UpsertOutcome), AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &queries::upsert_relationship(),
                &[
                    &Uuid::new_v4(),
                    &upsert.project_id,
                    &upsert.source_table_id,
                    &upsert.source_column_id,
                    &upsert.target_table_id,
                    &upsert.target_column_id,
                    &upsert.kind.as_str(),
                    &upsert.cardinality.as_str(),
                    &upsert.confidence,
                    &upsert.is_approved,
                    &upsert.created_by.as_str(),
                ],
            )
            .await?;
        if let Some(row) = row {
            let outcome = if row.get::<_, bool>("created") {
                UpsertOutcome::Created
            } else {
                UpsertOutcome::Updated
            };
            return Ok((relationship_from_row(&row)?, outcome));
        }

        // The conflict update was vetoed, so the row exists and outranks us
        let row = client
            .query_one(
                &queries::find_relationship_any(),
                &[&upsert.source_column_id, &upsert.target_column_id, &upsert.kind.as_str()],
            )
            .await?;
        Ok((relationship_from_row(&row)?, UpsertOutcome::Protected))
    }

    async fn update_relationship(&self, relationship: &SchemaRelationship) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                queries::UPDATE_RELATIONSHIP,
                &[
                    &relationship.id,
                    &relationship.cardinality.as_str(),
                    &relationship.confidence,
                    &relationship.is_approved,
                    &relationship.updated_by.map(|p| p.as_str()),
                    &relationship.removed_at,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(AppError::NotFound(format!(
                "Relationship {} not found",
                relationship.id
            )));
        }
        Ok(())
    }

    async fn soft_delete_orphan_relationships(&self, project_id: Uuid) -> Result<u64, AppError> {
        let client = self.pool.get().await?;
        Ok(client
            .execute(queries::SOFT_DELETE_ORPHAN_RELATIONSHIPS, &[&project_id])
            .await?)
    }
}

#[async_trait]
impl ChangeStore for PgStore {
    async fn create_changes(&self, changes: &[PendingChange]) -> Result<(), AppError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let stmt = tx.prepare(queries::INSERT_CHANGE).await?;
        for change in changes {
            let suggestion_tag = change.suggestion.as_ref().map(|s| s.tag());
            let suggestion_payload = change.suggestion.as_ref().map(|s| s.payload());
            tx.execute(
                &stmt,
                &[
                    &change.id,
                    &change.project_id,
                    &change.change_type().as_str(),
                    &change.source.as_str(),
                    &change.delta.table_name(),
                    &change.delta.column_name(),
                    &change.delta.old_value(),
                    &change.delta.new_value(),
                    &suggestion_tag,
                    &suggestion_payload,
                    &change.status.as_str(),
                    &change.reviewed_by,
                    &change.created_at,
                    &change.updated_at,
                    &change.reviewed_at,
                    &change.datasource_id,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_changes(
        &self,
        project_id: Uuid,
        status: Option<ChangeStatus>,
    ) -> Result<Vec<PendingChange>, AppError> {
        let client = self.pool.get().await?;
        let status = status.map(|s| s.as_str());
        let rows = client.query(queries::LIST_CHANGES, &[&project_id, &status]).await?;
        rows.iter().map(change_from_row).collect()
    }

    async fn update_change_status(
        &self,
        id: Uuid,
        status: ChangeStatus,
        reviewed_by: Option<&str>,
    ) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(queries::UPDATE_CHANGE_STATUS, &[&id, &status.as_str(), &reviewed_by])
            .await?;
        if updated == 0 {
            return Err(AppError::NotFound(format!("Change {} not found", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl OntologyStore for PgStore {
    async fn list_entities(&self, project_id: Uuid) -> Result<Vec<OntologyEntity>, AppError> {
        let client = self.pool.get().await?;
        let rows = client.query(&queries::list_entities(), &[&project_id]).await?;
        Ok(rows.iter().map(entity_from_row).collect())
    }

    async fn get_entity(&self, id: Uuid) -> Result<Option<OntologyEntity>, AppError> {
        let client = self.pool.get().await?;
        let row = client.query_opt(&queries::get_entity(), &[&id]).await?;
        Ok(row.as_ref().map(entity_from_row))
    }

    async fn create_entity(&self, entity: &OntologyEntity) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client
            .execute(
                queries::INSERT_ENTITY,
                &[
                    &entity.id,
                    &entity.project_id,
                    &entity.name,
                    &entity.description,
                    &entity.domain,
                    &entity.primary_schema,
                    &entity.primary_table,
                    &entity.primary_column,
                    &entity.confidence,
                    &entity.created_by.as_str(),
                    &entity.updated_by.map(|p| p.as_str()),
                    &entity.is_stale,
                    &entity.created_at,
                    &entity.updated_at,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(format!("Entity {} already exists", entity.id))
                } else {
                    AppError::Database(e)
                }
            })?;
        Ok(())
    }

    async fn update_entity(&self, entity: &OntologyEntity) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                queries::UPDATE_ENTITY,
                &[
                    &entity.id,
                    &entity.name,
                    &entity.description,
                    &entity.domain,
                    &entity.confidence,
                    &entity.updated_by.map(|p| p.as_str()),
                    &entity.is_stale,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(AppError::NotFound(format!("Entity {} not found", entity.id)));
        }
        Ok(())
    }

    async fn list_aliases(&self, entity_id: Uuid) -> Result<Vec<OntologyEntityAlias>, AppError> {
        let client = self.pool.get().await?;
        let rows = client.query(queries::LIST_ALIASES, &[&entity_id]).await?;
        Ok(rows.iter().map(alias_from_row).collect())
    }

    async fn create_alias(&self, alias: &OntologyEntityAlias) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client
            .execute(
                queries::INSERT_ALIAS,
                &[
                    &alias.id,
                    &alias.entity_id,
                    &alias.alias,
                    &alias.source,
                    &alias.created_at,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(format!(
                        "Alias '{}' already exists for entity {}",
                        alias.alias, alias.entity_id
                    ))
                } else {
                    AppError::Database(e)
                }
            })?;
        Ok(())
    }

    async fn apply_enrichment(
        &self,
        project_id: Uuid,
        updates: &[EntityEnrichment],
    ) -> Result<EnrichmentCommit, AppError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let updated_by = Provenance::Inferred.as_str();
        let enrich = tx.prepare(&queries::enrich_entity()).await?;

        let mut commit = EnrichmentCommit::default();
        for update in updates {
            let touched = tx
                .execute(
                    &enrich,
                    &[
                        &update.entity_id,
                        &project_id,
                        &update.name,
                        &update.description,
                        &update.domain,
                        &SEMANTIC_CONFIDENCE,
                        &updated_by,
                    ],
                )
                .await?;
            if touched == 0 {
                let exists = tx
                    .query_opt(queries::ENTITY_IN_PROJECT, &[&update.entity_id, &project_id])
                    .await?
                    .is_some();
                if !exists {
                    // Dropping the transaction rolls it back
                    return Err(AppError::NotFound(format!(
                        "Entity {} not found in project {}",
                        update.entity_id, project_id
                    )));
                }
                commit.skipped.push(update.entity_id);
                continue;
            }
            commit.entities_updated += 1;

            for alias in &update.aliases {
                commit.aliases_created += tx
                    .execute(
                        queries::INSERT_ALIAS_IF_ABSENT,
                        &[&Uuid::new_v4(), &update.entity_id, alias, &ALIAS_SOURCE_ENRICHMENT],
                    )
                    .await? as usize;
            }
        }

        tx.commit().await?;
        Ok(commit)
    }

    async fn mark_entities_stale(
        &self,
        project_id: Uuid,
        tables: &[TableKey],
    ) -> Result<u64, AppError> {
        let (schemas, names) = split_keys(tables);
        let client = self.pool.get().await?;
        Ok(client
            .execute(queries::MARK_ENTITIES_STALE, &[&project_id, &schemas, &names])
            .await?)
    }
}
