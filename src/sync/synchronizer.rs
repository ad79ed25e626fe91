//! Schema synchronizer
//!
//! Reconciles a freshly discovered schema with the stored mirror. Steps run
//! strictly in order because each one needs ids or soft-delete results from
//! the previous one:
//!
//! 1. load the live mirror for the datasource
//! 2. upsert every discovered table, then its columns
//! 3. soft-delete tables and columns absent from this pass
//! 4. resolve and upsert foreign keys (when the adapter supports them)
//! 5. soft-delete relationships left without a live endpoint
//!
//! Discovery or persistence failures abort the run. An unresolvable
//! foreign-key endpoint is only logged and counted.

use super::policy::AutoSelectPolicy;
use super::result::{ColumnChange, ColumnModification, RefreshResult};
use crate::db::{SchemaStore, TableKey};
use crate::error::AppError;
use crate::introspection::{fingerprint, DiscoveredForeignKey, SchemaDiscoverer};
use crate::models::{
    qualify, Cardinality, ColumnUpsert, RelationshipKind, RelationshipUpsert, SchemaTable,
    TableUpsert, UpsertOutcome,
};
use crate::provenance::Provenance;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SchemaSynchronizer {
    store: Arc<dyn SchemaStore>,
    policy: Arc<AutoSelectPolicy>,
}

/// Columns to keep for one table, swept after all tables are processed
struct ColumnSweep {
    table: SchemaTable,
    active: HashSet<String>,
    report: bool,
}

impl SchemaSynchronizer {
    pub fn new(store: Arc<dyn SchemaStore>, policy: Arc<AutoSelectPolicy>) -> Self {
        Self { store, policy }
    }

    pub async fn sync(
        &self,
        project_id: Uuid,
        datasource_id: Uuid,
        discoverer: &dyn SchemaDiscoverer,
        auto_select: bool,
    ) -> Result<RefreshResult, AppError> {
        let mut result = RefreshResult {
            datasource_id,
            ..Default::default()
        };

        let existing: HashSet<TableKey> = self
            .store
            .list_tables(datasource_id)
            .await?
            .into_iter()
            .map(|t| (t.schema_name, t.table_name))
            .collect();

        let discovered = discoverer.discover_tables().await?;
        let mut snapshot = Vec::with_capacity(discovered.len());
        let mut active_tables: HashSet<TableKey> = HashSet::with_capacity(discovered.len());
        let mut sweeps = Vec::with_capacity(discovered.len());

        for table in discovered {
            let columns = discoverer.discover_columns(&table.schema, &table.table).await?;
            let key = (table.schema.clone(), table.table.clone());
            let is_new = !existing.contains(&key);

            let select_new = is_new && auto_select && self.policy.should_select(&table.table);
            let stored = self
                .store
                .upsert_table(TableUpsert {
                    project_id,
                    datasource_id,
                    schema_name: table.schema.clone(),
                    table_name: table.table.clone(),
                    row_count: table.row_count,
                    select: is_new.then_some(select_new),
                })
                .await?;
            result.tables_upserted += 1;
            if is_new {
                result.new_table_names.push(stored.qualified_name());
            }

            let previous: HashMap<String, String> = if is_new {
                HashMap::new()
            } else {
                self.store
                    .list_columns(stored.id)
                    .await?
                    .into_iter()
                    .map(|c| (c.column_name, c.data_type))
                    .collect()
            };

            let qualified = stored.qualified_name();
            let mut active_columns = HashSet::with_capacity(columns.len());
            for column in &columns {
                let select = match previous.get(&column.name) {
                    None => {
                        if !is_new {
                            result.new_columns.push(ColumnChange {
                                table_name: qualified.clone(),
                                column_name: column.name.clone(),
                                data_type: column.data_type.clone(),
                            });
                        }
                        Some(select_new)
                    }
                    Some(old_type) => {
                        if *old_type != column.data_type {
                            result.modified_columns.push(ColumnModification {
                                table_name: qualified.clone(),
                                column_name: column.name.clone(),
                                old_type: old_type.clone(),
                                new_type: column.data_type.clone(),
                            });
                        }
                        None
                    }
                };

                self.store
                    .upsert_column(ColumnUpsert {
                        table_id: stored.id,
                        column_name: column.name.clone(),
                        data_type: column.data_type.clone(),
                        is_nullable: column.nullable,
                        is_primary_key: column.primary_key,
                        is_unique: column.unique,
                        ordinal_position: column.ordinal,
                        default_value: column.default.clone(),
                        select,
                    })
                    .await?;
                result.columns_upserted += 1;
                active_columns.insert(column.name.clone());
            }

            debug!(
                "Synced {} ({} columns, new: {}, selected: {})",
                qualified,
                columns.len(),
                is_new,
                stored.is_selected
            );

            active_tables.insert(key);
            sweeps.push(ColumnSweep {
                table: stored,
                active: active_columns,
                report: !is_new,
            });
            snapshot.push((table, columns));
        }

        let removed_tables = self
            .store
            .soft_delete_tables_except(datasource_id, &active_tables)
            .await?;
        result.tables_deleted = removed_tables.len();
        result.removed_table_names = removed_tables.iter().map(|t| t.qualified_name()).collect();

        for sweep in sweeps {
            let removed = self
                .store
                .soft_delete_columns_except(sweep.table.id, &sweep.active)
                .await?;
            result.columns_deleted += removed.len();
            if sweep.report {
                let table_name = sweep.table.qualified_name();
                result.removed_columns.extend(removed.into_iter().map(|c| ColumnChange {
                    table_name: table_name.clone(),
                    column_name: c.column_name,
                    data_type: c.data_type,
                }));
            }
        }

        if discoverer.supports_foreign_keys() {
            let foreign_keys = discoverer.discover_foreign_keys().await?;
            for fk in &foreign_keys {
                match self.sync_foreign_key(project_id, datasource_id, fk).await? {
                    Some(UpsertOutcome::Created) => result.relationships_created += 1,
                    Some(UpsertOutcome::Updated) => {}
                    Some(UpsertOutcome::Protected) => result.relationships_protected += 1,
                    None => result.foreign_keys_skipped += 1,
                }
            }
        }

        result.relationships_deleted = self.store.soft_delete_orphan_relationships(project_id).await?;
        result.fingerprint = fingerprint(&snapshot);

        info!(
            "Schema sync for datasource {}: {} tables ({} new, {} removed), {} new / {} removed / {} modified columns, {} relationships created, {} orphaned",
            datasource_id,
            result.tables_upserted,
            result.new_table_names.len(),
            result.tables_deleted,
            result.new_columns.len(),
            result.removed_columns.len(),
            result.modified_columns.len(),
            result.relationships_created,
            result.relationships_deleted
        );

        Ok(result)
    }

    /// `None` when an endpoint could not be resolved. Both endpoints are
    /// looked up in the datasource being synced.
    async fn sync_foreign_key(
        &self,
        project_id: Uuid,
        datasource_id: Uuid,
        fk: &DiscoveredForeignKey,
    ) -> Result<Option<UpsertOutcome>, AppError> {
        let Some(source_table) = self
            .store
            .find_datasource_table(datasource_id, Some(&fk.source_schema), &fk.source_table)
            .await?
        else {
            warn!(
                "Skipping foreign key {}: source table {}.{} not found",
                fk.constraint_name, fk.source_schema, fk.source_table
            );
            return Ok(None);
        };
        let Some(source_column) = self
            .store
            .find_column(source_table.id, &fk.source_column)
            .await?
        else {
            warn!(
                "Skipping foreign key {}: source column {}.{} not found",
                fk.constraint_name,
                source_table.qualified_name(),
                fk.source_column
            );
            return Ok(None);
        };
        let Some(target_table) = self
            .store
            .find_datasource_table(datasource_id, Some(&fk.target_schema), &fk.target_table)
            .await?
        else {
            warn!(
                "Skipping foreign key {}: target table {}.{} not found",
                fk.constraint_name, fk.target_schema, fk.target_table
            );
            return Ok(None);
        };
        let Some(target_column) = self
            .store
            .find_column(target_table.id, &fk.target_column)
            .await?
        else {
            warn!(
                "Skipping foreign key {}: target column {} not found",
                fk.constraint_name,
                qualify(&target_table.qualified_name(), &fk.target_column)
            );
            return Ok(None);
        };

        let (relationship, outcome) = self
            .store
            .upsert_relationship(RelationshipUpsert {
                project_id,
                source_table_id: source_table.id,
                source_column_id: source_column.id,
                target_table_id: target_table.id,
                target_column_id: target_column.id,
                kind: RelationshipKind::ForeignKey,
                cardinality: Cardinality::ManyToOne,
                confidence: 1.0,
                is_approved: true,
                created_by: Provenance::Inferred,
            })
            .await?;
        if outcome == UpsertOutcome::Protected {
            debug!(
                "Foreign key {} left alone: relationship {} is owned by {}",
                fk.constraint_name,
                relationship.id,
                Provenance::effective(relationship.created_by, relationship.updated_by)
            );
        }
        Ok(Some(outcome))
    }
}
