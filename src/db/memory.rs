//! In-memory store
//!
//! Backs every persistence trait with `tokio::sync::RwLock` maps. Multi-row
//! writes take all the locks they need up front, so they are atomic with
//! respect to readers. Lock order is tables, columns, relationships.

use super::{ChangeStore, OntologyStore, SchemaStore, TableKey};
use crate::error::AppError;
use crate::models::{
    ChangeStatus, ColumnUpsert, EnrichmentCommit, EntityEnrichment, OntologyEntity,
    OntologyEntityAlias, PendingChange, RelationshipKind, RelationshipUpsert, SchemaColumn,
    SchemaRelationship, SchemaTable, TableUpsert, UpsertOutcome, ALIAS_SOURCE_ENRICHMENT,
    SEMANTIC_CONFIDENCE,
};
use crate::provenance::{Provenance, ProvenanceGuard};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Uuid, SchemaTable>>,
    columns: RwLock<HashMap<Uuid, SchemaColumn>>,
    relationships: RwLock<HashMap<Uuid, SchemaRelationship>>,
    /// Insertion order is creation order
    changes: RwLock<Vec<PendingChange>>,
    entities: RwLock<HashMap<Uuid, OntologyEntity>>,
    aliases: RwLock<Vec<OntologyEntityAlias>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_tables(mut tables: Vec<SchemaTable>) -> Vec<SchemaTable> {
    tables.sort_by(|a, b| {
        (a.schema_name.as_str(), a.table_name.as_str())
            .cmp(&(b.schema_name.as_str(), b.table_name.as_str()))
    });
    tables
}

#[async_trait]
impl SchemaStore for MemoryStore {
    async fn list_tables(&self, datasource_id: Uuid) -> Result<Vec<SchemaTable>, AppError> {
        let tables = self.tables.read().await;
        Ok(sorted_tables(
            tables
                .values()
                .filter(|t| t.datasource_id == datasource_id && !t.is_removed())
                .cloned()
                .collect(),
        ))
    }

    async fn list_project_tables(&self, project_id: Uuid) -> Result<Vec<SchemaTable>, AppError> {
        let tables = self.tables.read().await;
        Ok(sorted_tables(
            tables
                .values()
                .filter(|t| t.project_id == project_id && !t.is_removed())
                .cloned()
                .collect(),
        ))
    }

    async fn get_table(&self, id: Uuid) -> Result<Option<SchemaTable>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables.get(&id).filter(|t| !t.is_removed()).cloned())
    }

    async fn find_table(
        &self,
        project_id: Uuid,
        schema_name: Option<&str>,
        table_name: &str,
    ) -> Result<Option<SchemaTable>, AppError> {
        let tables = self.tables.read().await;
        let candidates = tables
            .values()
            .filter(|t| {
                t.project_id == project_id
                    && !t.is_removed()
                    && t.table_name == table_name
                    && schema_name.map_or(true, |s| t.schema_name == s)
            })
            .cloned()
            .collect();
        Ok(sorted_tables(candidates).into_iter().next())
    }

    async fn find_datasource_table(
        &self,
        datasource_id: Uuid,
        schema_name: Option<&str>,
        table_name: &str,
    ) -> Result<Option<SchemaTable>, AppError> {
        let tables = self.tables.read().await;
        let candidates = tables
            .values()
            .filter(|t| {
                t.datasource_id == datasource_id
                    && !t.is_removed()
                    && t.table_name == table_name
                    && schema_name.map_or(true, |s| t.schema_name == s)
            })
            .cloned()
            .collect();
        Ok(sorted_tables(candidates).into_iter().next())
    }

    async fn upsert_table(&self, upsert: TableUpsert) -> Result<SchemaTable, AppError> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();

        let existing = tables.values_mut().find(|t| {
            t.datasource_id == upsert.datasource_id
                && t.schema_name == upsert.schema_name
                && t.table_name == upsert.table_name
        });

        if let Some(table) = existing {
            table.project_id = upsert.project_id;
            table.row_count = upsert.row_count;
            table.removed_at = None;
            if let Some(selected) = upsert.select {
                table.is_selected = selected;
            }
            table.updated_at = now;
            return Ok(table.clone());
        }

        let table = SchemaTable {
            id: Uuid::new_v4(),
            project_id: upsert.project_id,
            datasource_id: upsert.datasource_id,
            schema_name: upsert.schema_name,
            table_name: upsert.table_name,
            row_count: upsert.row_count,
            is_selected: upsert.select.unwrap_or(false),
            removed_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.insert(table.id, table.clone());
        Ok(table)
    }

    async fn soft_delete_tables_except(
        &self,
        datasource_id: Uuid,
        active: &HashSet<TableKey>,
    ) -> Result<Vec<SchemaTable>, AppError> {
        let mut tables = self.tables.write().await;
        let mut columns = self.columns.write().await;
        let now = Utc::now();

        let mut removed = Vec::new();
        for table in tables.values_mut() {
            if table.datasource_id != datasource_id || table.is_removed() {
                continue;
            }
            let key = (table.schema_name.clone(), table.table_name.clone());
            if active.contains(&key) {
                continue;
            }
            table.removed_at = Some(now);
            table.updated_at = now;
            removed.push(table.clone());
        }

        let removed_ids: HashSet<Uuid> = removed.iter().map(|t| t.id).collect();
        for column in columns.values_mut() {
            if removed_ids.contains(&column.table_id) && !column.is_removed() {
                column.removed_at = Some(now);
                column.updated_at = now;
            }
        }

        Ok(sorted_tables(removed))
    }

    async fn set_table_selected(&self, id: Uuid, selected: bool) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        let mut columns = self.columns.write().await;

        let table = tables
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Table {} not found", id)))?;
        table.is_selected = selected;
        table.updated_at = Utc::now();

        if !selected {
            for column in columns.values_mut().filter(|c| c.table_id == id) {
                column.is_selected = false;
            }
        }
        Ok(())
    }

    async fn list_columns(&self, table_id: Uuid) -> Result<Vec<SchemaColumn>, AppError> {
        let columns = self.columns.read().await;
        let mut list: Vec<SchemaColumn> = columns
            .values()
            .filter(|c| c.table_id == table_id && !c.is_removed())
            .cloned()
            .collect();
        list.sort_by_key(|c| (c.ordinal_position, c.column_name.clone()));
        Ok(list)
    }

    async fn get_column(&self, id: Uuid) -> Result<Option<SchemaColumn>, AppError> {
        let columns = self.columns.read().await;
        Ok(columns.get(&id).filter(|c| !c.is_removed()).cloned())
    }

    async fn find_column(
        &self,
        table_id: Uuid,
        column_name: &str,
    ) -> Result<Option<SchemaColumn>, AppError> {
        let columns = self.columns.read().await;
        Ok(columns
            .values()
            .find(|c| c.table_id == table_id && c.column_name == column_name && !c.is_removed())
            .cloned())
    }

    async fn upsert_column(&self, upsert: ColumnUpsert) -> Result<SchemaColumn, AppError> {
        let mut columns = self.columns.write().await;
        let now = Utc::now();

        let existing = columns
            .values_mut()
            .find(|c| c.table_id == upsert.table_id && c.column_name == upsert.column_name);

        if let Some(column) = existing {
            column.data_type = upsert.data_type;
            column.is_nullable = upsert.is_nullable;
            column.is_primary_key = upsert.is_primary_key;
            column.is_unique = upsert.is_unique;
            column.ordinal_position = upsert.ordinal_position;
            column.default_value = upsert.default_value;
            column.removed_at = None;
            if let Some(selected) = upsert.select {
                column.is_selected = selected;
            }
            column.updated_at = now;
            return Ok(column.clone());
        }

        let column = SchemaColumn {
            id: Uuid::new_v4(),
            table_id: upsert.table_id,
            column_name: upsert.column_name,
            data_type: upsert.data_type,
            is_nullable: upsert.is_nullable,
            is_primary_key: upsert.is_primary_key,
            is_unique: upsert.is_unique,
            ordinal_position: upsert.ordinal_position,
            default_value: upsert.default_value,
            is_selected: upsert.select.unwrap_or(false),
            removed_at: None,
            created_at: now,
            updated_at: now,
        };
        columns.insert(column.id, column.clone());
        Ok(column)
    }

    async fn soft_delete_columns_except(
        &self,
        table_id: Uuid,
        active: &HashSet<String>,
    ) -> Result<Vec<SchemaColumn>, AppError> {
        let mut columns = self.columns.write().await;
        let now = Utc::now();

        let mut removed = Vec::new();
        for column in columns.values_mut() {
            if column.table_id != table_id
                || column.is_removed()
                || active.contains(&column.column_name)
            {
                continue;
            }
            column.removed_at = Some(now);
            column.updated_at = now;
            removed.push(column.clone());
        }
        removed.sort_by_key(|c| c.ordinal_position);
        Ok(removed)
    }

    async fn set_column_selected(&self, id: Uuid, selected: bool) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        let mut columns = self.columns.write().await;

        let column = columns
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Column {} not found", id)))?;
        column.is_selected = selected;
        column.updated_at = Utc::now();

        if selected {
            if let Some(table) = tables.get_mut(&column.table_id) {
                table.is_selected = true;
            }
        }
        Ok(())
    }

    async fn list_relationships(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<SchemaRelationship>, AppError> {
        let relationships = self.relationships.read().await;
        let mut list: Vec<SchemaRelationship> = relationships
            .values()
            .filter(|r| r.project_id == project_id && !r.is_removed())
            .cloned()
            .collect();
        list.sort_by_key(|r| r.created_at);
        Ok(list)
    }

    async fn get_relationship(&self, id: Uuid) -> Result<Option<SchemaRelationship>, AppError> {
        let relationships = self.relationships.read().await;
        Ok(relationships.get(&id).filter(|r| !r.is_removed()).cloned())
    }

    async fn find_relationship(
        &self,
        source_column_id: Uuid,
        target_column_id: Uuid,
        kind: RelationshipKind,
    ) -> Result<Option<SchemaRelationship>, AppError> {
        let relationships = self.relationships.read().await;
        Ok(relationships
            .values()
            .find(|r| {
                r.source_column_id == source_column_id
                    && r.target_column_id == target_column_id
                    && r.kind == kind
                    && !r.is_removed()
            })
            .cloned())
    }

    async fn upsert_relationship(
        &self,
        upsert: RelationshipUpsert,
    ) -> Result<(SchemaRelationship, UpsertOutcome), AppError> {
        let mut relationships = self.relationships.write().await;
        let now = Utc::now();

        let existing = relationships.values_mut().find(|r| {
            r.source_column_id == upsert.source_column_id
                && r.target_column_id == upsert.target_column_id
                && r.kind == upsert.kind
        });

        if let Some(relationship) = existing {
            let owner = Provenance::effective(relationship.created_by, relationship.updated_by);
            if !upsert.created_by.can_modify(owner) {
                return Ok((relationship.clone(), UpsertOutcome::Protected));
            }
            let outcome = if relationship.is_removed() {
                UpsertOutcome::Created
            } else {
                UpsertOutcome::Updated
            };
            relationship.cardinality = upsert.cardinality;
            relationship.confidence = upsert.confidence;
            relationship.removed_at = None;
            relationship.updated_at = now;
            return Ok((relationship.clone(), outcome));
        }

        let relationship = SchemaRelationship {
            id: Uuid::new_v4(),
            project_id: upsert.project_id,
            source_table_id: upsert.source_table_id,
            source_column_id: upsert.source_column_id,
            target_table_id: upsert.target_table_id,
            target_column_id: upsert.target_column_id,
            kind: upsert.kind,
            cardinality: upsert.cardinality,
            confidence: upsert.confidence,
            is_approved: upsert.is_approved,
            created_by: upsert.created_by,
            updated_by: None,
            removed_at: None,
            created_at: now,
            updated_at: now,
        };
        relationships.insert(relationship.id, relationship.clone());
        Ok((relationship, UpsertOutcome::Created))
    }

    async fn update_relationship(&self, relationship: &SchemaRelationship) -> Result<(), AppError> {
        let mut relationships = self.relationships.write().await;
        let slot = relationships
            .get_mut(&relationship.id)
            .ok_or_else(|| AppError::NotFound(format!("Relationship {} not found", relationship.id)))?;
        *slot = relationship.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn soft_delete_orphan_relationships(&self, project_id: Uuid) -> Result<u64, AppError> {
        let columns = self.columns.read().await;
        let mut relationships = self.relationships.write().await;
        let now = Utc::now();

        let live = |id: &Uuid| columns.get(id).map_or(false, |c| !c.is_removed());

        let mut removed = 0;
        for relationship in relationships.values_mut() {
            if relationship.project_id != project_id || relationship.is_removed() {
                continue;
            }
            if live(&relationship.source_column_id) && live(&relationship.target_column_id) {
                continue;
            }
            relationship.removed_at = Some(now);
            relationship.updated_at = now;
            removed += 1;
        }
        Ok(removed)
    }
}

#[async_trait]
impl ChangeStore for MemoryStore {
    async fn create_changes(&self, changes: &[PendingChange]) -> Result<(), AppError> {
        let mut stored = self.changes.write().await;
        stored.extend_from_slice(changes);
        Ok(())
    }

    async fn list_changes(
        &self,
        project_id: Uuid,
        status: Option<ChangeStatus>,
    ) -> Result<Vec<PendingChange>, AppError> {
        let stored = self.changes.read().await;
        Ok(stored
            .iter()
            .filter(|c| c.project_id == project_id && status.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    async fn update_change_status(
        &self,
        id: Uuid,
        status: ChangeStatus,
        reviewed_by: Option<&str>,
    ) -> Result<(), AppError> {
        let mut stored = self.changes.write().await;
        let change = stored
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Change {} not found", id)))?;

        let now = Utc::now();
        change.status = status;
        change.reviewed_by = reviewed_by.map(str::to_string);
        change.reviewed_at = (status != ChangeStatus::Pending).then_some(now);
        change.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl OntologyStore for MemoryStore {
    async fn list_entities(&self, project_id: Uuid) -> Result<Vec<OntologyEntity>, AppError> {
        let entities = self.entities.read().await;
        let mut list: Vec<OntologyEntity> = entities
            .values()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn get_entity(&self, id: Uuid) -> Result<Option<OntologyEntity>, AppError> {
        Ok(self.entities.read().await.get(&id).cloned())
    }

    async fn create_entity(&self, entity: &OntologyEntity) -> Result<(), AppError> {
        let mut entities = self.entities.write().await;
        if entities.contains_key(&entity.id) {
            return Err(AppError::Conflict(format!("Entity {} already exists", entity.id)));
        }
        entities.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn update_entity(&self, entity: &OntologyEntity) -> Result<(), AppError> {
        let mut entities = self.entities.write().await;
        let slot = entities
            .get_mut(&entity.id)
            .ok_or_else(|| AppError::NotFound(format!("Entity {} not found", entity.id)))?;
        *slot = entity.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn list_aliases(&self, entity_id: Uuid) -> Result<Vec<OntologyEntityAlias>, AppError> {
        let aliases = self.aliases.read().await;
        Ok(aliases.iter().filter(|a| a.entity_id == entity_id).cloned().collect())
    }

    async fn create_alias(&self, alias: &OntologyEntityAlias) -> Result<(), AppError> {
        let mut aliases = self.aliases.write().await;
        if aliases
            .iter()
            .any(|a| a.entity_id == alias.entity_id && a.alias == alias.alias)
        {
            return Err(AppError::Conflict(format!(
                "Alias '{}' already exists for entity {}",
                alias.alias, alias.entity_id
            )));
        }
        aliases.push(alias.clone());
        Ok(())
    }

    async fn apply_enrichment(
        &self,
        project_id: Uuid,
        updates: &[EntityEnrichment],
    ) -> Result<EnrichmentCommit, AppError> {
        let mut entities = self.entities.write().await;
        let mut aliases = self.aliases.write().await;

        // Validate everything before the first write
        for update in updates {
            match entities.get(&update.entity_id) {
                Some(entity) if entity.project_id == project_id => {}
                _ => {
                    return Err(AppError::NotFound(format!(
                        "Entity {} not found in project {}",
                        update.entity_id, project_id
                    )))
                }
            }
        }

        let now = Utc::now();
        let mut commit = EnrichmentCommit::default();
        for update in updates {
            let Some(entity) = entities.get_mut(&update.entity_id) else {
                continue;
            };
            let what = format!("Entity '{}'", entity.name);
            if ProvenanceGuard::check(&what, entity.created_by, entity.updated_by, Provenance::Inferred)
                .is_err()
            {
                commit.skipped.push(update.entity_id);
                continue;
            }
            entity.name = update.name.clone();
            entity.description = update.description.clone();
            entity.domain = update.domain.clone();
            entity.confidence = SEMANTIC_CONFIDENCE;
            entity.updated_by = Some(Provenance::Inferred);
            entity.updated_at = now;
            commit.entities_updated += 1;

            let mut seen: HashSet<String> = aliases
                .iter()
                .filter(|a| a.entity_id == update.entity_id)
                .map(|a| a.alias.clone())
                .collect();
            for alias in &update.aliases {
                if seen.insert(alias.clone()) {
                    aliases.push(OntologyEntityAlias::new(
                        update.entity_id,
                        alias.clone(),
                        ALIAS_SOURCE_ENRICHMENT,
                    ));
                    commit.aliases_created += 1;
                }
            }
        }
        Ok(commit)
    }

    async fn mark_entities_stale(
        &self,
        project_id: Uuid,
        tables: &[TableKey],
    ) -> Result<u64, AppError> {
        let mut entities = self.entities.write().await;
        let keys: HashSet<(&str, &str)> =
            tables.iter().map(|(s, t)| (s.as_str(), t.as_str())).collect();

        let mut marked = 0;
        for entity in entities.values_mut() {
            if entity.project_id != project_id || entity.is_stale {
                continue;
            }
            if keys.contains(&(entity.primary_schema.as_str(), entity.primary_table.as_str())) {
                entity.is_stale = true;
                entity.updated_at = Utc::now();
                marked += 1;
            }
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewEntity, STRUCTURAL_CONFIDENCE};
    use pretty_assertions::assert_eq;

    fn table_upsert(project_id: Uuid, datasource_id: Uuid, name: &str) -> TableUpsert {
        TableUpsert {
            project_id,
            datasource_id,
            schema_name: "public".to_string(),
            table_name: name.to_string(),
            row_count: Some(10),
            select: None,
        }
    }

    fn column_upsert(table_id: Uuid, name: &str, select: Option<bool>) -> ColumnUpsert {
        ColumnUpsert {
            table_id,
            column_name: name.to_string(),
            data_type: "integer".to_string(),
            is_nullable: false,
            is_primary_key: name == "id",
            is_unique: false,
            ordinal_position: 1,
            default_value: None,
            select,
        }
    }

    #[tokio::test]
    async fn test_upsert_table_is_keyed_by_natural_key() {
        let store = MemoryStore::new();
        let (project, datasource) = (Uuid::new_v4(), Uuid::new_v4());

        let first = store.upsert_table(table_upsert(project, datasource, "orders")).await.unwrap();
        let second = store.upsert_table(table_upsert(project, datasource, "orders")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.list_tables(datasource).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_selection_propagates_both_ways() {
        let store = MemoryStore::new();
        let (project, datasource) = (Uuid::new_v4(), Uuid::new_v4());
        let table = store.upsert_table(table_upsert(project, datasource, "orders")).await.unwrap();
        let column = store.upsert_column(column_upsert(table.id, "total", None)).await.unwrap();

        store.set_column_selected(column.id, true).await.unwrap();
        assert!(store.get_table(table.id).await.unwrap().unwrap().is_selected);

        store.set_table_selected(table.id, false).await.unwrap();
        assert!(!store.get_column(column.id).await.unwrap().unwrap().is_selected);
    }

    #[tokio::test]
    async fn test_soft_delete_tables_cascades_to_columns_and_orphans() {
        let store = MemoryStore::new();
        let (project, datasource) = (Uuid::new_v4(), Uuid::new_v4());
        let orders = store.upsert_table(table_upsert(project, datasource, "orders")).await.unwrap();
        let legacy = store.upsert_table(table_upsert(project, datasource, "legacy")).await.unwrap();
        let order_id = store.upsert_column(column_upsert(orders.id, "legacy_id", None)).await.unwrap();
        let legacy_id = store.upsert_column(column_upsert(legacy.id, "id", None)).await.unwrap();

        store
            .upsert_relationship(RelationshipUpsert {
                project_id: project,
                source_table_id: orders.id,
                source_column_id: order_id.id,
                target_table_id: legacy.id,
                target_column_id: legacy_id.id,
                kind: RelationshipKind::ForeignKey,
                cardinality: crate::models::Cardinality::ManyToOne,
                confidence: 1.0,
                is_approved: true,
                created_by: Provenance::Inferred,
            })
            .await
            .unwrap();

        let active: HashSet<TableKey> = [("public".to_string(), "orders".to_string())].into();
        let removed = store.soft_delete_tables_except(datasource, &active).await.unwrap();

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].table_name, "legacy");
        assert!(store.get_column(legacy_id.id).await.unwrap().is_none());
        assert_eq!(store.soft_delete_orphan_relationships(project).await.unwrap(), 1);
        assert!(store.list_relationships(project).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revived_relationship_counts_as_created() {
        let store = MemoryStore::new();
        let project = Uuid::new_v4();
        let upsert = RelationshipUpsert {
            project_id: project,
            source_table_id: Uuid::new_v4(),
            source_column_id: Uuid::new_v4(),
            target_table_id: Uuid::new_v4(),
            target_column_id: Uuid::new_v4(),
            kind: RelationshipKind::ForeignKey,
            cardinality: crate::models::Cardinality::ManyToOne,
            confidence: 1.0,
            is_approved: true,
            created_by: Provenance::Inferred,
        };

        let (_, outcome) = store.upsert_relationship(upsert.clone()).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Created);
        let (_, outcome) = store.upsert_relationship(upsert.clone()).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        // Endpoint columns were never stored, so the relationship is orphaned
        assert_eq!(store.soft_delete_orphan_relationships(project).await.unwrap(), 1);
        let (_, outcome) = store.upsert_relationship(upsert).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Created);
    }

    #[tokio::test]
    async fn test_inferred_upsert_leaves_manually_owned_relationship_alone() {
        let store = MemoryStore::new();
        let upsert = RelationshipUpsert {
            project_id: Uuid::new_v4(),
            source_table_id: Uuid::new_v4(),
            source_column_id: Uuid::new_v4(),
            target_table_id: Uuid::new_v4(),
            target_column_id: Uuid::new_v4(),
            kind: RelationshipKind::ForeignKey,
            cardinality: crate::models::Cardinality::ManyToOne,
            confidence: 1.0,
            is_approved: true,
            created_by: Provenance::Inferred,
        };
        let (mut relationship, _) = store.upsert_relationship(upsert.clone()).await.unwrap();

        relationship.cardinality = crate::models::Cardinality::OneToOne;
        relationship.updated_by = Some(Provenance::Manual);
        relationship.removed_at = Some(Utc::now());
        store.update_relationship(&relationship).await.unwrap();

        let (kept, outcome) = store.upsert_relationship(upsert).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Protected);
        assert_eq!(kept.cardinality, crate::models::Cardinality::OneToOne);
        assert!(kept.is_removed());
    }

    #[tokio::test]
    async fn test_duplicate_alias_is_a_conflict() {
        let store = MemoryStore::new();
        let entity_id = Uuid::new_v4();
        store
            .create_alias(&OntologyEntityAlias::new(entity_id, "Client", "manual"))
            .await
            .unwrap();
        let err = store
            .create_alias(&OntologyEntityAlias::new(entity_id, "Client", "manual"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_apply_enrichment_is_all_or_nothing() {
        let store = MemoryStore::new();
        let project = Uuid::new_v4();
        let entity = NewEntity {
            project_id: project,
            name: "orders".to_string(),
            primary_schema: "public".to_string(),
            primary_table: "orders".to_string(),
            primary_column: "id".to_string(),
            confidence: STRUCTURAL_CONFIDENCE,
            created_by: Provenance::Inferred,
        }
        .into_entity();
        store.create_entity(&entity).await.unwrap();

        let good = EntityEnrichment {
            entity_id: entity.id,
            name: "Order".to_string(),
            description: "A purchase".to_string(),
            domain: Some("sales".to_string()),
            aliases: vec!["Purchase".to_string()],
        };
        let unknown = EntityEnrichment { entity_id: Uuid::new_v4(), ..good.clone() };

        assert!(store.apply_enrichment(project, &[good.clone(), unknown]).await.is_err());
        let untouched = store.get_entity(entity.id).await.unwrap().unwrap();
        assert_eq!(untouched.name, "orders");
        assert!(store.list_aliases(entity.id).await.unwrap().is_empty());

        let commit = store.apply_enrichment(project, &[good.clone()]).await.unwrap();
        assert_eq!(commit.entities_updated, 1);
        assert_eq!(commit.aliases_created, 1);
        // Re-applying does not duplicate aliases
        let commit = store.apply_enrichment(project, &[good]).await.unwrap();
        assert_eq!(commit.aliases_created, 0);

        let enriched = store.get_entity(entity.id).await.unwrap().unwrap();
        assert_eq!(enriched.name, "Order");
        assert_eq!(enriched.confidence, SEMANTIC_CONFIDENCE);
        assert_eq!(enriched.updated_by, Some(Provenance::Inferred));
    }

    #[tokio::test]
    async fn test_apply_enrichment_skips_entities_taken_over_by_a_human() {
        let store = MemoryStore::new();
        let project = Uuid::new_v4();
        let mut ids = Vec::new();
        for table in ["orders", "users"] {
            let entity = NewEntity {
                project_id: project,
                name: table.to_string(),
                primary_schema: "public".to_string(),
                primary_table: table.to_string(),
                primary_column: "id".to_string(),
                confidence: STRUCTURAL_CONFIDENCE,
                created_by: Provenance::Inferred,
            }
            .into_entity();
            store.create_entity(&entity).await.unwrap();
            ids.push(entity.id);
        }

        let mut owned = store.get_entity(ids[1]).await.unwrap().unwrap();
        owned.name = "Customer".to_string();
        owned.updated_by = Some(Provenance::Manual);
        store.update_entity(&owned).await.unwrap();

        let updates: Vec<EntityEnrichment> = ids
            .iter()
            .map(|id| EntityEnrichment {
                entity_id: *id,
                name: "Enriched".to_string(),
                description: "From the model".to_string(),
                domain: None,
                aliases: vec!["Alias".to_string()],
            })
            .collect();
        let commit = store.apply_enrichment(project, &updates).await.unwrap();

        assert_eq!(commit.entities_updated, 1);
        assert_eq!(commit.aliases_created, 1);
        assert_eq!(commit.skipped, vec![ids[1]]);
        let kept = store.get_entity(ids[1]).await.unwrap().unwrap();
        assert_eq!(kept.name, "Customer");
        assert_eq!(kept.updated_by, Some(Provenance::Manual));
        assert!(store.list_aliases(ids[1]).await.unwrap().is_empty());
    }
}
