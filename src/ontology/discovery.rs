//! Entity discovery
//!
//! Every selected table with a primary key becomes a domain entity. Tables
//! that only differ by a sample/test/backup decoration are one concept: they
//! share an entity located at the plain table and are recorded as aliases.

use crate::db::{OntologyStore, SchemaStore};
use crate::error::AppError;
use crate::models::{
    NewEntity, OntologyEntityAlias, SchemaColumn, SchemaTable, ALIAS_SOURCE_TABLE_GROUPING,
    STRUCTURAL_CONFIDENCE,
};
use crate::provenance::Provenance;
use crate::sync::AutoSelectPolicy;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverySummary {
    pub entities_created: usize,
    pub aliases_created: usize,
    /// Groups that already had an entity
    pub groups_skipped: usize,
}

/// A table that can back an entity
struct Candidate {
    table: SchemaTable,
    primary_key: SchemaColumn,
}

pub struct EntityDiscovery {
    schema: Arc<dyn SchemaStore>,
    ontology: Arc<dyn OntologyStore>,
    policy: Arc<AutoSelectPolicy>,
}

impl EntityDiscovery {
    pub fn new(
        schema: Arc<dyn SchemaStore>,
        ontology: Arc<dyn OntologyStore>,
        policy: Arc<AutoSelectPolicy>,
    ) -> Self {
        Self { schema, ontology, policy }
    }

    pub async fn discover(&self, project_id: Uuid) -> Result<DiscoverySummary, AppError> {
        let mut groups: BTreeMap<(String, String), Vec<Candidate>> = BTreeMap::new();
        for table in self.schema.list_project_tables(project_id).await? {
            if !table.is_selected || table.is_removed() {
                continue;
            }
            let primary_key = self
                .schema
                .list_columns(table.id)
                .await?
                .into_iter()
                .find(|c| c.is_primary_key);
            let Some(primary_key) = primary_key else {
                debug!("Skipping {}: no primary key", table.qualified_name());
                continue;
            };
            let key = (table.schema_name.clone(), self.policy.canonical_name(&table.table_name));
            groups.entry(key).or_default().push(Candidate { table, primary_key });
        }

        let existing: HashMap<(String, String), Uuid> = self
            .ontology
            .list_entities(project_id)
            .await?
            .into_iter()
            .map(|e| {
                let key = (e.primary_schema.clone(), self.policy.canonical_name(&e.primary_table));
                (key, e.id)
            })
            .collect();

        let mut summary = DiscoverySummary::default();
        for (key, mut members) in groups {
            members.sort_by(|a, b| a.table.table_name.cmp(&b.table.table_name));
            let canonical = &key.1;

            let (entity_id, primary_table) = match existing.get(&key) {
                Some(id) => {
                    summary.groups_skipped += 1;
                    (*id, None)
                }
                None => {
                    let primary = members
                        .iter()
                        .position(|m| m.table.table_name.to_lowercase() == *canonical)
                        .unwrap_or(0);
                    let candidate = &members[primary];
                    let entity = NewEntity {
                        project_id,
                        name: candidate.table.table_name.clone(),
                        primary_schema: candidate.table.schema_name.clone(),
                        primary_table: candidate.table.table_name.clone(),
                        primary_column: candidate.primary_key.column_name.clone(),
                        confidence: STRUCTURAL_CONFIDENCE,
                        created_by: Provenance::Inferred,
                    }
                    .into_entity();
                    self.ontology.create_entity(&entity).await?;
                    summary.entities_created += 1;
                    (entity.id, Some(candidate.table.table_name.clone()))
                }
            };

            summary.aliases_created += self
                .alias_variants(entity_id, primary_table.as_deref(), &members)
                .await?;
        }

        info!(
            "Entity discovery for project {}: {} created, {} aliases, {} groups already covered",
            project_id, summary.entities_created, summary.aliases_created, summary.groups_skipped
        );
        Ok(summary)
    }

    /// Record every table of the group except the entity's own as an alias
    async fn alias_variants(
        &self,
        entity_id: Uuid,
        primary_table: Option<&str>,
        members: &[Candidate],
    ) -> Result<usize, AppError> {
        let entity = self
            .ontology
            .get_entity(entity_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Entity {} not found", entity_id)))?;
        let primary_table = primary_table.unwrap_or(&entity.primary_table);

        let mut known: HashSet<String> = self
            .ontology
            .list_aliases(entity_id)
            .await?
            .into_iter()
            .map(|a| a.alias)
            .collect();

        let mut created = 0;
        for member in members {
            let name = &member.table.table_name;
            if name == primary_table || !known.insert(name.clone()) {
                continue;
            }
            let alias = OntologyEntityAlias::new(entity_id, name.clone(), ALIAS_SOURCE_TABLE_GROUPING);
            self.ontology.create_alias(&alias).await?;
            created += 1;
        }
        Ok(created)
    }
}
