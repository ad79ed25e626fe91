//! Ontology entities and aliases

use crate::provenance::Provenance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Confidence of an entity inferred from a primary key alone
pub const STRUCTURAL_CONFIDENCE: f64 = 0.5;

/// Confidence once a human-readable description exists
pub const SEMANTIC_CONFIDENCE: f64 = 0.8;

/// Alias source for mechanically grouped table variants
pub const ALIAS_SOURCE_TABLE_GROUPING: &str = "table_grouping";

/// Alias source for names suggested by the language model
pub const ALIAS_SOURCE_ENRICHMENT: &str = "llm_enrichment";

/// A domain concept backed by a mirrored table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OntologyEntity {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: String,
    pub domain: Option<String>,
    pub primary_schema: String,
    pub primary_table: String,
    pub primary_column: String,
    pub confidence: f64,
    pub created_by: Provenance,
    pub updated_by: Option<Provenance>,
    pub is_stale: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OntologyEntity {
    /// Still carries the raw table name and no description
    pub fn needs_enrichment(&self) -> bool {
        self.description.trim().is_empty() && self.name == self.primary_table
    }
}

/// Fields for a freshly discovered entity
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub project_id: Uuid,
    pub name: String,
    pub primary_schema: String,
    pub primary_table: String,
    pub primary_column: String,
    pub confidence: f64,
    pub created_by: Provenance,
}

impl NewEntity {
    pub fn into_entity(self) -> OntologyEntity {
        let now = Utc::now();
        OntologyEntity {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            name: self.name,
            description: String::new(),
            domain: None,
            primary_schema: self.primary_schema,
            primary_table: self.primary_table,
            primary_column: self.primary_column,
            confidence: self.confidence,
            created_by: self.created_by,
            updated_by: None,
            is_stale: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Alternative name for an entity; unique per (entity, alias)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OntologyEntityAlias {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub alias: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl OntologyEntityAlias {
    pub fn new(entity_id: Uuid, alias: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            alias: alias.into(),
            source: source.into(),
            created_at: Utc::now(),
        }
    }
}

/// Result of enriching one entity, committed together with its siblings
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEnrichment {
    pub entity_id: Uuid,
    pub name: String,
    pub description: String,
    pub domain: Option<String>,
    /// Already deduplicated
    pub aliases: Vec<String>,
}

/// What one committed enrichment run changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentCommit {
    pub entities_updated: usize,
    pub aliases_created: usize,
    /// Entities taken over by a higher-precedence writer since they were read
    pub skipped: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, description: &str) -> OntologyEntity {
        let mut entity = NewEntity {
            project_id: Uuid::new_v4(),
            name: name.to_string(),
            primary_schema: "public".to_string(),
            primary_table: "payment_intents".to_string(),
            primary_column: "id".to_string(),
            confidence: STRUCTURAL_CONFIDENCE,
            created_by: Provenance::Inferred,
        }
        .into_entity();
        entity.description = description.to_string();
        entity
    }

    #[test]
    fn test_needs_enrichment() {
        assert!(entity("payment_intents", "").needs_enrichment());
        assert!(!entity("Payment Intent", "").needs_enrichment());
        assert!(!entity("payment_intents", "A customer's intent to pay").needs_enrichment());
    }
}
