//! Ontology mutations
//!
//! Every write to entity or relationship metadata goes through here so the
//! provenance guard is always consulted first. Rejected writes are audited.

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::db::{OntologyStore, SchemaStore};
use crate::error::AppError;
use crate::models::{
    Cardinality, OntologyEntity, OntologyEntityAlias, RelationshipKind, RelationshipUpsert,
    SchemaRelationship, UpsertOutcome, SEMANTIC_CONFIDENCE,
};
use crate::provenance::{Provenance, ProvenanceGuard};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Fields to change on an entity; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct EntityPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RelationshipPatch {
    pub cardinality: Option<Cardinality>,
    pub is_approved: Option<bool>,
}

/// Who is writing: the provenance of the write and the reviewer behind it
#[derive(Debug, Clone, Copy)]
pub struct Modifier<'a> {
    pub source: Provenance,
    pub actor: Option<&'a str>,
}

impl<'a> Modifier<'a> {
    pub fn manual(actor: &'a str) -> Self {
        Self { source: Provenance::Manual, actor: Some(actor) }
    }
}

pub struct OntologyService {
    schema: Arc<dyn SchemaStore>,
    ontology: Arc<dyn OntologyStore>,
    audit: Arc<AuditLog>,
}

impl OntologyService {
    pub fn new(
        schema: Arc<dyn SchemaStore>,
        ontology: Arc<dyn OntologyStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self { schema, ontology, audit }
    }

    pub async fn list_entities(&self, project_id: Uuid) -> Result<Vec<OntologyEntity>, AppError> {
        self.ontology.list_entities(project_id).await
    }

    pub async fn update_entity(
        &self,
        entity_id: Uuid,
        patch: EntityPatch,
        modifier: Modifier<'_>,
    ) -> Result<OntologyEntity, AppError> {
        let mut entity = self.entity(entity_id).await?;
        self.guard(
            entity.project_id,
            entity_id,
            &format!("Entity '{}'", entity.name),
            entity.created_by,
            entity.updated_by,
            modifier,
        )
        .await?;

        if let Some(name) = patch.name {
            entity.name = name;
        }
        if let Some(description) = patch.description {
            if modifier.source == Provenance::Manual && !description.trim().is_empty() {
                entity.confidence = entity.confidence.max(SEMANTIC_CONFIDENCE);
            }
            entity.description = description;
        }
        if let Some(domain) = patch.domain {
            entity.domain = Some(domain);
        }
        entity.updated_by = Some(modifier.source);
        entity.updated_at = Utc::now();

        self.ontology.update_entity(&entity).await?;
        info!("Entity {} updated by {}", entity_id, modifier.source);
        Ok(entity)
    }

    pub async fn add_alias(
        &self,
        entity_id: Uuid,
        alias: &str,
        modifier: Modifier<'_>,
    ) -> Result<OntologyEntityAlias, AppError> {
        let entity = self.entity(entity_id).await?;
        self.guard(
            entity.project_id,
            entity_id,
            &format!("Entity '{}'", entity.name),
            entity.created_by,
            entity.updated_by,
            modifier,
        )
        .await?;

        let alias = OntologyEntityAlias::new(entity_id, alias.trim(), modifier.source.as_str());
        self.ontology.create_alias(&alias).await?;
        Ok(alias)
    }

    /// A user-declared link between two columns of the project
    pub async fn create_manual_relationship(
        &self,
        project_id: Uuid,
        source_column_id: Uuid,
        target_column_id: Uuid,
        cardinality: Cardinality,
        modifier: Modifier<'_>,
    ) -> Result<SchemaRelationship, AppError> {
        if source_column_id == target_column_id {
            return Err(AppError::Validation(
                "A relationship needs two different columns".to_string(),
            ));
        }
        let source_table_id = self.column_table(project_id, source_column_id).await?;
        let target_table_id = self.column_table(project_id, target_column_id).await?;

        if self
            .schema
            .find_relationship(source_column_id, target_column_id, RelationshipKind::Manual)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(
                "A manual relationship between these columns already exists".to_string(),
            ));
        }

        let (relationship, outcome) = self
            .schema
            .upsert_relationship(RelationshipUpsert {
                project_id,
                source_table_id,
                source_column_id,
                target_table_id,
                target_column_id,
                kind: RelationshipKind::Manual,
                cardinality,
                confidence: 1.0,
                is_approved: true,
                created_by: modifier.source,
            })
            .await?;
        if outcome == UpsertOutcome::Protected {
            // A removed row owned by a higher-precedence source
            self.guard(
                project_id,
                relationship.id,
                &format!("Relationship {}", relationship.id),
                relationship.created_by,
                relationship.updated_by,
                modifier,
            )
            .await?;
        }

        info!("Manual relationship {} created in project {}", relationship.id, project_id);
        Ok(relationship)
    }

    pub async fn update_relationship(
        &self,
        relationship_id: Uuid,
        patch: RelationshipPatch,
        modifier: Modifier<'_>,
    ) -> Result<SchemaRelationship, AppError> {
        let mut relationship = self.guarded_relationship(relationship_id, modifier).await?;

        if let Some(cardinality) = patch.cardinality {
            relationship.cardinality = cardinality;
        }
        if let Some(approved) = patch.is_approved {
            relationship.is_approved = approved;
        }
        relationship.updated_by = Some(modifier.source);
        relationship.updated_at = Utc::now();

        self.schema.update_relationship(&relationship).await?;
        Ok(relationship)
    }

    pub async fn remove_relationship(
        &self,
        relationship_id: Uuid,
        modifier: Modifier<'_>,
    ) -> Result<(), AppError> {
        let mut relationship = self.guarded_relationship(relationship_id, modifier).await?;

        let now = Utc::now();
        relationship.updated_by = Some(modifier.source);
        relationship.removed_at = Some(now);
        relationship.updated_at = now;

        self.schema.update_relationship(&relationship).await?;
        info!("Relationship {} removed by {}", relationship_id, modifier.source);
        Ok(())
    }

    async fn entity(&self, id: Uuid) -> Result<OntologyEntity, AppError> {
        self.ontology
            .get_entity(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Entity {} not found", id)))
    }

    async fn guarded_relationship(
        &self,
        id: Uuid,
        modifier: Modifier<'_>,
    ) -> Result<SchemaRelationship, AppError> {
        let relationship = self
            .schema
            .get_relationship(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Relationship {} not found", id)))?;
        self.guard(
            relationship.project_id,
            id,
            &format!("Relationship {}", id),
            relationship.created_by,
            relationship.updated_by,
            modifier,
        )
        .await?;
        Ok(relationship)
    }

    /// Owning table of a live column, which must belong to the project
    async fn column_table(&self, project_id: Uuid, column_id: Uuid) -> Result<Uuid, AppError> {
        let column = self
            .schema
            .get_column(column_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Column {} not found", column_id)))?;
        match self.schema.get_table(column.table_id).await? {
            Some(table) if table.project_id == project_id => Ok(table.id),
            _ => Err(AppError::NotFound(format!(
                "Column {} not found in project {}",
                column_id, project_id
            ))),
        }
    }

    async fn guard(
        &self,
        project_id: Uuid,
        resource_id: Uuid,
        what: &str,
        created_by: Provenance,
        updated_by: Option<Provenance>,
        modifier: Modifier<'_>,
    ) -> Result<(), AppError> {
        let checked = ProvenanceGuard::check(what, created_by, updated_by, modifier.source);
        if let Err(e) = &checked {
            warn!("Rejected write to {}: {}", what, e);
            self.audit
                .record(
                    AuditEntry::new(project_id, AuditAction::PrecedenceViolation, what)
                        .actor(modifier.actor)
                        .resource(resource_id)
                        .details(json!({
                            "effective": Provenance::effective(created_by, updated_by).to_string(),
                            "modifier": modifier.source.to_string(),
                        })),
                )
                .await;
        }
        checked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{ColumnUpsert, NewEntity, TableUpsert, STRUCTURAL_CONFIDENCE};

    struct Fixture {
        store: Arc<MemoryStore>,
        audit: Arc<AuditLog>,
        service: OntologyService,
        project: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(AuditLog::new());
        Fixture {
            service: OntologyService::new(store.clone(), store.clone(), audit.clone()),
            store,
            audit,
            project: Uuid::new_v4(),
        }
    }

    impl Fixture {
        async fn entity(&self, created_by: Provenance) -> OntologyEntity {
            let entity = NewEntity {
                project_id: self.project,
                name: "orders".to_string(),
                primary_schema: "public".to_string(),
                primary_table: "orders".to_string(),
                primary_column: "id".to_string(),
                confidence: STRUCTURAL_CONFIDENCE,
                created_by,
            }
            .into_entity();
            self.store.create_entity(&entity).await.unwrap();
            entity
        }

        async fn column(&self, table: &str, name: &str) -> Uuid {
            let table = self
                .store
                .upsert_table(TableUpsert {
                    project_id: self.project,
                    datasource_id: Uuid::nil(),
                    schema_name: "public".to_string(),
                    table_name: table.to_string(),
                    row_count: None,
                    select: Some(true),
                })
                .await
                .unwrap();
            self.store
                .upsert_column(ColumnUpsert {
                    table_id: table.id,
                    column_name: name.to_string(),
                    data_type: "integer".to_string(),
                    is_nullable: false,
                    is_primary_key: name == "id",
                    is_unique: name == "id",
                    ordinal_position: 1,
                    default_value: None,
                    select: Some(true),
                })
                .await
                .unwrap()
                .id
        }
    }

    const INFERRED: Modifier<'static> = Modifier { source: Provenance::Inferred, actor: None };

    #[tokio::test]
    async fn test_manual_edit_locks_out_inferred_writes() {
        let f = fixture();
        let entity = f.entity(Provenance::Inferred).await;

        let patch = EntityPatch {
            description: Some("A customer purchase".to_string()),
            ..Default::default()
        };
        let updated = f
            .service
            .update_entity(entity.id, patch, Modifier::manual("ana"))
            .await
            .unwrap();
        assert_eq!(updated.updated_by, Some(Provenance::Manual));
        assert_eq!(updated.confidence, SEMANTIC_CONFIDENCE);

        let rename = EntityPatch { name: Some("Purchase".to_string()), ..Default::default() };
        let err = f.service.update_entity(entity.id, rename, INFERRED).await.unwrap_err();
        assert!(matches!(err, AppError::PrecedenceViolation(_)));

        let stored = f.store.get_entity(entity.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "orders");
        let violations = f.audit.list(f.project, Some(AuditAction::PrecedenceViolation), 10).await;
        assert_eq!(violations.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_alias_is_a_conflict() {
        let f = fixture();
        let entity = f.entity(Provenance::Inferred).await;

        let alias = f.service.add_alias(entity.id, "Purchase", Modifier::manual("ana")).await.unwrap();
        assert_eq!(alias.source, "manual");

        let err = f
            .service
            .add_alias(entity.id, "Purchase", Modifier::manual("ana"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_manual_relationship_conflict() {
        let f = fixture();
        let source = f.column("orders", "customer_id").await;
        let target = f.column("customers", "id").await;

        let created = f
            .service
            .create_manual_relationship(
                f.project,
                source,
                target,
                Cardinality::ManyToOne,
                Modifier::manual("ana"),
            )
            .await
            .unwrap();
        assert_eq!(created.kind, RelationshipKind::Manual);
        assert_eq!(created.confidence, 1.0);
        assert!(created.is_approved);

        let err = f
            .service
            .create_manual_relationship(
                f.project,
                source,
                target,
                Cardinality::OneToOne,
                Modifier::manual("ana"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(f.store.list_relationships(f.project).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_agent_cannot_revive_relationship_a_human_removed() {
        let f = fixture();
        let source = f.column("orders", "customer_id").await;
        let target = f.column("customers", "id").await;
        let created = f
            .service
            .create_manual_relationship(
                f.project,
                source,
                target,
                Cardinality::ManyToOne,
                Modifier::manual("ana"),
            )
            .await
            .unwrap();
        f.service
            .remove_relationship(created.id, Modifier::manual("ana"))
            .await
            .unwrap();

        let agent = Modifier { source: Provenance::Mcp, actor: Some("agent") };
        let err = f
            .service
            .create_manual_relationship(f.project, source, target, Cardinality::OneToOne, agent)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PrecedenceViolation(_)));
        assert!(f.store.list_relationships(f.project).await.unwrap().is_empty());
        let violations = f.audit.list(f.project, Some(AuditAction::PrecedenceViolation), 10).await;
        assert_eq!(violations.len(), 1);
    }

    #[tokio::test]
    async fn test_relationship_edits_are_guarded() {
        let f = fixture();
        let source = f.column("orders", "customer_id").await;
        let target = f.column("customers", "id").await;
        let relationship = f
            .service
            .create_manual_relationship(
                f.project,
                source,
                target,
                Cardinality::ManyToOne,
                Modifier::manual("ana"),
            )
            .await
            .unwrap();

        let patch = RelationshipPatch { is_approved: Some(false), ..Default::default() };
        let err = f
            .service
            .update_relationship(relationship.id, patch, INFERRED)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PrecedenceViolation(_)));

        let err = f.service.remove_relationship(relationship.id, INFERRED).await.unwrap_err();
        assert!(matches!(err, AppError::PrecedenceViolation(_)));

        f.service
            .remove_relationship(relationship.id, Modifier::manual("ana"))
            .await
            .unwrap();
        assert!(f.store.list_relationships(f.project).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_column_from_other_project_is_not_found() {
        let f = fixture();
        let source = f.column("orders", "customer_id").await;
        let target = f.column("customers", "id").await;

        let err = f
            .service
            .create_manual_relationship(
                Uuid::new_v4(),
                source,
                target,
                Cardinality::ManyToOne,
                Modifier::manual("ana"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
