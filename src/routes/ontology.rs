//! Ontology route handlers
//!
//! Edits made over HTTP are manual unless the caller identifies itself as
//! an MCP agent through the `x-edit-source` header.

use crate::audit::{AuditAction, AuditEntry};
use crate::auth::{require_role, Claims, Role};
use crate::enrichment::{EnrichmentSummary, OpenQuestion};
use crate::error::{validation_error, ApiResult, AppError};
use crate::models::{
    Cardinality, MessageResponse, OntologyEntity, OntologyEntityAlias, SchemaRelationship,
    SuccessResponse,
};
use crate::ontology::{DiscoverySummary, EntityPatch, Modifier, RelationshipPatch};
use crate::provenance::Provenance;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

const EDIT_SOURCE_HEADER: &str = "x-edit-source";

fn modifier<'a>(headers: &HeaderMap, claims: &'a Claims) -> Result<Modifier<'a>, AppError> {
    let source = match headers.get(EDIT_SOURCE_HEADER).map(|v| v.to_str()) {
        None => Provenance::Manual,
        Some(Ok(value)) => match value.parse::<Provenance>().unwrap_or_default() {
            source @ (Provenance::Manual | Provenance::Mcp) => source,
            _ => {
                return Err(AppError::BadRequest(format!(
                    "Unsupported {} '{}'",
                    EDIT_SOURCE_HEADER, value
                )))
            }
        },
        Some(Err(_)) => {
            return Err(AppError::BadRequest(format!("Malformed {}", EDIT_SOURCE_HEADER)))
        }
    };
    Ok(Modifier { source, actor: Some(&claims.sub) })
}

/// Run entity discovery off the request path, after earlier work for the project
pub fn spawn_entity_discovery(state: &SharedState, project_id: Uuid, actor: Option<String>) {
    let task_state = state.clone();
    state.tasks.spawn(project_id, "entity_discovery", async move {
        discover(&task_state, project_id, actor.as_deref()).await.map(|_| ())
    });
}

async fn discover(
    state: &SharedState,
    project_id: Uuid,
    actor: Option<&str>,
) -> Result<DiscoverySummary, AppError> {
    let summary = state.discovery.discover(project_id).await?;
    state
        .audit
        .record(
            AuditEntry::new(project_id, AuditAction::EntitiesDiscovered, "project")
                .actor(actor)
                .resource(project_id)
                .details(json!(summary)),
        )
        .await;
    Ok(summary)
}

pub async fn discover_entities(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<DiscoverySummary>>> {
    require_role(&claims, Role::Developer)?;

    let summary = discover(&state, project_id, Some(&claims.sub)).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} entit(ies) created.", summary.entities_created),
        summary,
    )))
}

pub async fn enrich_entities(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<EnrichmentSummary>>> {
    require_role(&claims, Role::Developer)?;

    let summary = state.enrichment()?.enrich(project_id, Some(&claims.sub)).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} entit(ies) enriched.", summary.entities_enriched),
        summary,
    )))
}

pub async fn list_entities(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<Vec<OntologyEntity>>>> {
    let entities = state.ontology.list_entities(project_id).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} entit(ies).", entities.len()),
        entities,
    )))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateEntityRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(length(max = 4000))]
    pub description: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub domain: Option<String>,
}

pub async fn update_entity(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Path(entity_id): Path<Uuid>,
    Json(payload): Json<UpdateEntityRequest>,
) -> ApiResult<Json<SuccessResponse<OntologyEntity>>> {
    require_role(&claims, Role::Developer)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let patch = EntityPatch {
        name: payload.name,
        description: payload.description,
        domain: payload.domain,
    };
    let entity = state
        .ontology
        .update_entity(entity_id, patch, modifier(&headers, &claims)?)
        .await?;
    Ok(Json(SuccessResponse::with_data("Entity updated.", entity)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddAliasRequest {
    #[validate(length(min = 1, max = 255))]
    pub alias: String,
}

pub async fn add_alias(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Path(entity_id): Path<Uuid>,
    Json(payload): Json<AddAliasRequest>,
) -> ApiResult<Json<SuccessResponse<OntologyEntityAlias>>> {
    require_role(&claims, Role::Developer)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    if payload.alias.trim().is_empty() {
        return Err(validation_error("Alias must not be blank"));
    }

    let alias = state
        .ontology
        .add_alias(entity_id, &payload.alias, modifier(&headers, &claims)?)
        .await?;
    Ok(Json(SuccessResponse::with_data("Alias added.", alias)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRelationshipRequest {
    pub source_column_id: Uuid,
    pub target_column_id: Uuid,
    pub cardinality: Cardinality,
}

pub async fn create_relationship(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(payload): Json<CreateRelationshipRequest>,
) -> ApiResult<Json<SuccessResponse<SchemaRelationship>>> {
    require_role(&claims, Role::Developer)?;

    let relationship = state
        .ontology
        .create_manual_relationship(
            project_id,
            payload.source_column_id,
            payload.target_column_id,
            payload.cardinality,
            modifier(&headers, &claims)?,
        )
        .await?;

    info!("Relationship {} created by {}", relationship.id, claims.sub);
    Ok(Json(SuccessResponse::with_data("Relationship created.", relationship)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRelationshipRequest {
    pub cardinality: Option<Cardinality>,
    pub is_approved: Option<bool>,
}

pub async fn update_relationship(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Path(relationship_id): Path<Uuid>,
    Json(payload): Json<UpdateRelationshipRequest>,
) -> ApiResult<Json<SuccessResponse<SchemaRelationship>>> {
    require_role(&claims, Role::Developer)?;

    let patch = RelationshipPatch {
        cardinality: payload.cardinality,
        is_approved: payload.is_approved,
    };
    let relationship = state
        .ontology
        .update_relationship(relationship_id, patch, modifier(&headers, &claims)?)
        .await?;
    Ok(Json(SuccessResponse::with_data("Relationship updated.", relationship)))
}

pub async fn delete_relationship(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Path(relationship_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    require_role(&claims, Role::Developer)?;

    state
        .ontology
        .remove_relationship(relationship_id, modifier(&headers, &claims)?)
        .await?;
    Ok(Json(MessageResponse::new("Relationship removed.")))
}

pub async fn list_questions(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<Vec<OpenQuestion>>>> {
    let questions = state.questions.list(project_id).await;
    Ok(Json(SuccessResponse::with_data(
        format!("{} open question(s).", questions.len()),
        questions,
    )))
}
