//! Pending change route handlers

use crate::audit::{AuditAction, AuditEntry};
use crate::auth::{require_role, Claims, Role};
use crate::changes::{ResolutionSummary, SelectionSet};
use crate::error::{validation_error, ApiResult, AppError};
use crate::models::{ChangeStatus, PendingChange, SuccessResponse};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use validator::{Validate, ValidationError};

#[derive(Debug, Deserialize)]
pub struct ListChangesQuery {
    pub status: Option<String>,
}

pub async fn list_changes(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<ListChangesQuery>,
) -> ApiResult<Json<SuccessResponse<Vec<PendingChange>>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ChangeStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let changes = state.stores.changes.list_changes(project_id, status).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} change(s).", changes.len()),
        changes,
    )))
}

fn non_blank_names(names: &[String]) -> Result<(), ValidationError> {
    if names.iter().any(|n| n.trim().is_empty()) {
        return Err(ValidationError::new("blank_name"));
    }
    Ok(())
}

/// Tables and `table.column` names to keep; everything else pending is rejected
#[derive(Debug, Deserialize, Validate)]
pub struct ResolveRequest {
    #[serde(default)]
    #[validate(custom(function = "non_blank_names"))]
    pub tables: Vec<String>,
    #[serde(default)]
    #[validate(custom(function = "non_blank_names"))]
    pub columns: Vec<String>,
}

pub async fn resolve_changes(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(project_id): Path<Uuid>,
    Json(payload): Json<ResolveRequest>,
) -> ApiResult<Json<SuccessResponse<ResolutionSummary>>> {
    require_role(&claims, Role::Admin)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let selection = SelectionSet::new(payload.tables, payload.columns);
    let summary = state
        .resolver
        .resolve_by_selection(project_id, &selection, Some(&claims.sub))
        .await?;

    state
        .audit
        .record(
            AuditEntry::new(project_id, AuditAction::ChangesResolved, "project")
                .actor(Some(&claims.sub))
                .resource(project_id)
                .details(json!(summary)),
        )
        .await;

    if summary.approved > 0 {
        super::ontology::spawn_entity_discovery(&state, project_id, Some(claims.sub.clone()));
    }

    Ok(Json(SuccessResponse::with_data(
        format!("{} approved, {} rejected.", summary.approved, summary.rejected),
        summary,
    )))
}

pub async fn reject_all_changes(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ResolutionSummary>>> {
    require_role(&claims, Role::Admin)?;

    let summary = state.resolver.reject_all(project_id, Some(&claims.sub)).await?;

    state
        .audit
        .record(
            AuditEntry::new(project_id, AuditAction::ChangesRejected, "project")
                .actor(Some(&claims.sub))
                .resource(project_id)
                .details(json!(summary)),
        )
        .await;

    Ok(Json(SuccessResponse::with_data(
        format!("{} change(s) rejected.", summary.rejected),
        summary,
    )))
}
