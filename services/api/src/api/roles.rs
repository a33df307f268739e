//! Role assignment handlers.
//!
//! All routes require the caller to hold the `admin` role. Assignments are
//! keyed on the principal id; unknown principals are rejected with 404 so a
//! typo cannot create an orphan grant.
use crate::api::error::{ApiError, api_not_found, api_store_error, api_validation_error};
use crate::api::types::{RoleChangeResponse, RoleListResponse, RolePrincipalsResponse, RoleRequest};
use crate::app::AppState;
use crate::auth::gate::AuthContext;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use eztrip_authz::{ROLE_ADMIN, RoleAssignment};
use uuid::Uuid;

async fn ensure_principal(state: &AppState, id: Uuid) -> Result<(), ApiError> {
    state
        .store
        .get_principal(id)
        .await
        .map(|_| ())
        .map_err(|err| api_store_error("load principal", err))
}

fn assignment(id: Uuid, role: &str) -> Result<RoleAssignment, ApiError> {
    RoleAssignment::new(id.to_string(), role.trim())
        .map_err(|err| api_validation_error(&err.to_string()))
}

#[utoipa::path(
    get,
    path = "/v1/users/{id}/roles",
    tag = "roles",
    params(("id" = Uuid, Path, description = "Principal id")),
    responses(
        (status = 200, description = "Direct and effective roles", body = RoleListResponse),
        (status = 403, description = "Caller is not an admin", body = crate::api::types::ErrorResponse),
        (status = 404, description = "User not found", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn list_roles(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<RoleListResponse>, ApiError> {
    auth.require_role(ROLE_ADMIN).await?;
    ensure_principal(&state, id).await?;
    let principal_id = id.to_string();
    let roles = state.enforcer.roles_for(&principal_id).await?;
    let effective_roles = state
        .enforcer
        .effective_roles_for(&principal_id)
        .await?
        .into_iter()
        .collect();
    Ok(Json(RoleListResponse {
        principal_id,
        roles,
        effective_roles,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/users/{id}/roles",
    tag = "roles",
    params(("id" = Uuid, Path, description = "Principal id")),
    request_body = RoleRequest,
    responses(
        (status = 201, description = "Role assigned", body = RoleChangeResponse),
        (status = 200, description = "Role was already assigned", body = RoleChangeResponse),
        (status = 400, description = "Invalid role", body = crate::api::types::ErrorResponse),
        (status = 403, description = "Caller is not an admin", body = crate::api::types::ErrorResponse),
        (status = 404, description = "User not found", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn add_role(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<RoleRequest>,
) -> Result<(StatusCode, Json<RoleChangeResponse>), ApiError> {
    let actor = auth.require_role(ROLE_ADMIN).await?;
    let assignment = assignment(id, &body.role)?;
    ensure_principal(&state, id).await?;
    let changed = state.enforcer.add_role(assignment.clone()).await?;
    tracing::info!(actor = %actor.id, principal = %id, role = %assignment.role, "role grant requested");
    let status = if changed {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(RoleChangeResponse {
            principal_id: assignment.principal_id,
            role: assignment.role,
            changed,
        }),
    ))
}

#[utoipa::path(
    put,
    path = "/v1/users/{id}/roles",
    tag = "roles",
    params(("id" = Uuid, Path, description = "Principal id")),
    request_body = RoleRequest,
    responses(
        (status = 200, description = "Roles replaced", body = RoleChangeResponse),
        (status = 400, description = "Invalid role", body = crate::api::types::ErrorResponse),
        (status = 403, description = "Caller is not an admin", body = crate::api::types::ErrorResponse),
        (status = 404, description = "User not found", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn replace_roles(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<RoleRequest>,
) -> Result<Json<RoleChangeResponse>, ApiError> {
    let actor = auth.require_role(ROLE_ADMIN).await?;
    let assignment = assignment(id, &body.role)?;
    ensure_principal(&state, id).await?;
    state.enforcer.replace_roles(&assignment).await?;
    tracing::info!(actor = %actor.id, principal = %id, role = %assignment.role, "roles replace requested");
    Ok(Json(RoleChangeResponse {
        principal_id: assignment.principal_id,
        role: assignment.role,
        changed: true,
    }))
}

#[utoipa::path(
    delete,
    path = "/v1/users/{id}/roles/{role}",
    tag = "roles",
    params(
        ("id" = Uuid, Path, description = "Principal id"),
        ("role" = String, Path, description = "Role name")
    ),
    responses(
        (status = 204, description = "Role removed"),
        (status = 403, description = "Caller is not an admin", body = crate::api::types::ErrorResponse),
        (status = 404, description = "Assignment not found", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn remove_role(
    Path((id, role)): Path<(Uuid, String)>,
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<StatusCode, ApiError> {
    let actor = auth.require_role(ROLE_ADMIN).await?;
    let assignment = assignment(id, &role)?;
    if !state.enforcer.remove_role(&assignment).await? {
        return Err(api_not_found("role assignment not found"));
    }
    tracing::info!(actor = %actor.id, principal = %id, role = %assignment.role, "role revoke requested");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/roles/{role}/principals",
    tag = "roles",
    params(("role" = String, Path, description = "Role name")),
    responses(
        (status = 200, description = "Direct members of the role", body = RolePrincipalsResponse),
        (status = 403, description = "Caller is not an admin", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn principals_for_role(
    Path(role): Path<String>,
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<RolePrincipalsResponse>, ApiError> {
    auth.require_role(ROLE_ADMIN).await?;
    let principals = state.enforcer.principals_for_role(&role).await?;
    Ok(Json(RolePrincipalsResponse { role, principals }))
}
