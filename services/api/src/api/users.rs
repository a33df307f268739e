//! User directory handlers.
//!
//! # Purpose
//! Profile endpoints for the caller (`currentUser`) and directory management
//! (`users`, `user`), each behind a permission check.
//!
//! # Key invariants
//! - Every handler checks permission before touching the store.
//! - Hard deletion also drops the principal's role assignments.
use crate::api::error::{ApiError, api_store_error};
use crate::api::types::{
    CreateUserRequest, DeleteUserQuery, UpdateProfileRequest, UserListResponse,
};
use crate::app::AppState;
use crate::auth::gate::AuthContext;
use crate::model::Principal;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use eztrip_authz::{RESOURCE_CURRENT_USER, RESOURCE_USER, RESOURCE_USERS};
use uuid::Uuid;

#[utoipa::path(
    get,
    path = "/v1/users/me",
    tag = "users",
    responses(
        (status = 200, description = "Caller's profile", body = Principal),
        (status = 401, description = "Not authenticated", body = crate::api::types::ErrorResponse),
        (status = 403, description = "Insufficient permissions", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn get_me(auth: AuthContext) -> Result<Json<Principal>, ApiError> {
    let principal = auth.require_permission(RESOURCE_CURRENT_USER, "read").await?;
    Ok(Json(principal.clone()))
}

#[utoipa::path(
    patch,
    path = "/v1/users/me",
    tag = "users",
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Profile updated", body = Principal),
        (status = 400, description = "Invalid input", body = crate::api::types::ErrorResponse),
        (status = 401, description = "Not authenticated", body = crate::api::types::ErrorResponse),
        (status = 403, description = "Insufficient permissions", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn update_me(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<UpdateProfileRequest>,
) -> Result<Json<Principal>, ApiError> {
    let principal = auth
        .require_permission(RESOURCE_CURRENT_USER, "update")
        .await?;
    let patch = body.into_patch()?;
    let updated = state
        .store
        .update_principal(principal.id, patch)
        .await
        .map_err(|err| api_store_error("update profile", err))?;
    Ok(Json(updated))
}

#[utoipa::path(
    get,
    path = "/v1/users",
    tag = "users",
    responses(
        (status = 200, description = "Live users, newest first", body = UserListResponse),
        (status = 401, description = "Not authenticated", body = crate::api::types::ErrorResponse),
        (status = 403, description = "Insufficient permissions", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn list_users(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<UserListResponse>, ApiError> {
    auth.require_permission(RESOURCE_USERS, "read").await?;
    let items = state
        .store
        .list_principals()
        .await
        .map_err(|err| api_store_error("list users", err))?;
    Ok(Json(UserListResponse { items }))
}

#[utoipa::path(
    post,
    path = "/v1/users",
    tag = "users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = Principal),
        (status = 400, description = "Invalid input", body = crate::api::types::ErrorResponse),
        (status = 403, description = "Insufficient permissions", body = crate::api::types::ErrorResponse),
        (status = 409, description = "Email already in use", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn create_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<Principal>), ApiError> {
    let actor = auth.require_permission(RESOURCE_USERS, "create").await?;
    let profile = body.into_new_principal()?;
    let created = state
        .store
        .create_principal(profile)
        .await
        .map_err(|err| api_store_error("create user", err))?;
    tracing::info!(actor = %actor.id, principal = %created.id, "user created");
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/v1/users/{id}",
    tag = "users",
    params(("id" = Uuid, Path, description = "Principal id")),
    responses(
        (status = 200, description = "User", body = Principal),
        (status = 403, description = "Insufficient permissions", body = crate::api::types::ErrorResponse),
        (status = 404, description = "User not found", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn get_user(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Principal>, ApiError> {
    auth.require_permission(RESOURCE_USER, "read").await?;
    let principal = state
        .store
        .get_principal(id)
        .await
        .map_err(|err| api_store_error("get user", err))?;
    Ok(Json(principal))
}

#[utoipa::path(
    delete,
    path = "/v1/users/{id}",
    tag = "users",
    params(
        ("id" = Uuid, Path, description = "Principal id"),
        DeleteUserQuery
    ),
    responses(
        (status = 204, description = "User deleted"),
        (status = 403, description = "Insufficient permissions", body = crate::api::types::ErrorResponse),
        (status = 404, description = "User not found", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn delete_user(
    Path(id): Path<Uuid>,
    Query(query): Query<DeleteUserQuery>,
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<StatusCode, ApiError> {
    let actor = auth.require_permission(RESOURCE_USERS, "delete").await?;
    state
        .store
        .delete_principal(id, query.hard)
        .await
        .map_err(|err| api_store_error("delete user", err))?;
    if query.hard {
        // The store dropped the grants with the row.
        state.enforcer.invalidate().await;
    }
    tracing::info!(actor = %actor.id, principal = %id, hard = query.hard, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}
