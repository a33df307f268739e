//! Policy rule handlers (admin only).
use crate::api::error::{ApiError, api_validation_error};
use crate::api::types::{PolicyAddResponse, PolicyListResponse, PolicyRuleBody};
use crate::app::AppState;
use crate::auth::gate::AuthContext;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use eztrip_authz::{PolicyRule, ROLE_ADMIN};

#[utoipa::path(
    get,
    path = "/v1/rbac/policies",
    tag = "rbac",
    responses(
        (status = 200, description = "All policy rules", body = PolicyListResponse),
        (status = 403, description = "Caller is not an admin", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn list_policies(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<PolicyListResponse>, ApiError> {
    auth.require_role(ROLE_ADMIN).await?;
    let items = state
        .enforcer
        .list_rules()
        .await?
        .into_iter()
        .map(PolicyRuleBody::from)
        .collect();
    Ok(Json(PolicyListResponse { items }))
}

#[utoipa::path(
    post,
    path = "/v1/rbac/policies",
    tag = "rbac",
    request_body = PolicyRuleBody,
    responses(
        (status = 201, description = "Rule added", body = PolicyAddResponse),
        (status = 200, description = "Rule already present", body = PolicyAddResponse),
        (status = 400, description = "Invalid rule", body = crate::api::types::ErrorResponse),
        (status = 403, description = "Caller is not an admin", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn add_policy(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<PolicyRuleBody>,
) -> Result<(StatusCode, Json<PolicyAddResponse>), ApiError> {
    let actor = auth.require_role(ROLE_ADMIN).await?;
    let rule = PolicyRule::new(body.subject, body.resource, body.action)
        .map_err(|err| api_validation_error(&err.to_string()))?;
    let added = state.enforcer.add_rule(rule.clone()).await?;
    tracing::info!(actor = %actor.id, added, "policy rule requested");
    let status = if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(PolicyAddResponse {
            rule: rule.into(),
            added,
        }),
    ))
}
