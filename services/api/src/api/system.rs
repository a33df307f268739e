//! Health endpoint.
//!
//! Public and read-only; probes the backing store so readiness reflects
//! dependency availability.
use crate::api::error::{ApiError, api_internal};
use crate::api::types::HealthStatus;
use crate::app::AppState;
use axum::Json;
use axum::extract::State;

#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses(
        (status = 200, description = "Service health", body = HealthStatus),
        (status = 500, description = "Storage unavailable", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn health(State(state): State<AppState>) -> Result<Json<HealthStatus>, ApiError> {
    if let Err(err) = state.store.health_check().await {
        return Err(api_internal("health check", &err));
    }
    Ok(Json(HealthStatus {
        status: "ok".to_string(),
        api_version: state.api_version.clone(),
        storage: state.store.backend_name().to_string(),
        durable: state.store.is_durable(),
    }))
}
