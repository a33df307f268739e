//! API error types and helpers.
//!
//! # Purpose and responsibility
//! Centralizes HTTP error response construction so every endpoint returns the
//! same error shape, and maps gate, token and store failures onto it.
//!
//! # Key invariants and assumptions
//! - Error responses carry a stable `code` and a human-readable `message`.
//! - Status codes align with the error category.
//!
//! # Security considerations
//! - Internal errors log details server-side but return generic messages.
//! - Token failures all collapse to one `unauthorized` response.
use crate::api::types::ErrorResponse;
use crate::auth::gate::GateError;
use crate::auth::oidc::TokenError;
use crate::auth::rbac::RbacError;
use crate::store::StoreError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;

pub const MSG_UNAUTHORIZED: &str = "unauthorized";
pub const MSG_FORBIDDEN: &str = "forbidden: insufficient permissions";
pub const MSG_INTERNAL: &str = "internal server error";

/// Structured API error returned by handlers.
///
/// # Invariants
/// - `status` must match the semantics of `body.code`.
///
/// # Example
/// ```rust
/// use axum::http::StatusCode;
/// use eztrip_api::api::error::ApiError;
/// use eztrip_api::api::types::ErrorResponse;
///
/// let err = ApiError {
///     status: StatusCode::NOT_FOUND,
///     body: ErrorResponse {
///         code: "not_found".to_string(),
///         message: "missing".to_string(),
///         request_id: None,
///     },
/// };
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn api_error(status: StatusCode, code: &str, message: &str) -> ApiError {
    ApiError {
        status,
        body: ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
            request_id: None,
        },
    }
}

/// Build a 404 Not Found error.
pub fn api_not_found(message: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, "not_found", message)
}

/// Build a 409 Conflict error with a caller-provided code.
pub fn api_conflict(code: &str, message: &str) -> ApiError {
    api_error(StatusCode::CONFLICT, code, message)
}

/// Build a 500 Internal Server Error from a store error.
///
/// Logs the store error and returns a generic message.
pub fn api_internal(context: &str, err: &StoreError) -> ApiError {
    tracing::error!(error = ?err, context, "storage error");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", MSG_INTERNAL)
}

/// Build a 500 Internal Server Error without an underlying store error.
pub fn api_internal_message(message: &str) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

/// Build a 401 Unauthorized error.
pub fn api_unauthorized(message: &str) -> ApiError {
    api_error(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

/// Build a 403 Forbidden error.
pub fn api_forbidden(message: &str) -> ApiError {
    api_error(StatusCode::FORBIDDEN, "forbidden", message)
}

/// Build a 400 Bad Request validation error.
pub fn api_validation_error(message: &str) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

/// Translate a store error, keeping client-caused failures visible.
pub fn api_store_error(context: &str, err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound(message) => api_not_found(&message),
        StoreError::Conflict(message) => api_conflict("conflict", &message),
        StoreError::Invalid(message) => api_validation_error(&message),
        err @ StoreError::Unexpected(_) => api_internal(context, &err),
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Unauthorized => api_unauthorized(MSG_UNAUTHORIZED),
            GateError::Forbidden => api_forbidden(MSG_FORBIDDEN),
            GateError::PermissionCheckFailed(err) => {
                tracing::error!(error = %err, "permission check failed");
                api_internal_message(MSG_INTERNAL)
            }
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(_: TokenError) -> Self {
        api_unauthorized(MSG_UNAUTHORIZED)
    }
}

impl From<RbacError> for ApiError {
    fn from(err: RbacError) -> Self {
        match err {
            RbacError::Store(err) => api_store_error("policy store", err),
            RbacError::Engine(err) => {
                tracing::error!(error = %err, "policy engine error");
                api_internal_message(MSG_INTERNAL)
            }
        }
    }
}
