//! Per-request authorization gate.
//!
//! # Purpose
//! Carries the request's resolved principal (if any) and answers permission
//! and role questions for handlers.
//!
//! # Key invariants
//! - The context is created once per request by the authentication
//!   middleware; handlers only read it.
//! - No principal means `Unauthorized`, never a permission check.
//! - A failed check is `PermissionCheckFailed`, never `Forbidden`.
use crate::api::error::{ApiError, api_internal_message};
use crate::auth::rbac::{PolicyEnforcer, RbacError};
use crate::model::Principal;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: insufficient permissions")]
    Forbidden,
    #[error("permission check failed: {0}")]
    PermissionCheckFailed(#[from] RbacError),
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    principal: Option<Principal>,
    enforcer: Arc<PolicyEnforcer>,
}

impl AuthContext {
    pub fn new(principal: Option<Principal>, enforcer: Arc<PolicyEnforcer>) -> Self {
        Self {
            principal,
            enforcer,
        }
    }

    pub fn anonymous(enforcer: Arc<PolicyEnforcer>) -> Self {
        Self::new(None, enforcer)
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn require_principal(&self) -> Result<&Principal, GateError> {
        self.principal.as_ref().ok_or(GateError::Unauthorized)
    }

    /// Whether the request's principal may perform `action` on `resource`.
    pub async fn check_permission(&self, resource: &str, action: &str) -> Result<bool, GateError> {
        let principal = self.require_principal()?;
        Ok(self
            .enforcer
            .enforce(&principal.policy_id(), resource, action)
            .await?)
    }

    pub async fn require_permission(
        &self,
        resource: &str,
        action: &str,
    ) -> Result<&Principal, GateError> {
        let principal = self.require_principal()?;
        if self.check_permission(resource, action).await? {
            Ok(principal)
        } else {
            tracing::info!(
                principal = %principal.id,
                resource,
                action,
                "permission denied"
            );
            Err(GateError::Forbidden)
        }
    }

    pub async fn require_role(&self, role: &str) -> Result<&Principal, GateError> {
        let principal = self.require_principal()?;
        if self.enforcer.has_role(&principal.policy_id(), role).await? {
            Ok(principal)
        } else {
            tracing::info!(principal = %principal.id, role, "role required");
            Err(GateError::Forbidden)
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<AuthContext>().cloned().ok_or_else(|| {
            tracing::error!("auth context missing; authentication middleware not installed");
            api_internal_message("internal server error")
        })
    }
}
