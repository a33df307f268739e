//! HTTP API request/response types.
//!
//! # Purpose
//! Defines payload shapes for the REST API, their input validation, and the
//! schemas used for OpenAPI generation.
use crate::api::error::{ApiError, api_validation_error};
use crate::model::{NewPrincipal, Principal, PrincipalPatch};
use eztrip_authz::PolicyRule;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

pub const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct HealthStatus {
    pub status: String,
    pub api_version: String,
    pub storage: String,
    pub durable: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserListResponse {
    pub items: Vec<Principal>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct CreateUserRequest {
    pub email: Option<String>,
    pub first_name: String,
    pub last_name: String,
}

impl CreateUserRequest {
    pub fn into_new_principal(self) -> Result<NewPrincipal, ApiError> {
        validate_name("first_name", &self.first_name)?;
        validate_name("last_name", &self.last_name)?;
        let email = match self.email {
            Some(email) => Some(validate_email(&email)?),
            None => None,
        };
        Ok(NewPrincipal {
            external_id: None,
            email,
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Default)]
pub struct UpdateProfileRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl UpdateProfileRequest {
    pub fn into_patch(self) -> Result<PrincipalPatch, ApiError> {
        if self.first_name.is_none() && self.last_name.is_none() {
            return Err(api_validation_error("no fields to update"));
        }
        let first_name = self
            .first_name
            .map(|name| validate_name("first_name", &name).map(|_| name.trim().to_string()))
            .transpose()?;
        let last_name = self
            .last_name
            .map(|name| validate_name("last_name", &name).map(|_| name.trim().to_string()))
            .transpose()?;
        Ok(PrincipalPatch {
            first_name,
            last_name,
        })
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct DeleteUserQuery {
    /// Remove the principal and its role assignments instead of deactivating it.
    #[serde(default)]
    pub hard: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct RoleRequest {
    pub role: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct RoleListResponse {
    pub principal_id: String,
    /// Directly assigned roles.
    pub roles: Vec<String>,
    /// Direct and inherited roles.
    pub effective_roles: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct RoleChangeResponse {
    pub principal_id: String,
    pub role: String,
    /// `false` when the request was a no-op.
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct RolePrincipalsResponse {
    pub role: String,
    pub principals: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, PartialEq, Eq)]
pub struct PolicyRuleBody {
    pub subject: String,
    pub resource: String,
    pub action: String,
}

impl From<PolicyRule> for PolicyRuleBody {
    fn from(rule: PolicyRule) -> Self {
        Self {
            subject: rule.subject,
            resource: rule.resource,
            action: rule.action,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct PolicyListResponse {
    pub items: Vec<PolicyRuleBody>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct PolicyAddResponse {
    pub rule: PolicyRuleBody,
    pub added: bool,
}

pub fn validate_name(field: &str, value: &str) -> Result<(), ApiError> {
    let len = value.trim().chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(api_validation_error(&format!(
            "{field} must be between 1 and {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Light shape check; deliverability is the identity provider's concern.
pub fn validate_email(value: &str) -> Result<String, ApiError> {
    let email = value.trim();
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        })
        && !email.chars().any(char::is_whitespace);
    if !valid {
        return Err(api_validation_error("email must be a valid address"));
    }
    Ok(email.to_string())
}
