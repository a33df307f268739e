//! Policy rules and role assignments.
//!
//! Both types validate on construction and when deserialized values are
//! checked with `validate`, so malformed input never reaches a store or the
//! enforcer.
use crate::{AuthzError, AuthzResult};
use serde::{Deserialize, Serialize};

/// Matches any subject, resource or action when used as a whole field.
pub const WILDCARD: &str = "*";

/// A grant of `action` on `resource` to `subject`.
///
/// `subject` is a principal id, a role name, or `*`. Rules form a set; two
/// rules with equal fields are the same rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyRule {
    pub subject: String,
    pub resource: String,
    pub action: String,
}

impl PolicyRule {
    pub fn new(
        subject: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> AuthzResult<Self> {
        let rule = Self {
            subject: subject.into(),
            resource: resource.into(),
            action: action.into(),
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> AuthzResult<()> {
        check_field("subject", &self.subject).map_err(AuthzError::InvalidRule)?;
        check_field("resource", &self.resource).map_err(AuthzError::InvalidRule)?;
        check_field("action", &self.action).map_err(AuthzError::InvalidRule)?;
        Ok(())
    }

    pub(crate) fn to_casbin(&self) -> Vec<String> {
        vec![
            self.subject.clone(),
            self.resource.clone(),
            self.action.clone(),
        ]
    }
}

/// Membership of `principal_id` in `role`.
///
/// `principal_id` may itself be a role name, which makes `role` a parent of
/// that role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub principal_id: String,
    pub role: String,
}

impl RoleAssignment {
    pub fn new(principal_id: impl Into<String>, role: impl Into<String>) -> AuthzResult<Self> {
        let assignment = Self {
            principal_id: principal_id.into(),
            role: role.into(),
        };
        assignment.validate()?;
        Ok(assignment)
    }

    pub fn validate(&self) -> AuthzResult<()> {
        check_field("principal_id", &self.principal_id).map_err(AuthzError::InvalidAssignment)?;
        check_field("role", &self.role).map_err(AuthzError::InvalidAssignment)?;
        if self.principal_id == WILDCARD || self.role == WILDCARD {
            return Err(AuthzError::InvalidAssignment(
                "wildcard is not a principal or role".to_string(),
            ));
        }
        if self.principal_id == self.role {
            return Err(AuthzError::InvalidAssignment(format!(
                "role {} cannot inherit from itself",
                self.role
            )));
        }
        Ok(())
    }

    pub(crate) fn to_casbin(&self) -> Vec<String> {
        vec![self.principal_id.clone(), self.role.clone()]
    }
}

fn check_field(name: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{name} must not be empty"));
    }
    if value.trim() != value {
        return Err(format!("{name} must not have surrounding whitespace"));
    }
    if value.contains(',') {
        return Err(format!("{name} must not contain ','"));
    }
    Ok(())
}
