//! Storage abstractions for principals and policy.
//!
//! # Purpose
//! Defines the directory and policy repository traits, the shared error type,
//! and the in-memory and Postgres backends.
//!
//! # Key invariants
//! - A principal's `external_id` maps to at most one principal, for its whole
//!   lifetime (soft-deleted rows keep the mapping).
//! - Policy rules and role assignments are sets; adding an existing entry is
//!   a no-op that reports `false`.
//! - `replace_roles`, `seed_rules_if_empty` and hard deletes are atomic.
//! - Every write is durable before the call returns (for durable backends).
use crate::model::{NewPrincipal, Principal, PrincipalPatch};
use async_trait::async_trait;
use eztrip_authz::{AuthzError, PolicyRule, RoleAssignment};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<AuthzError> for StoreError {
    fn from(err: AuthzError) -> Self {
        StoreError::Invalid(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err
            && let Some(code) = db.code()
        {
            match code.as_ref() {
                // unique_violation
                "23505" => return StoreError::Conflict(db.message().to_string()),
                // check_violation, not_null_violation
                "23514" | "23502" => return StoreError::Invalid(db.message().to_string()),
                _ => {}
            }
        }
        if matches!(err, sqlx::Error::RowNotFound) {
            return StoreError::NotFound("row not found".to_string());
        }
        StoreError::Unexpected(anyhow::Error::new(err))
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unexpected(anyhow::Error::new(err))
    }
}

/// Outcome of an idempotent create keyed on the external subject.
#[derive(Debug, Clone)]
pub struct Upserted {
    pub principal: Principal,
    pub created: bool,
}

/// Principal directory.
///
/// Lookups skip soft-deleted principals unless stated otherwise.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<Principal>>;

    /// Create a principal for `external_id` unless one already exists.
    ///
    /// Concurrent callers for the same subject observe exactly one creation.
    /// Returns `Conflict` when the existing principal was soft-deleted.
    async fn upsert_by_external_id(
        &self,
        external_id: &str,
        profile: NewPrincipal,
    ) -> StoreResult<Upserted>;

    async fn create_principal(&self, profile: NewPrincipal) -> StoreResult<Principal>;
    async fn get_principal(&self, id: Uuid) -> StoreResult<Principal>;
    /// Live principals, newest first.
    async fn list_principals(&self) -> StoreResult<Vec<Principal>>;
    async fn update_principal(&self, id: Uuid, patch: PrincipalPatch) -> StoreResult<Principal>;
    /// Soft delete by default; `hard` removes the row and frees its email.
    ///
    /// A hard delete also drops the principal's role assignments, atomically
    /// with the row itself, so a reused id never inherits old grants.
    async fn delete_principal(&self, id: Uuid, hard: bool) -> StoreResult<()>;
}

/// Durable repository of policy rules and role assignments.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn list_rules(&self) -> StoreResult<Vec<PolicyRule>>;
    async fn rule_count(&self) -> StoreResult<u64>;
    async fn add_rule(&self, rule: PolicyRule) -> StoreResult<bool>;
    /// Insert `rules` only if no rule exists yet. Returns `false` when skipped.
    async fn seed_rules_if_empty(&self, rules: Vec<PolicyRule>) -> StoreResult<bool>;

    async fn list_assignments(&self) -> StoreResult<Vec<RoleAssignment>>;
    async fn add_role(&self, assignment: RoleAssignment) -> StoreResult<bool>;
    async fn remove_role(&self, assignment: &RoleAssignment) -> StoreResult<bool>;
    /// Drop every role of `principal_id` and assign `role`, atomically.
    async fn replace_roles(&self, principal_id: &str, role: &str) -> StoreResult<()>;
    async fn clear_roles(&self, principal_id: &str) -> StoreResult<u64>;
    /// Direct roles only, sorted.
    async fn roles_for_principal(&self, principal_id: &str) -> StoreResult<Vec<String>>;
    /// Direct members of `role`, sorted.
    async fn principals_for_role(&self, role: &str) -> StoreResult<Vec<String>>;
}

/// Everything the service needs from a backend.
#[async_trait]
pub trait AppStore: DirectoryStore + PolicyStore {
    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}
