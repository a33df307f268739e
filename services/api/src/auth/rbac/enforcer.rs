//! Policy enforcer service shared by every request.
//!
//! # Purpose and responsibility
//! Answers `(principal, resource, action)` checks against a compiled Casbin
//! snapshot of the policy store, and routes policy mutations to the store so
//! the snapshot can be dropped as soon as they commit.
//!
//! # Key invariants
//! - A mutation made through this service is visible to the next check.
//! - A snapshot loaded while a mutation raced with it is used once and never
//!   cached.
//! - Cached snapshots expire after the configured TTL so writes made by other
//!   processes become visible; a zero TTL disables caching.
//! - Role checks and permission checks read the same snapshot, so they never
//!   disagree about the role graph.
//! - Store and engine failures are errors, never a denial.
//!
//! # Security considerations
//! - Callers must pass the internal principal id, never an external subject.
use crate::observability::AUTHZ_DECISIONS_TOTAL;
use crate::store::{PolicyStore, StoreError};
use casbin::Enforcer;
use eztrip_authz::{AuthzError, PolicyRule, RoleAssignment, build_enforcer, effective_roles};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum RbacError {
    #[error("policy store error: {0}")]
    Store(#[from] StoreError),
    #[error("policy engine error: {0}")]
    Engine(#[from] AuthzError),
}

/// Compiled engine plus the role graph it was built from.
struct PolicySnapshot {
    enforcer: Enforcer,
    assignments: Vec<RoleAssignment>,
}

struct CachedSnapshot {
    snapshot: Arc<PolicySnapshot>,
    generation: u64,
    loaded_at: Instant,
}

pub struct PolicyEnforcer {
    store: Arc<dyn PolicyStore>,
    cache: RwLock<Option<CachedSnapshot>>,
    generation: AtomicU64,
    ttl: Duration,
}

impl std::fmt::Debug for PolicyEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEnforcer")
            .field("generation", &self.generation.load(Ordering::Acquire))
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl PolicyEnforcer {
    pub fn new(store: Arc<dyn PolicyStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
            generation: AtomicU64::new(0),
            ttl,
        }
    }

    /// Decide whether `principal_id` may perform `action` on `resource`.
    ///
    /// # Errors
    /// Returns [`RbacError`] when the policy cannot be loaded or evaluated.
    pub async fn enforce(
        &self,
        principal_id: &str,
        resource: &str,
        action: &str,
    ) -> Result<bool, RbacError> {
        let result = match self.snapshot().await {
            Ok(snapshot) => {
                eztrip_authz::enforce(&snapshot.enforcer, principal_id, resource, action)
                    .map_err(RbacError::from)
            }
            Err(err) => Err(err),
        };
        let label = match &result {
            Ok(true) => "allow",
            Ok(false) => "deny",
            Err(err) => {
                tracing::error!(
                    error = %err,
                    principal = %principal_id,
                    resource = %resource,
                    action = %action,
                    "permission check failed"
                );
                "error"
            }
        };
        metrics::counter!(AUTHZ_DECISIONS_TOTAL, "result" => label).increment(1);
        result
    }

    /// Whether `principal_id` holds `role`, directly or through inheritance.
    pub async fn has_role(&self, principal_id: &str, role: &str) -> Result<bool, RbacError> {
        Ok(self.effective_roles_for(principal_id).await?.contains(role))
    }

    pub async fn add_rule(&self, rule: PolicyRule) -> Result<bool, RbacError> {
        let added = self.store.add_rule(rule.clone()).await?;
        self.invalidate().await;
        tracing::info!(
            subject = %rule.subject,
            resource = %rule.resource,
            action = %rule.action,
            added,
            "policy rule added"
        );
        Ok(added)
    }

    pub async fn add_role(&self, assignment: RoleAssignment) -> Result<bool, RbacError> {
        let added = self.store.add_role(assignment.clone()).await?;
        self.invalidate().await;
        tracing::info!(
            principal = %assignment.principal_id,
            role = %assignment.role,
            added,
            "role assigned"
        );
        Ok(added)
    }

    pub async fn remove_role(&self, assignment: &RoleAssignment) -> Result<bool, RbacError> {
        let removed = self.store.remove_role(assignment).await?;
        self.invalidate().await;
        tracing::info!(
            principal = %assignment.principal_id,
            role = %assignment.role,
            removed,
            "role removed"
        );
        Ok(removed)
    }

    /// Make `assignment.role` the only direct role of the principal.
    pub async fn replace_roles(&self, assignment: &RoleAssignment) -> Result<(), RbacError> {
        self.store
            .replace_roles(&assignment.principal_id, &assignment.role)
            .await?;
        self.invalidate().await;
        tracing::info!(
            principal = %assignment.principal_id,
            role = %assignment.role,
            "roles replaced"
        );
        Ok(())
    }

    pub async fn clear_roles(&self, principal_id: &str) -> Result<u64, RbacError> {
        let removed = self.store.clear_roles(principal_id).await?;
        self.invalidate().await;
        tracing::info!(principal = %principal_id, removed, "roles cleared");
        Ok(removed)
    }

    pub async fn roles_for(&self, principal_id: &str) -> Result<Vec<String>, RbacError> {
        Ok(self.store.roles_for_principal(principal_id).await?)
    }

    /// Direct and inherited roles, read from the cached snapshot.
    pub async fn effective_roles_for(
        &self,
        principal_id: &str,
    ) -> Result<BTreeSet<String>, RbacError> {
        let snapshot = self.snapshot().await?;
        Ok(effective_roles(&snapshot.assignments, principal_id))
    }

    pub async fn principals_for_role(&self, role: &str) -> Result<Vec<String>, RbacError> {
        Ok(self.store.principals_for_role(role).await?)
    }

    pub async fn list_rules(&self) -> Result<Vec<PolicyRule>, RbacError> {
        Ok(self.store.list_rules().await?)
    }

    /// Seed `rules` into an empty store. Returns `false` when skipped.
    pub async fn seed_defaults(&self, rules: Vec<PolicyRule>) -> Result<bool, RbacError> {
        let seeded = self.store.seed_rules_if_empty(rules).await?;
        self.invalidate().await;
        Ok(seeded)
    }

    /// Drop the cached snapshot; the next check reloads from the store.
    pub async fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.cache.write().await = None;
    }

    async fn snapshot(&self) -> Result<Arc<PolicySnapshot>, RbacError> {
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(cached) = self.cache.read().await.as_ref()
            && cached.generation == generation
            && cached.loaded_at.elapsed() < self.ttl
        {
            return Ok(cached.snapshot.clone());
        }

        let rules = self.store.list_rules().await?;
        let assignments = self.store.list_assignments().await?;
        let enforcer = build_enforcer(&rules, &assignments).await?;
        let snapshot = Arc::new(PolicySnapshot {
            enforcer,
            assignments,
        });

        if !self.ttl.is_zero() {
            let mut cache = self.cache.write().await;
            // A mutation that committed while we were loading bumped the
            // generation; this snapshot may predate it.
            if self.generation.load(Ordering::Acquire) == generation {
                *cache = Some(CachedSnapshot {
                    snapshot: snapshot.clone(),
                    generation,
                    loaded_at: Instant::now(),
                });
            }
        }
        Ok(snapshot)
    }
}
