//! In-memory store for development and tests.
//!
//! State lives behind `tokio::sync::RwLock`s. Each write takes the lock for
//! its whole critical section, so multi-step operations (`replace_roles`,
//! `seed_rules_if_empty`, upserts) are atomic with respect to other callers.
//! Nothing survives a restart.
use crate::model::{NewPrincipal, Principal, PrincipalPatch};
use crate::store::{AppStore, DirectoryStore, PolicyStore, StoreError, StoreResult, Upserted};
use async_trait::async_trait;
use chrono::Utc;
use eztrip_authz::{PolicyRule, RoleAssignment};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Directory {
    /// All principals by id, including soft-deleted ones.
    principals: HashMap<Uuid, Principal>,
    /// External subject to principal id. Entries outlive soft deletion.
    by_external_id: HashMap<String, Uuid>,
}

impl Directory {
    fn email_taken(&self, email: &str, except: Option<Uuid>) -> bool {
        self.principals.values().any(|principal| {
            Some(principal.id) != except
                && !principal.is_deleted()
                && principal.email.as_deref() == Some(email)
        })
    }

    fn insert(&mut self, profile: NewPrincipal) -> StoreResult<Principal> {
        if let Some(email) = profile.email.as_deref()
            && self.email_taken(email, None)
        {
            return Err(StoreError::Conflict(format!("email {email} already in use")));
        }
        if let Some(external_id) = profile.external_id.as_deref()
            && self.by_external_id.contains_key(external_id)
        {
            return Err(StoreError::Conflict(format!(
                "external id {external_id} already linked"
            )));
        }
        let principal = profile.into_principal(Utc::now());
        if let Some(external_id) = &principal.external_id {
            self.by_external_id
                .insert(external_id.clone(), principal.id);
        }
        self.principals.insert(principal.id, principal.clone());
        Ok(principal)
    }

    fn live_mut(&mut self, id: Uuid) -> StoreResult<&mut Principal> {
        self.principals
            .get_mut(&id)
            .filter(|principal| !principal.is_deleted())
            .ok_or_else(|| StoreError::NotFound(format!("principal {id}")))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    directory: Arc<RwLock<Directory>>,
    rules: Arc<RwLock<BTreeSet<PolicyRule>>>,
    assignments: Arc<RwLock<BTreeSet<RoleAssignment>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DirectoryStore for InMemoryStore {
    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<Principal>> {
        let directory = self.directory.read().await;
        Ok(directory
            .by_external_id
            .get(external_id)
            .and_then(|id| directory.principals.get(id))
            .filter(|principal| !principal.is_deleted())
            .cloned())
    }

    async fn upsert_by_external_id(
        &self,
        external_id: &str,
        mut profile: NewPrincipal,
    ) -> StoreResult<Upserted> {
        let mut directory = self.directory.write().await;
        if let Some(id) = directory.by_external_id.get(external_id) {
            let existing = directory
                .principals
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::Unexpected(anyhow::anyhow!("dangling index")))?;
            if existing.is_deleted() {
                return Err(StoreError::Conflict(format!(
                    "principal {} is deactivated",
                    existing.id
                )));
            }
            return Ok(Upserted {
                principal: existing,
                created: false,
            });
        }
        profile.external_id = Some(external_id.to_string());
        let principal = directory.insert(profile)?;
        Ok(Upserted {
            principal,
            created: true,
        })
    }

    async fn create_principal(&self, profile: NewPrincipal) -> StoreResult<Principal> {
        self.directory.write().await.insert(profile)
    }

    async fn get_principal(&self, id: Uuid) -> StoreResult<Principal> {
        self.directory
            .read()
            .await
            .principals
            .get(&id)
            .filter(|principal| !principal.is_deleted())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("principal {id}")))
    }

    async fn list_principals(&self) -> StoreResult<Vec<Principal>> {
        let directory = self.directory.read().await;
        let mut principals: Vec<Principal> = directory
            .principals
            .values()
            .filter(|principal| !principal.is_deleted())
            .cloned()
            .collect();
        principals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(principals)
    }

    async fn update_principal(&self, id: Uuid, patch: PrincipalPatch) -> StoreResult<Principal> {
        let mut directory = self.directory.write().await;
        let principal = directory.live_mut(id)?;
        patch.apply(principal, Utc::now());
        Ok(principal.clone())
    }

    async fn delete_principal(&self, id: Uuid, hard: bool) -> StoreResult<()> {
        let mut directory = self.directory.write().await;
        if hard {
            // Lock order: directory, then assignments.
            let mut assignments = self.assignments.write().await;
            let removed = directory
                .principals
                .remove(&id)
                .ok_or_else(|| StoreError::NotFound(format!("principal {id}")))?;
            if let Some(external_id) = &removed.external_id {
                directory.by_external_id.remove(external_id);
            }
            let policy_id = removed.policy_id();
            assignments.retain(|assignment| assignment.principal_id != policy_id);
            return Ok(());
        }
        let principal = directory.live_mut(id)?;
        principal.deleted_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for InMemoryStore {
    async fn list_rules(&self) -> StoreResult<Vec<PolicyRule>> {
        Ok(self.rules.read().await.iter().cloned().collect())
    }

    async fn rule_count(&self) -> StoreResult<u64> {
        Ok(self.rules.read().await.len() as u64)
    }

    async fn add_rule(&self, rule: PolicyRule) -> StoreResult<bool> {
        rule.validate()?;
        Ok(self.rules.write().await.insert(rule))
    }

    async fn seed_rules_if_empty(&self, rules: Vec<PolicyRule>) -> StoreResult<bool> {
        for rule in &rules {
            rule.validate()?;
        }
        let mut current = self.rules.write().await;
        if !current.is_empty() {
            return Ok(false);
        }
        current.extend(rules);
        Ok(true)
    }

    async fn list_assignments(&self) -> StoreResult<Vec<RoleAssignment>> {
        Ok(self.assignments.read().await.iter().cloned().collect())
    }

    async fn add_role(&self, assignment: RoleAssignment) -> StoreResult<bool> {
        assignment.validate()?;
        Ok(self.assignments.write().await.insert(assignment))
    }

    async fn remove_role(&self, assignment: &RoleAssignment) -> StoreResult<bool> {
        Ok(self.assignments.write().await.remove(assignment))
    }

    async fn replace_roles(&self, principal_id: &str, role: &str) -> StoreResult<()> {
        let mut current = self.assignments.write().await;
        // Build the new set aside and swap it in only when every step succeeded.
        let mut staged = current.clone();
        staged.retain(|assignment| assignment.principal_id != principal_id);
        staged.insert(RoleAssignment::new(principal_id, role)?);
        *current = staged;
        Ok(())
    }

    async fn clear_roles(&self, principal_id: &str) -> StoreResult<u64> {
        let mut current = self.assignments.write().await;
        let before = current.len();
        current.retain(|assignment| assignment.principal_id != principal_id);
        Ok((before - current.len()) as u64)
    }

    async fn roles_for_principal(&self, principal_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .assignments
            .read()
            .await
            .iter()
            .filter(|assignment| assignment.principal_id == principal_id)
            .map(|assignment| assignment.role.clone())
            .collect())
    }

    async fn principals_for_role(&self, role: &str) -> StoreResult<Vec<String>> {
        let mut principals: Vec<String> = self
            .assignments
            .read()
            .await
            .iter()
            .filter(|assignment| assignment.role == role)
            .map(|assignment| assignment.principal_id.clone())
            .collect();
        principals.sort();
        Ok(principals)
    }
}

#[async_trait]
impl AppStore for InMemoryStore {
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
