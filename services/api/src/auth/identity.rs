//! Maps a verified token subject onto an internal principal.
//!
//! # Purpose
//! Looks up the principal linked to the token's external subject and, when
//! enabled, provisions one on first login.
//!
//! # Key invariants
//! - At most one principal exists per external subject, even under concurrent
//!   first logins (the directory upsert is keyed on a unique constraint).
//! - Only the call that created the principal assigns the default role.
//! - Soft-deleted principals are never resurrected.
//! - Failures never abort the request here; the identity is simply unset and
//!   identity-requiring operations reject later.
use crate::auth::oidc::ValidatedClaims;
use crate::auth::rbac::{PolicyEnforcer, RbacError};
use crate::model::{NewPrincipal, Principal};
use crate::observability::PRINCIPALS_PROVISIONED_TOTAL;
use crate::store::{DirectoryStore, StoreError};
use eztrip_authz::RoleAssignment;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("directory error: {0}")]
    Directory(#[from] StoreError),
    /// The subject maps to a deactivated principal, or its profile clashes
    /// with another live principal.
    #[error("subject cannot be linked: {0}")]
    Unlinkable(String),
}

#[derive(Clone)]
pub struct IdentityResolver {
    directory: Arc<dyn DirectoryStore>,
    enforcer: Arc<PolicyEnforcer>,
    auto_provision: bool,
    default_role: Option<String>,
}

impl IdentityResolver {
    pub fn new(
        directory: Arc<dyn DirectoryStore>,
        enforcer: Arc<PolicyEnforcer>,
        auto_provision: bool,
        default_role: Option<String>,
    ) -> Self {
        Self {
            directory,
            enforcer,
            auto_provision,
            default_role,
        }
    }

    /// Resolve `claims` to a principal, logging and swallowing failures.
    pub async fn resolve(&self, claims: &ValidatedClaims) -> Option<Principal> {
        match self.try_resolve(claims).await {
            Ok(principal) => principal,
            Err(IdentityError::Unlinkable(reason)) => {
                tracing::warn!(subject = %claims.subject, reason = %reason, "token subject cannot be linked");
                None
            }
            Err(err) => {
                tracing::error!(error = %err, subject = %claims.subject, "identity resolution failed");
                None
            }
        }
    }

    /// Resolve `claims` to a principal.
    ///
    /// Returns `Ok(None)` when the subject is not linked and provisioning is
    /// disabled.
    ///
    /// # Errors
    /// [`IdentityError::Unlinkable`] for a soft-deleted principal or a
    /// conflicting profile, otherwise directory failures.
    pub async fn try_resolve(
        &self,
        claims: &ValidatedClaims,
    ) -> Result<Option<Principal>, IdentityError> {
        if let Some(principal) = self.directory.find_by_external_id(&claims.subject).await? {
            return Ok(Some(principal));
        }
        if !self.auto_provision {
            tracing::debug!(subject = %claims.subject, "subject not linked to a principal");
            return Ok(None);
        }

        let upserted = match self
            .directory
            .upsert_by_external_id(&claims.subject, claims.profile())
            .await
        {
            Ok(upserted) => upserted,
            Err(StoreError::Conflict(reason)) => return Err(IdentityError::Unlinkable(reason)),
            Err(err) => return Err(err.into()),
        };
        if upserted.created {
            metrics::counter!(PRINCIPALS_PROVISIONED_TOTAL).increment(1);
            tracing::info!(
                principal = %upserted.principal.id,
                subject = %claims.subject,
                "provisioned principal on first login"
            );
            self.assign_default_role(&upserted.principal).await;
        }
        Ok(Some(upserted.principal))
    }

    async fn assign_default_role(&self, principal: &Principal) {
        let Some(role) = self.default_role.as_deref() else {
            return;
        };
        let result = match RoleAssignment::new(principal.policy_id(), role) {
            Ok(assignment) => self.enforcer.add_role(assignment).await.map(|_| ()),
            Err(err) => Err(RbacError::Engine(err)),
        };
        if let Err(err) = result {
            tracing::error!(
                error = %err,
                principal = %principal.id,
                role,
                "failed to assign default role"
            );
        }
    }
}

impl ValidatedClaims {
    /// Profile used when provisioning a principal for this subject.
    pub fn profile(&self) -> NewPrincipal {
        let (first_name, last_name) = match (&self.given_name, &self.family_name) {
            (Some(given), family) => (given.clone(), family.clone().unwrap_or_default()),
            (None, Some(family)) => (String::new(), family.clone()),
            (None, None) => split_name(self.name.as_deref().unwrap_or_default()),
        };
        NewPrincipal {
            external_id: Some(self.subject.clone()),
            email: self.email.clone(),
            first_name,
            last_name,
        }
    }
}

fn split_name(name: &str) -> (String, String) {
    let name = name.trim();
    match name.split_once(' ') {
        Some((first, last)) => (first.to_string(), last.trim().to_string()),
        None => (name.to_string(), String::new()),
    }
}
