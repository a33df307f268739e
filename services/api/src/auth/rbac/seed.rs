//! Startup seeding of the embedded default policy set.
use crate::auth::rbac::{PolicyEnforcer, RbacError};
use eztrip_authz::{DEFAULT_POLICY_VERSION, default_policies};

/// Insert the default rules when the store has none.
///
/// Seeding is atomic across replicas; an existing rule set is left alone,
/// even when it differs from the defaults.
pub async fn initialize_policies(enforcer: &PolicyEnforcer) -> Result<bool, RbacError> {
    let seeded = enforcer.seed_defaults(default_policies()).await?;
    if seeded {
        tracing::info!(version = DEFAULT_POLICY_VERSION, "seeded default policies");
    } else {
        tracing::info!(
            version = DEFAULT_POLICY_VERSION,
            "policy store already populated; skipping default seed"
        );
    }
    Ok(seeded)
}
