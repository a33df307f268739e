use crate::PolicyRule;

/// Bumped whenever the default rule set below changes.
pub const DEFAULT_POLICY_VERSION: u32 = 1;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";

pub const RESOURCE_USERS: &str = "users";
pub const RESOURCE_USER: &str = "user";
pub const RESOURCE_CURRENT_USER: &str = "currentUser";

const DEFAULTS: &[(&str, &str, &str)] = &[
    (ROLE_ADMIN, "*", "*"),
    (ROLE_USER, RESOURCE_USERS, "read"),
    (ROLE_USER, RESOURCE_USER, "read"),
    (ROLE_USER, RESOURCE_CURRENT_USER, "*"),
];

/// Rules seeded into an empty policy store at startup.
pub fn default_policies() -> Vec<PolicyRule> {
    DEFAULTS
        .iter()
        .map(|(subject, resource, action)| PolicyRule {
            subject: (*subject).to_string(),
            resource: (*resource).to_string(),
            action: (*action).to_string(),
        })
        .collect()
}
