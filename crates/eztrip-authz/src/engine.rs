//! Compiles a policy snapshot into a Casbin enforcer and answers checks.
//!
//! # Purpose and responsibility
//! Given the full rule set and role graph, builds an in-memory enforcer with
//! the embedded model. The enforcer is immutable once built; callers replace
//! it wholesale when policy changes.
//!
//! # Key invariants
//! - A check is allowed iff some rule matches the principal (directly, via a
//!   held role, or via `*`), the resource (or `*`) and the action (or `*`).
//! - Errors from the engine are returned, never folded into a denial.
//! - [`effective_roles`] follows the same depth bound as the Casbin role
//!   manager so role checks and permission checks agree.
use crate::{AuthzResult, PolicyRule, RoleAssignment, casbin_model};
use casbin::{CoreApi, Enforcer, MemoryAdapter, MgmtApi};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Longest role chain followed when resolving inherited roles.
pub const MAX_ROLE_DEPTH: usize = 10;

/// Build an enforcer holding exactly `rules` and `assignments`.
///
/// # Errors
/// Returns an error if the model fails to parse or Casbin rejects a rule.
pub async fn build_enforcer(
    rules: &[PolicyRule],
    assignments: &[RoleAssignment],
) -> AuthzResult<Enforcer> {
    // Step 1: Load the embedded model into an empty in-memory adapter.
    let model = casbin_model().await?;
    let mut enforcer = Enforcer::new(model, MemoryAdapter::default()).await?;

    // Step 2: Insert grants. Duplicates in the input are harmless; Casbin
    // reports them as not-added.
    for rule in rules {
        enforcer.add_policy(rule.to_casbin()).await?;
    }

    // Step 3: Insert the role graph and rebuild role links.
    for assignment in assignments {
        enforcer.add_grouping_policy(assignment.to_casbin()).await?;
    }
    enforcer.build_role_links()?;
    Ok(enforcer)
}

/// Evaluate `(principal, resource, action)` against a built enforcer.
pub fn enforce(
    enforcer: &Enforcer,
    principal: &str,
    resource: &str,
    action: &str,
) -> AuthzResult<bool> {
    Ok(enforcer.enforce((principal, resource, action))?)
}

/// Roles held by `principal`, directly or through inheritance.
///
/// The principal itself is not included. Cycles in the role graph are
/// tolerated.
pub fn effective_roles(assignments: &[RoleAssignment], principal: &str) -> BTreeSet<String> {
    let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
    for assignment in assignments {
        parents
            .entry(assignment.principal_id.as_str())
            .or_default()
            .push(assignment.role.as_str());
    }

    let mut roles = BTreeSet::new();
    let mut queue = VecDeque::from([(principal, 0usize)]);
    while let Some((current, depth)) = queue.pop_front() {
        if depth >= MAX_ROLE_DEPTH {
            continue;
        }
        let Some(next) = parents.get(current) else {
            continue;
        };
        for role in next {
            if *role != principal && roles.insert((*role).to_string()) {
                queue.push_back((*role, depth + 1));
            }
        }
    }
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ROLE_ADMIN, ROLE_USER, default_policies};

    fn assign(principal: &str, role: &str) -> RoleAssignment {
        RoleAssignment::new(principal, role).expect("assignment")
    }

    #[tokio::test]
    async fn admin_role_allows_anything() {
        let enforcer = build_enforcer(&default_policies(), &[assign("admin1", ROLE_ADMIN)])
            .await
            .expect("enforcer");
        assert!(enforce(&enforcer, "admin1", "trips", "delete").expect("check"));
        assert!(enforce(&enforcer, "admin1", "users", "create").expect("check"));
    }

    #[tokio::test]
    async fn user_role_reads_users_but_cannot_delete() {
        let enforcer = build_enforcer(&default_policies(), &[assign("bob", ROLE_USER)])
            .await
            .expect("enforcer");
        assert!(enforce(&enforcer, "bob", "users", "read").expect("check"));
        assert!(enforce(&enforcer, "bob", "currentUser", "update").expect("check"));
        assert!(!enforce(&enforcer, "bob", "users", "delete").expect("check"));
        assert!(!enforce(&enforcer, "bob", "trips", "delete").expect("check"));
    }

    #[tokio::test]
    async fn principal_without_roles_is_denied() {
        let enforcer = build_enforcer(&default_policies(), &[])
            .await
            .expect("enforcer");
        assert!(!enforce(&enforcer, "carol", "users", "read").expect("check"));
    }

    #[tokio::test]
    async fn rules_may_name_a_principal_directly() {
        let rules = vec![PolicyRule::new("dave", "trips", "share").expect("rule")];
        let enforcer = build_enforcer(&rules, &[]).await.expect("enforcer");
        assert!(enforce(&enforcer, "dave", "trips", "share").expect("check"));
        assert!(!enforce(&enforcer, "erin", "trips", "share").expect("check"));
    }

    #[tokio::test]
    async fn wildcard_subject_matches_everyone() {
        let rules = vec![PolicyRule::new("*", "places", "read").expect("rule")];
        let enforcer = build_enforcer(&rules, &[]).await.expect("enforcer");
        assert!(enforce(&enforcer, "anyone", "places", "read").expect("check"));
        assert!(!enforce(&enforcer, "anyone", "places", "write").expect("check"));
    }

    #[tokio::test]
    async fn wildcard_matches_whole_field_only() {
        let rules = vec![PolicyRule::new("bob", "currentUser", "*").expect("rule")];
        let enforcer = build_enforcer(&rules, &[]).await.expect("enforcer");
        assert!(enforce(&enforcer, "bob", "currentUser", "update").expect("check"));
        assert!(!enforce(&enforcer, "bob", "currentUsers", "update").expect("check"));
        assert!(!enforce(&enforcer, "bob", "current", "update").expect("check"));
    }

    #[tokio::test]
    async fn inherited_roles_grant_parent_permissions() {
        let rules = vec![PolicyRule::new("editor", "trips", "update").expect("rule")];
        let assignments = vec![assign("frank", "planner"), assign("planner", "editor")];
        let enforcer = build_enforcer(&rules, &assignments)
            .await
            .expect("enforcer");
        assert!(enforce(&enforcer, "frank", "trips", "update").expect("check"));
    }

    #[test]
    fn effective_roles_follow_inheritance_and_tolerate_cycles() {
        let assignments = vec![
            assign("frank", "planner"),
            assign("planner", "editor"),
            assign("editor", "planner"),
            assign("grace", ROLE_USER),
        ];
        let roles = effective_roles(&assignments, "frank");
        assert_eq!(
            roles.into_iter().collect::<Vec<_>>(),
            vec!["editor".to_string(), "planner".to_string()]
        );
        assert!(effective_roles(&assignments, "nobody").is_empty());
    }

    #[test]
    fn effective_roles_stop_at_depth_limit() {
        let mut assignments = Vec::new();
        for level in 0..(MAX_ROLE_DEPTH + 2) {
            let child = if level == 0 {
                "root-user".to_string()
            } else {
                format!("role-{level}")
            };
            assignments.push(assign(&child, &format!("role-{}", level + 1)));
        }
        let roles = effective_roles(&assignments, "root-user");
        assert_eq!(roles.len(), MAX_ROLE_DEPTH);
    }
}
