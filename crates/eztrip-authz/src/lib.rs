//! Authorization primitives for the eztrip API.
//!
//! # Purpose
//! Holds the policy data model (rules and role assignments), the embedded
//! Casbin model, the default policy set, and the helpers that compile a rule
//! snapshot into an in-memory enforcer.
//!
//! # How it fits
//! The API service owns persistence and request handling. This crate has no
//! I/O: it validates policy input and answers `(principal, resource, action)`
//! questions against a snapshot handed to it.
//!
//! # Key invariants
//! - Rules are purely additive; there is no deny effect.
//! - `*` is the only wildcard and matches a whole field, never a substring.
//! - Role inheritance is transitive and bounded by [`MAX_ROLE_DEPTH`].
//!
//! # Examples
//! ```rust
//! use eztrip_authz::{PolicyRule, RoleAssignment, WILDCARD};
//!
//! let rule = PolicyRule::new("admin", WILDCARD, WILDCARD).unwrap();
//! assert_eq!(rule.action, "*");
//! assert!(RoleAssignment::new("alice", WILDCARD).is_err());
//! ```

mod casbin_model;
mod defaults;
mod engine;
mod errors;
mod policy;

pub use casbin_model::{casbin_model, casbin_model_string};
pub use defaults::{
    DEFAULT_POLICY_VERSION, RESOURCE_CURRENT_USER, RESOURCE_USER, RESOURCE_USERS, ROLE_ADMIN,
    ROLE_USER, default_policies,
};
pub use engine::{MAX_ROLE_DEPTH, build_enforcer, effective_roles, enforce};
pub use errors::{AuthzError, AuthzResult};
pub use policy::{PolicyRule, RoleAssignment, WILDCARD};
