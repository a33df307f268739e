//! RBAC module wiring.
//!
//! # Purpose
//! Exposes the cached policy enforcer service and startup seeding of the
//! default rule set.
pub mod enforcer;
pub mod seed;

pub use enforcer::{PolicyEnforcer, RbacError};
pub use seed::initialize_policies;
