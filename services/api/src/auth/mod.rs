//! Authentication and authorization.
//!
//! # Purpose
//! Groups bearer token validation, signing key caching, identity resolution,
//! the RBAC enforcer service and the per-request authorization gate.
pub mod gate;
pub mod identity;
pub mod jwks;
pub mod middleware;
pub mod oidc;
pub mod rbac;
