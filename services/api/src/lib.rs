//! eztrip API service library crate.
//!
//! # Purpose
//! Exposes the HTTP surface, the authentication and authorization pipeline,
//! configuration and storage backends for use by the binary and tests.
//!
//! # Request pipeline
//! Every request passes through [`auth::middleware::authenticate`], which
//! validates the bearer token ([`auth::oidc`]), resolves the internal
//! principal once ([`auth::identity`]) and stores an
//! [`auth::gate::AuthContext`] in the request. Handlers ask the context for
//! permissions; decisions come from [`auth::rbac::PolicyEnforcer`], which
//! evaluates the store's rules with the Casbin model in `eztrip-authz`.
pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod model;
pub mod observability;
pub mod store;
