//! HTTP API module.
//!
//! # Purpose
//! Exposes route handler modules, request/response types and the error
//! mapping shared by every endpoint.
pub mod error;
pub mod openapi;
pub mod policies;
pub mod roles;
pub mod system;
pub mod types;
pub mod users;
