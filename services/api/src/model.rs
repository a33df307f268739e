//! Domain types shared by stores, identity resolution and handlers.
pub mod principal;

pub use principal::{NewPrincipal, Principal, PrincipalPatch};
