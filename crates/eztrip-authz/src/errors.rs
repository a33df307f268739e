use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("invalid policy rule: {0}")]
    InvalidRule(String),
    #[error("invalid role assignment: {0}")]
    InvalidAssignment(String),
    #[error("casbin error: {0}")]
    Casbin(#[from] casbin::Error),
}

pub type AuthzResult<T> = Result<T, AuthzError>;
