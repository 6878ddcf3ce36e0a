use thiserror::Error;

use crate::provider::ProviderError;
use crate::store::StoreError;
use crate::tokens::TokenError;

/// Errors surfaced to API callers. Everything lower in the stack folds
/// into one of these before it crosses the HTTP boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("provider credentials missing or rejected: {0}")]
    Auth(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth(message) => ServiceError::Auth(message),
            other => ServiceError::Provider(other.to_string()),
        }
    }
}

impl From<TokenError> for ServiceError {
    fn from(err: TokenError) -> Self {
        ServiceError::Auth(err.to_string())
    }
}
