//! Control-plane error types

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the coordination service
#[derive(Debug, Error)]
pub enum ControlError {
    /// Lookup missed
    #[error("node not found")]
    NotFound,

    /// Expired key, disabled node, or bad provisioning secret
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    /// Request failed to decode or validate
    #[error("bad request: {0}")]
    BadRequest(String),

    /// IPAM prefix exhausted
    #[error("no free ip addresses in prefix available")]
    NoAddresses,

    /// Store failure
    #[error("store error: {0}")]
    Store(StoreError),

    /// IO failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else that should become a 500
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            other => Self::Store(other),
        }
    }
}

/// Result type for control-plane operations
pub type ControlResult<T> = Result<T, ControlError>;
