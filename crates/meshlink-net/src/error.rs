//! Node transport errors

use thiserror::Error;

/// Errors from the node-side transport layer
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Relay client has no live connection
    #[error("relay client is not connected")]
    NotConnected,

    /// Mux or socket has been closed
    #[error("mux is closed")]
    Closed,

    /// Wire codec failure
    #[error("codec error: {0}")]
    Codec(#[from] meshlink_types::TypesError),

    /// Relay URL could not be parsed
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
}

/// Result type for node transport operations
pub type NetResult<T> = Result<T, NetError>;
