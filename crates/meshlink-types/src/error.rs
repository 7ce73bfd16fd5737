//! Protocol type errors

use thiserror::Error;

/// Errors from key parsing and wire codecs
#[derive(Debug, Error)]
pub enum TypesError {
    /// Key material had the wrong length
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Key text form was not valid base64
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),

    /// Buffer does not carry the probe magic
    #[error("payload is not a probe frame")]
    NotAProbe,

    /// Probe payload failed to encode or decode
    #[error("probe codec error: {0}")]
    ProbeCodec(#[from] serde_json::Error),

    /// Malformed or unexpected STUN message
    #[error("stun: {0}")]
    Stun(&'static str),
}

/// Result type for protocol codec operations
pub type TypesResult<T> = Result<T, TypesError>;
