//! Error types for coop nodes

use thiserror::Error;

/// Core coop errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoopError {
    /// Malformed key, value, target URI or event payload supplied by a caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A peer answered a well-known resource with something that is not a coop document
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Transport-level fetch or subscribe failure
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// JSON encoding or decoding failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// The node or bus has been stopped
    #[error("Closed")]
    Closed,
}

impl From<serde_json::Error> for CoopError {
    fn from(e: serde_json::Error) -> Self {
        CoopError::Codec(e.to_string())
    }
}

/// Result type for coop operations
pub type CoopResult<T> = Result<T, CoopError>;
