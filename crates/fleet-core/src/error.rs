use thiserror::Error;

/// Result type alias for sync protocol operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised while encoding or decoding wire records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The payload could not be parsed as the expected record shape
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The payload parsed but breaks a record invariant
    #[error("schema violation: {0}")]
    SchemaViolation(String),
}

impl CodecError {
    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        Self::SchemaViolation(msg.into())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedPayload(err.to_string())
    }
}

/// Errors that can occur anywhere along the pull/push round trip
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Unparseable wire data
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Parseable but invalid record or report
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Node credential was rejected
    #[error("authentication failed for node {node_id}")]
    Auth {
        /// Node whose credential was rejected
        node_id: u64,
    },

    /// Node is unknown to the control plane
    #[error("node not found: {node_id}")]
    NotFound {
        /// Node that could not be resolved
        node_id: u64,
    },

    /// Transient transport failure
    #[error("network error: {0}")]
    Network(String),

    /// Request did not complete within its deadline
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Persistence layer failed
    #[error("storage error: {0}")]
    Storage(String),

    /// The sync loops are shutting down
    #[error("sync loop shut down")]
    Shutdown,
}

impl SyncError {
    /// Returns true if the error needs operator intervention and must not be retried
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::NotFound { .. })
    }

    /// Returns true if the error is transient and the request may be retried
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

impl From<CodecError> for SyncError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedPayload(msg) => Self::MalformedPayload(msg),
            CodecError::SchemaViolation(msg) => Self::SchemaViolation(msg),
        }
    }
}
