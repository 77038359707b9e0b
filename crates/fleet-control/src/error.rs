//! Error types for the control plane.

use fleet_core::{CodecError, NodeId, SyncError};
use thiserror::Error;

/// Errors that can occur in control-plane operations.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Protocol-level failure (unknown node, bad credential, bad report).
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Record rejected by the codec.
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] CodecError),

    /// Node ID is already in the store.
    #[error("node {0} is already provisioned")]
    AlreadyProvisioned(NodeId),

    /// Requested version was never issued for the node.
    #[error("node {node_id} has no version {version}")]
    UnknownVersion { node_id: NodeId, version: u64 },

    /// Record carries a secret other than the node's credential.
    #[error("record secret for node {0} does not match its credential")]
    SecretMismatch(NodeId),

    /// Store state is inconsistent or a snapshot could not be used.
    #[error("state error: {0}")]
    State(String),

    /// System randomness was unavailable.
    #[error("key generation failed")]
    KeyGeneration,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControlError {
    pub(crate) const fn not_found(node_id: NodeId) -> Self {
        Self::Sync(SyncError::NotFound { node_id })
    }
}

impl From<ControlError> for SyncError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Sync(err) => err,
            ControlError::InvalidRecord(err) => err.into(),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, ControlError>;
