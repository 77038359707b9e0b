use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

use crate::error::{Result, SyncError};
use crate::types::{NodeId, TrafficSample, Usage};

/// Node credential. Debug output never shows the secret.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Wrap a secret string
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if no secret is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Masked form for display (`abcd...wxyz`)
    #[must_use]
    pub fn masked(&self) -> String {
        if self.0.len() > 8 && self.0.is_ascii() {
            format!("{}...{}", &self.0[..4], &self.0[self.0.len() - 4..])
        } else {
            "****".to_string()
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl From<&str> for Credential {
    fn from(secret: &str) -> Self {
        Self::new(secret)
    }
}

/// Node request for its current configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Requesting node
    pub node_id: NodeId,
    /// Node credential
    pub credential: Credential,
    /// Version the node currently runs (0 = nothing cached)
    #[serde(default)]
    pub cached_version: u64,
}

/// Control plane answer to a [`PullRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullResponse {
    /// The cached version is current
    Unchanged {
        /// Current version
        version: u64,
    },
    /// A different version is current; `payload` is the encoded record
    Updated {
        /// Current version
        version: u64,
        /// Wire-encoded [`ConfigRecord`](crate::ConfigRecord)
        payload: Vec<u8>,
    },
}

impl PullResponse {
    /// Version the control plane reports as current
    #[must_use]
    pub const fn version(&self) -> u64 {
        match self {
            Self::Unchanged { version } | Self::Updated { version, .. } => *version,
        }
    }

    /// Convert into the JSON envelope sent over HTTP.
    pub fn into_envelope(self) -> Result<PullEnvelope> {
        match self {
            Self::Unchanged { version } => Ok(PullEnvelope {
                version,
                status: PullStatus::Unchanged,
                config: None,
            }),
            Self::Updated { version, payload } => {
                let text = String::from_utf8(payload)
                    .map_err(|e| SyncError::MalformedPayload(e.to_string()))?;
                let raw = RawValue::from_string(text)
                    .map_err(|e| SyncError::MalformedPayload(e.to_string()))?;
                Ok(PullEnvelope {
                    version,
                    status: PullStatus::Updated,
                    config: Some(raw),
                })
            }
        }
    }
}

/// Status tag carried by [`PullEnvelope`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    /// Cached version is current
    Unchanged,
    /// Envelope carries a new record
    Updated,
}

/// JSON body of a pull response.
///
/// The record stays raw here so decoding (and its error classification)
/// happens in exactly one place, the codec.
#[derive(Debug, Serialize, Deserialize)]
pub struct PullEnvelope {
    /// Current version
    pub version: u64,
    /// Whether a record is attached
    pub status: PullStatus,
    /// Raw record JSON when `status` is `updated`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Box<RawValue>>,
}

impl TryFrom<PullEnvelope> for PullResponse {
    type Error = SyncError;

    fn try_from(envelope: PullEnvelope) -> Result<Self> {
        match (envelope.status, envelope.config) {
            (PullStatus::Unchanged, _) => Ok(Self::Unchanged {
                version: envelope.version,
            }),
            (PullStatus::Updated, Some(raw)) => Ok(Self::Updated {
                version: envelope.version,
                payload: raw.get().as_bytes().to_vec(),
            }),
            (PullStatus::Updated, None) => Err(SyncError::MalformedPayload(
                "updated pull response without config".into(),
            )),
        }
    }
}

/// Node traffic report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Reporting node
    pub node_id: NodeId,
    /// Node credential
    pub credential: Credential,
    /// Traffic since the last acknowledged report
    pub sample: TrafficSample,
}

/// Control plane acknowledgment of a [`PushRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// The report is committed (possibly earlier, see `duplicate`)
    pub accepted: bool,
    /// The window was already committed; nothing was added
    #[serde(default)]
    pub duplicate: bool,
    /// Cumulative usage after this report
    #[serde(default)]
    pub cumulative: Usage,
}

/// Node-facing control plane.
///
/// Implemented over HTTP for real deployments and in-process for tests and
/// embedded setups.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch the current configuration if it differs from the cached version
    async fn pull(&self, request: PullRequest) -> Result<PullResponse>;

    /// Submit a traffic report
    async fn push(&self, request: PushRequest) -> Result<PushAck>;
}
