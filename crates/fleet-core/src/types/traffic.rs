use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::WireCodec;
use crate::error::CodecError;
use crate::types::NodeId;

/// Traffic accumulated by one node over one reporting window.
///
/// `window_end` is strictly increasing per node and doubles as the
/// idempotence key the control plane uses to discard retransmissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample {
    /// Reporting node
    pub node_id: NodeId,

    /// Bytes sent upstream during the window
    #[serde(default)]
    pub bytes_up: u64,

    /// Bytes received during the window
    #[serde(default)]
    pub bytes_down: u64,

    /// Window start (inclusive)
    pub window_start: DateTime<Utc>,

    /// Window end (exclusive)
    pub window_end: DateTime<Utc>,
}

impl TrafficSample {
    /// Total bytes in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.bytes_up.saturating_add(self.bytes_down)
    }

    /// Returns true if no traffic was recorded
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes_up == 0 && self.bytes_down == 0
    }
}

impl WireCodec for TrafficSample {
    fn validate(&self) -> Result<(), CodecError> {
        if self.window_end < self.window_start {
            return Err(CodecError::schema(format!(
                "window_end {} precedes window_start {}",
                self.window_end, self.window_start
            )));
        }
        Ok(())
    }
}

/// Cumulative usage committed for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Total bytes sent upstream
    pub bytes_up: u64,
    /// Total bytes received
    pub bytes_down: u64,
    /// Number of reports committed
    pub reports: u64,
}

impl Usage {
    /// Add a sample's bytes to the running totals.
    pub fn add(&mut self, sample: &TrafficSample) {
        self.bytes_up = self.bytes_up.saturating_add(sample.bytes_up);
        self.bytes_down = self.bytes_down.saturating_add(sample.bytes_down);
        self.reports += 1;
    }

    /// Total bytes in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.bytes_up.saturating_add(self.bytes_down)
    }
}
