//! Scheduler and retry configuration types.

use fleet_core::{Credential, NodeId};
use std::time::Duration;

/// Default per-request timeout before clamping to the interval
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff configuration for failed pushes
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Backoff after the first failure
    pub initial_backoff: Duration,

    /// Upper bound for any single backoff
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }

    /// Set initial backoff duration
    #[must_use]
    pub const fn initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Set maximum backoff duration
    #[must_use]
    pub const fn max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Calculate backoff for a given attempt (0-based)
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let initial = u64::try_from(self.initial_backoff.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(initial.saturating_mul(factor).min(max))
    }

    /// Backoff for an attempt, never longer than `ceiling`
    #[must_use]
    pub fn capped_backoff(&self, attempt: u32, ceiling: Duration) -> Duration {
        self.backoff_for(attempt).min(ceiling)
    }
}

/// Identity and tuning for one node's sync loops
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// This node's control-plane ID
    pub node_id: NodeId,

    /// Credential presented on every request
    pub credential: Credential,

    /// Requested per-request timeout; clamped to half the loop interval
    pub request_timeout: Duration,

    /// Push retry backoff
    pub retry: RetryConfig,
}

impl SchedulerConfig {
    /// Create a configuration with default timeout and retry settings
    #[must_use]
    pub fn new(node_id: NodeId, credential: Credential) -> Self {
        Self {
            node_id,
            credential,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    /// Set the request timeout
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set retry configuration
    #[must_use]
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Effective timeout for a request issued by a loop running at `interval`
    #[must_use]
    pub fn timeout_for(&self, interval: Duration) -> Duration {
        clamp_timeout(self.request_timeout, interval)
    }
}

pub(crate) fn clamp_timeout(requested: Duration, interval: Duration) -> Duration {
    requested.min(interval / 2).max(Duration::from_millis(1))
}
