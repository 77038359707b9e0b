//! Local traffic accounting.
//!
//! Data-plane connection handlers call [`TrafficAggregator::record`] from any
//! thread. The push loop drains the accumulator into a [`TrafficSample`] and
//! hands failed samples back with [`TrafficAggregator::requeue`], which keeps
//! them verbatim so a retransmission carries the same `window_end`.

use chrono::{DateTime, Duration as WallDuration, Utc};
use fleet_core::{ConfigRecord, NodeId, TrafficSample};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Accumulator {
    bytes_up: u64,
    bytes_down: u64,
    window_start: DateTime<Utc>,
    last_window_end: Option<DateTime<Utc>>,
    last_flush: Instant,
    pending: VecDeque<TrafficSample>,
}

impl Accumulator {
    fn live_total(&self) -> u64 {
        self.bytes_up.saturating_add(self.bytes_down)
    }

    fn total(&self) -> u64 {
        self.pending
            .iter()
            .fold(self.live_total(), |acc, s| acc.saturating_add(s.total()))
    }

    // Window ends must strictly increase; two drains in the same
    // millisecond would otherwise look like a retransmission upstream.
    fn next_window_end(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_window_end {
            Some(last) if now <= last => last + WallDuration::milliseconds(1),
            _ => now.max(self.window_start),
        }
    }
}

/// Thread-safe byte counter for one node.
#[derive(Debug)]
pub struct TrafficAggregator {
    node_id: NodeId,
    state: Mutex<Accumulator>,
    threshold: AtomicU64,
    push_interval_ms: AtomicU64,
    crossed: Notify,
}

impl TrafficAggregator {
    /// Create an empty aggregator using the record's threshold and push interval.
    #[must_use]
    pub fn new(node_id: NodeId, record: &ConfigRecord) -> Self {
        let aggregator = Self {
            node_id,
            state: Mutex::new(Accumulator {
                bytes_up: 0,
                bytes_down: 0,
                window_start: Utc::now(),
                last_window_end: None,
                last_flush: Instant::now(),
                pending: VecDeque::new(),
            }),
            threshold: AtomicU64::new(0),
            push_interval_ms: AtomicU64::new(0),
            crossed: Notify::new(),
        };
        aggregator.configure(record);
        aggregator
    }

    /// Node whose traffic is being counted
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Adopt the threshold and push interval of a newly applied record.
    pub fn configure(&self, record: &ConfigRecord) {
        self.set_threshold(record.report_threshold());
        self.set_push_interval(record.push_interval());
    }

    /// Set the byte threshold (0 disables threshold-triggered flushes)
    pub fn set_threshold(&self, bytes: u64) {
        self.threshold.store(bytes, Ordering::Relaxed);
        // A lowered threshold may already be crossed.
        if bytes > 0 && self.state().total() >= bytes {
            self.crossed.notify_one();
        }
    }

    /// Current byte threshold
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Set the push interval
    pub fn set_push_interval(&self, interval: Duration) {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.push_interval_ms.store(ms, Ordering::Relaxed);
    }

    /// Current push interval
    #[must_use]
    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms.load(Ordering::Relaxed))
    }

    /// Count transferred bytes. Never blocks on I/O.
    pub fn record(&self, bytes_up: u64, bytes_down: u64) {
        let total = {
            let mut state = self.state();
            state.bytes_up = state.bytes_up.saturating_add(bytes_up);
            state.bytes_down = state.bytes_down.saturating_add(bytes_down);
            state.total()
        };

        let threshold = self.threshold();
        if threshold > 0 && total >= threshold {
            self.crossed.notify_one();
        }
    }

    /// Bytes waiting to be reported, including requeued samples
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.state().total()
    }

    /// Returns true if nothing is waiting to be reported
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let state = self.state();
        state.pending.is_empty() && state.live_total() == 0
    }

    /// Number of failed samples awaiting retransmission
    #[must_use]
    pub fn pending_samples(&self) -> usize {
        self.state().pending.len()
    }

    /// True once the threshold is reached or the push interval has elapsed
    #[must_use]
    pub fn should_flush(&self) -> bool {
        let threshold = self.threshold();
        let state = self.state();
        (threshold > 0 && state.total() >= threshold)
            || state.last_flush.elapsed() >= self.push_interval()
    }

    /// When the push timer next expires
    #[must_use]
    pub fn flush_deadline(&self) -> Instant {
        self.state().last_flush + self.push_interval()
    }

    /// Restart the push timer, called after an acknowledged push
    pub fn mark_flushed(&self) {
        self.state().last_flush = Instant::now();
    }

    /// Take the next sample to report and reset the accumulator.
    ///
    /// Requeued samples are returned first and unchanged. Otherwise the live
    /// counters are moved into a new sample and zeroed in the same critical
    /// section, so a byte is never in both the sample and the accumulator.
    pub fn drain(&self) -> TrafficSample {
        let mut state = self.state();
        if let Some(sample) = state.pending.pop_front() {
            return sample;
        }

        let window_end = state.next_window_end();
        let sample = TrafficSample {
            node_id: self.node_id,
            bytes_up: std::mem::take(&mut state.bytes_up),
            bytes_down: std::mem::take(&mut state.bytes_down),
            window_start: state.window_start,
            window_end,
        };
        state.window_start = window_end;
        state.last_window_end = Some(window_end);
        sample
    }

    /// Hand back a sample whose push failed.
    pub fn requeue(&self, sample: TrafficSample) {
        self.state().pending.push_back(sample);
    }

    /// Wait until a `record` call crosses the threshold.
    ///
    /// A crossing that happens while nobody waits is remembered for the next
    /// waiter.
    pub async fn threshold_crossed(&self) {
        self.crossed.notified().await;
    }

    fn state(&self) -> MutexGuard<'_, Accumulator> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
