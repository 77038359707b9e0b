//! Per-node pull and push loops.
//!
//! Two independent tasks run per node:
//!
//! ```text
//! pull:  Idle -> Pulling -> Applying -> Idle        every pull interval
//! push:  Idle -> PushPending -> Pushing -> Idle     push interval or threshold
//! ```
//!
//! They share only the [`RecordSlot`] and the [`TrafficAggregator`]. When the
//! push timer and a threshold crossing race, whichever wakes the loop first
//! wins and the other is absorbed into the next cycle.

use fleet_core::{
    ConfigRecord, ControlPlane, Credential, NodeId, PullRequest, PullResponse, PushAck,
    PushRequest, Result, SyncError, TrafficSample, VersionedRecord, WireCodec,
};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::aggregator::TrafficAggregator;
use crate::config::{clamp_timeout, RetryConfig, SchedulerConfig};
use crate::slot::{RecordApplier, RecordSlot};

/// Pull loop state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullState {
    /// Waiting for the next pull
    #[default]
    Idle,
    /// Request in flight
    Pulling,
    /// Decoding and installing a new record
    Applying,
}

/// Push loop state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PushState {
    /// Waiting for a trigger
    #[default]
    Idle,
    /// Triggered, sample being drained
    PushPending,
    /// Report in flight
    Pushing,
}

/// Observable sync status of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Pull loop state
    pub pull: PullState,
    /// Push loop state
    pub push: PushState,
    /// Active record version
    pub version: u64,
    /// Terminal error that stopped both loops until the credential is rotated
    pub halted: Option<SyncError>,
    /// Consecutive failed pushes
    pub push_failures: u32,
}

/// Result of one pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The active record is already current
    Unchanged {
        /// Active version
        version: u64,
    },
    /// A new record was installed
    Applied {
        /// Version that was replaced
        previous: u64,
        /// Version now active
        version: u64,
    },
}

struct Shared {
    node_id: NodeId,
    credential: RwLock<Credential>,
    request_timeout: Duration,
    retry: RetryConfig,
    plane: Arc<dyn ControlPlane>,
    slot: Arc<RecordSlot>,
    aggregator: Arc<TrafficAggregator>,
    applier: Option<Arc<dyn RecordApplier>>,
    status: watch::Sender<SyncStatus>,
    halted: watch::Sender<bool>,
}

impl Shared {
    fn credential(&self) -> Credential {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn timeout_for(&self, interval: Duration) -> Duration {
        clamp_timeout(self.request_timeout, interval)
    }

    fn set_pull(&self, state: PullState) {
        self.status.send_modify(|s| s.pull = state);
    }

    fn set_push(&self, state: PushState) {
        self.status.send_modify(|s| s.push = state);
    }

    fn halt(&self, err: SyncError) {
        error!(
            node_id = self.node_id,
            error = %err,
            "sync halted; rotate the node credential to resume"
        );
        self.status.send_modify(|s| s.halted = Some(err));
        self.halted.send_replace(true);
    }

    async fn pull_once(&self) -> Result<PullOutcome> {
        self.set_pull(PullState::Pulling);
        let result = self.pull_inner().await;
        self.set_pull(PullState::Idle);
        result
    }

    async fn pull_inner(&self) -> Result<PullOutcome> {
        let current = self.slot.current();
        let request = PullRequest {
            node_id: self.node_id,
            credential: self.credential(),
            cached_version: current.version,
        };
        let timeout = self.timeout_for(current.record.pull_interval());
        debug!(node_id = self.node_id, cached = current.version, "pulling config");

        let response = tokio::time::timeout(timeout, self.plane.pull(request))
            .await
            .map_err(|_| SyncError::Timeout(millis(timeout)))??;

        let (version, payload) = match response {
            PullResponse::Unchanged { version } => {
                debug!(node_id = self.node_id, version, "config unchanged");
                return Ok(PullOutcome::Unchanged {
                    version: current.version,
                });
            }
            PullResponse::Updated { version, .. } if version == current.version => {
                debug!(node_id = self.node_id, version, "config unchanged");
                return Ok(PullOutcome::Unchanged { version });
            }
            PullResponse::Updated { version, payload } => (version, payload),
        };

        self.set_pull(PullState::Applying);
        let record = ConfigRecord::decode(&payload)?;
        let next = VersionedRecord::new(version, record);
        if let Some(applier) = &self.applier {
            applier.apply(&next)?;
        }

        self.aggregator.configure(&next.record);
        let previous = self.slot.swap(next);
        self.status.send_modify(|s| s.version = version);
        info!(
            node_id = self.node_id,
            previous = previous.version,
            version,
            "applied config"
        );

        Ok(PullOutcome::Applied {
            previous: previous.version,
            version,
        })
    }

    async fn send_report(&self, sample: TrafficSample) -> Result<PushAck> {
        let interval = self.aggregator.push_interval();
        let timeout = self.timeout_for(interval);
        let request = PushRequest {
            node_id: self.node_id,
            credential: self.credential(),
            sample,
        };

        tokio::time::timeout(timeout, self.plane.push(request))
            .await
            .map_err(|_| SyncError::Timeout(millis(timeout)))?
    }

    async fn push_once(&self) -> Result<PushAck> {
        self.set_push(PushState::PushPending);
        let sample = self.aggregator.drain();
        self.set_push(PushState::Pushing);

        let result = self.send_report(sample.clone()).await;
        self.settle(sample, &result);
        self.set_push(PushState::Idle);
        result
    }

    fn settle(&self, sample: TrafficSample, result: &Result<PushAck>) {
        match result {
            Ok(ack) => {
                self.aggregator.mark_flushed();
                self.status.send_modify(|s| s.push_failures = 0);
                info!(
                    node_id = self.node_id,
                    bytes_up = sample.bytes_up,
                    bytes_down = sample.bytes_down,
                    duplicate = ack.duplicate,
                    "traffic report acknowledged"
                );
            }
            Err(err) if err.is_retryable() || err.is_terminal() => {
                self.aggregator.requeue(sample);
                self.record_failure();
            }
            Err(err) => {
                // Resending a rejected sample would fail the same way.
                self.aggregator.mark_flushed();
                self.record_failure();
                warn!(
                    node_id = self.node_id,
                    error = %err,
                    bytes_up = sample.bytes_up,
                    bytes_down = sample.bytes_down,
                    window_end = %sample.window_end,
                    "traffic report rejected; sample dropped"
                );
            }
        }
    }

    fn record_failure(&self) {
        self.status
            .send_modify(|s| s.push_failures = s.push_failures.saturating_add(1));
    }
}

/// Drives the pull and push loops for one node.
pub struct SyncScheduler {
    shared: Shared,
}

impl SyncScheduler {
    /// Create a scheduler. `bootstrap` is active until the first pull succeeds.
    pub fn new(
        config: SchedulerConfig,
        plane: Arc<dyn ControlPlane>,
        bootstrap: ConfigRecord,
    ) -> Self {
        let aggregator = Arc::new(TrafficAggregator::new(config.node_id, &bootstrap));
        let slot = Arc::new(RecordSlot::new(bootstrap));
        let (status, _rx) = watch::channel(SyncStatus::default());
        let (halted, _rx) = watch::channel(false);

        Self {
            shared: Shared {
                node_id: config.node_id,
                credential: RwLock::new(config.credential),
                request_timeout: config.request_timeout,
                retry: config.retry,
                plane,
                slot,
                aggregator,
                applier: None,
                status,
                halted,
            },
        }
    }

    /// Install a runtime hook called before each new record becomes active.
    #[must_use]
    pub fn with_applier(mut self, applier: Arc<dyn RecordApplier>) -> Self {
        self.shared.applier = Some(applier);
        self
    }

    /// Traffic accumulator shared with the data plane
    #[must_use]
    pub fn aggregator(&self) -> Arc<TrafficAggregator> {
        Arc::clone(&self.shared.aggregator)
    }

    /// Active record slot
    #[must_use]
    pub fn slot(&self) -> Arc<RecordSlot> {
        Arc::clone(&self.shared.slot)
    }

    /// Subscribe to sync status
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    /// Run a single pull and apply step.
    pub async fn pull_once(&self) -> Result<PullOutcome> {
        self.shared.pull_once().await
    }

    /// Drain and push one sample.
    ///
    /// A sample that fails on the network or with a terminal error is
    /// requeued; one the control plane rejects is dropped.
    pub async fn push_once(&self) -> Result<PushAck> {
        self.shared.push_once().await
    }

    /// Spawn both loops on the current tokio runtime.
    pub fn spawn(self) -> SyncHandle {
        let shared = Arc::new(self.shared);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let pull_task = tokio::spawn(pull_loop(Arc::clone(&shared), shutdown_rx.clone()));
        let push_task = tokio::spawn(push_loop(Arc::clone(&shared), shutdown_rx));

        info!(node_id = shared.node_id, "sync loops started");

        SyncHandle {
            shared,
            shutdown,
            pull_task,
            push_task,
        }
    }
}

/// Handle to running sync loops.
pub struct SyncHandle {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    pull_task: JoinHandle<()>,
    push_task: JoinHandle<()>,
}

impl SyncHandle {
    /// Subscribe to sync status
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    /// Traffic accumulator shared with the data plane
    #[must_use]
    pub fn aggregator(&self) -> Arc<TrafficAggregator> {
        Arc::clone(&self.shared.aggregator)
    }

    /// Snapshot of the active record
    #[must_use]
    pub fn active_record(&self) -> VersionedRecord {
        self.shared.slot.current()
    }

    /// Install a new credential and resume halted loops.
    pub fn rotate_credential(&self, credential: Credential) {
        *self
            .shared
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = credential;
        self.shared.status.send_modify(|s| s.halted = None);
        self.shared.halted.send_replace(false);
        info!(node_id = self.shared.node_id, "node credential rotated");
    }

    /// Stop both loops and flush remaining traffic.
    ///
    /// In-flight requests are abandoned. Requeued samples and the live
    /// counters are pushed in order until nothing is left or a push fails,
    /// all within one push interval. Returns the last push result, or `None`
    /// when there was nothing to flush or the loops were halted.
    pub async fn shutdown(self) -> Option<Result<PushAck>> {
        // Receivers may already be gone if both tasks ended.
        let _ = self.shutdown.send(true);
        for task in [self.pull_task, self.push_task] {
            if let Err(err) = task.await {
                warn!(node_id = self.shared.node_id, error = %err, "sync task ended abnormally");
            }
        }

        if *self.shared.halted.borrow() || self.shared.aggregator.is_empty() {
            info!(node_id = self.shared.node_id, "sync loops stopped");
            return None;
        }

        let shared = &self.shared;
        let budget = shared.aggregator.push_interval();
        let flush = async {
            loop {
                let result = shared.push_once().await;
                if result.is_err() || shared.aggregator.is_empty() {
                    break result;
                }
            }
        };
        let result = tokio::time::timeout(budget, flush)
            .await
            .unwrap_or_else(|_| Err(SyncError::Timeout(millis(budget))));
        match &result {
            Ok(_) => info!(node_id = self.shared.node_id, "final traffic flush complete"),
            Err(err) => warn!(
                node_id = self.shared.node_id,
                error = %err,
                unsent = self.shared.aggregator.total_bytes(),
                "final traffic flush failed"
            ),
        }
        Some(result)
    }
}

async fn pull_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut halted = shared.halted.subscribe();

    while wait_active(&mut halted, &mut shutdown).await {
        let outcome = tokio::select! {
            _ = shutdown.changed() => break,
            outcome = shared.pull_once() => outcome,
        };

        match outcome {
            Ok(_) => {}
            Err(err) if err.is_terminal() => {
                shared.halt(err);
                continue;
            }
            Err(err) => warn!(
                node_id = shared.node_id,
                error = %err,
                "config pull failed; keeping active record"
            ),
        }

        let interval = shared.slot.current().record.pull_interval();
        tokio::select! {
            _ = shutdown.changed() => break,
            () = sleep(interval) => {}
        }
    }
    shared.set_pull(PullState::Idle);
}

async fn push_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut halted = shared.halted.subscribe();
    let mut records = shared.slot.subscribe();
    let mut attempt: u32 = 0;
    let mut retry_at: Option<Instant> = None;

    while wait_active(&mut halted, &mut shutdown).await {
        let deadline = retry_at.unwrap_or_else(|| shared.aggregator.flush_deadline());
        let backing_off = retry_at.is_some();

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = halted.changed() => continue,
            changed = records.changed() => {
                if changed.is_err() {
                    break;
                }
                // The new record may carry a different push interval.
                continue;
            }
            () = sleep_until(deadline) => {}
            () = shared.aggregator.threshold_crossed(), if !backing_off => {
                if !shared.aggregator.should_flush() {
                    // Stale crossing, already covered by an earlier push.
                    continue;
                }
                debug!(node_id = shared.node_id, "traffic threshold reached");
            }
        }

        shared.set_push(PushState::PushPending);
        let sample = shared.aggregator.drain();
        shared.set_push(PushState::Pushing);

        let result = tokio::select! {
            _ = shutdown.changed() => {
                shared.aggregator.requeue(sample);
                break;
            }
            result = shared.send_report(sample.clone()) => result,
        };
        shared.settle(sample, &result);
        shared.set_push(PushState::Idle);

        match result {
            Ok(_) => {
                attempt = 0;
                retry_at = None;
            }
            Err(err) if err.is_terminal() => {
                attempt = 0;
                retry_at = None;
                shared.halt(err);
            }
            Err(err) if err.is_retryable() => {
                let backoff = shared
                    .retry
                    .capped_backoff(attempt, shared.aggregator.push_interval());
                attempt = attempt.saturating_add(1);
                retry_at = Some(Instant::now() + backoff);
                warn!(
                    node_id = shared.node_id,
                    error = %err,
                    attempt,
                    backoff_ms = millis(backoff),
                    "traffic push failed; sample kept for retry"
                );
            }
            Err(_) => {
                attempt = 0;
                retry_at = None;
            }
        }
    }
    shared.set_push(PushState::Idle);
}

/// Wait until the loops are not halted. Returns false on shutdown.
async fn wait_active(
    halted: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *shutdown.borrow_and_update() {
            return false;
        }
        if !*halted.borrow_and_update() {
            return true;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            changed = halted.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleet_core::{OutboundRule, Usage};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted control plane: pops canned results, records every request.
    #[derive(Default)]
    struct Scripted {
        pulls: Mutex<VecDeque<Result<PullResponse>>>,
        pushes: Mutex<VecDeque<Result<PushAck>>>,
        pull_log: Mutex<Vec<PullRequest>>,
        push_log: Mutex<Vec<PushRequest>>,
    }

    impl Scripted {
        fn script_pull(&self, result: Result<PullResponse>) {
            self.pulls.lock().unwrap().push_back(result);
        }

        fn script_push(&self, result: Result<PushAck>) {
            self.pushes.lock().unwrap().push_back(result);
        }

        fn pushed(&self) -> Vec<PushRequest> {
            self.push_log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ControlPlane for Scripted {
        async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
            self.pull_log.lock().unwrap().push(request.clone());
            self.pulls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PullResponse::Unchanged {
                    version: request.cached_version,
                }))
        }

        async fn push(&self, request: PushRequest) -> Result<PushAck> {
            self.push_log.lock().unwrap().push(request);
            self.pushes.lock().unwrap().pop_front().unwrap_or(Ok(ack()))
        }
    }

    fn ack() -> PushAck {
        PushAck {
            accepted: true,
            duplicate: false,
            cumulative: Usage::default(),
        }
    }

    fn updated(version: u64, record: &ConfigRecord) -> Result<PullResponse> {
        Ok(PullResponse::Updated {
            version,
            payload: record.encode().unwrap(),
        })
    }

    fn bootstrap() -> ConfigRecord {
        ConfigRecord {
            pull_interval: 60,
            push_interval: 60,
            traffic_report_threshold: 1_000_000,
            ..Default::default()
        }
    }

    fn scheduler(plane: &Arc<Scripted>) -> SyncScheduler {
        scheduler_with(plane, bootstrap())
    }

    fn scheduler_with(plane: &Arc<Scripted>, bootstrap: ConfigRecord) -> SyncScheduler {
        let config = SchedulerConfig::new(42, Credential::new("node-secret"))
            .retry(RetryConfig::new().initial_backoff(Duration::from_secs(1)));
        SyncScheduler::new(config, Arc::clone(plane) as Arc<dyn ControlPlane>, bootstrap)
    }

    #[tokio::test]
    async fn test_pull_applies_new_version() {
        let plane = Arc::new(Scripted::default());
        let record = ConfigRecord {
            pull_interval: 30,
            traffic_report_threshold: 500,
            ..Default::default()
        };
        plane.script_pull(updated(7, &record));

        let scheduler = scheduler(&plane);
        let outcome = scheduler.pull_once().await.unwrap();
        assert_eq!(
            outcome,
            PullOutcome::Applied {
                previous: 0,
                version: 7
            }
        );
        assert_eq!(scheduler.slot().current().record.pull_interval, 30);
        assert_eq!(scheduler.aggregator().threshold(), 500);
        assert_eq!(scheduler.status().borrow().version, 7);

        let sent = plane.pull_log.lock().unwrap()[0].clone();
        assert_eq!(sent.node_id, 42);
        assert_eq!(sent.cached_version, 0);
        assert_eq!(sent.credential.expose(), "node-secret");
    }

    #[tokio::test]
    async fn test_idempotent_pull() {
        let plane = Arc::new(Scripted::default());
        let record = ConfigRecord {
            block: vec!["ads.example.com".into()],
            ..Default::default()
        };
        plane.script_pull(updated(2, &record));
        // Same version resent in full must not re-apply.
        plane.script_pull(updated(2, &record));
        plane.script_pull(Ok(PullResponse::Unchanged { version: 2 }));

        let scheduler = scheduler(&plane);
        let mut updates = scheduler.slot().subscribe();
        scheduler.pull_once().await.unwrap();
        assert!(updates.has_changed().unwrap());
        updates.borrow_and_update();

        assert_eq!(
            scheduler.pull_once().await.unwrap(),
            PullOutcome::Unchanged { version: 2 }
        );
        assert_eq!(
            scheduler.pull_once().await.unwrap(),
            PullOutcome::Unchanged { version: 2 }
        );
        assert!(!updates.has_changed().unwrap());
        assert_eq!(plane.pull_log.lock().unwrap()[2].cached_version, 2);
    }

    #[tokio::test]
    async fn test_schema_violation_keeps_active_record() {
        let plane = Arc::new(Scripted::default());
        let outbound = OutboundRule {
            name: "dup".into(),
            protocol: "vmess".into(),
            address: "relay".into(),
            port: 443,
            ..Default::default()
        };
        let payload = serde_json::to_vec(&serde_json::json!({
            "Outbound": [outbound, outbound]
        }))
        .unwrap();
        plane.script_pull(Ok(PullResponse::Updated {
            version: 3,
            payload,
        }));
        plane.script_pull(Ok(PullResponse::Updated {
            version: 4,
            payload: b"{not json".to_vec(),
        }));

        let scheduler = scheduler(&plane);
        assert!(matches!(
            scheduler.pull_once().await,
            Err(SyncError::SchemaViolation(_))
        ));
        assert!(matches!(
            scheduler.pull_once().await,
            Err(SyncError::MalformedPayload(_))
        ));
        assert_eq!(scheduler.slot().version(), 0);
        assert_eq!(scheduler.slot().current().record, Arc::new(bootstrap()));
    }

    #[tokio::test]
    async fn test_failed_push_keeps_sample() {
        let plane = Arc::new(Scripted::default());
        plane.script_push(Err(SyncError::Network("connection reset".into())));

        let scheduler = scheduler(&plane);
        let agg = scheduler.aggregator();
        agg.record(300, 700);

        assert!(scheduler.push_once().await.unwrap_err().is_retryable());
        assert_eq!(agg.total_bytes(), 1000);
        assert_eq!(scheduler.status().borrow().push_failures, 1);

        // Accumulation continues while the failed sample waits.
        agg.record(1, 1);
        scheduler.push_once().await.unwrap();
        scheduler.push_once().await.unwrap();
        assert!(agg.is_empty());

        let pushed = plane.pushed();
        assert_eq!(pushed.len(), 3);
        // The retry is the same sample, so the control plane can dedupe it.
        assert_eq!(pushed[0].sample, pushed[1].sample);
        assert_eq!(pushed[2].sample.total(), 2);
        assert_eq!(scheduler.status().borrow().push_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_triggers_early_push() {
        let plane = Arc::new(Scripted::default());
        let handle = scheduler(&plane).spawn();
        let agg = handle.aggregator();

        sleep(Duration::from_secs(30)).await;
        agg.record(600_000, 600_000);
        sleep(Duration::from_millis(10)).await;

        let pushed = plane.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].sample.total(), 1_200_000);
        assert_eq!(agg.total_bytes(), 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_push_without_traffic() {
        let plane = Arc::new(Scripted::default());
        let handle = scheduler(&plane).spawn();

        sleep(Duration::from_secs(59)).await;
        assert!(plane.pushed().is_empty());

        sleep(Duration::from_secs(2)).await;
        let pushed = plane.pushed();
        assert_eq!(pushed.len(), 1);
        assert!(pushed[0].sample.is_empty());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_backoff_is_capped_by_interval() {
        let plane = Arc::new(Scripted::default());
        for _ in 0..10 {
            plane.script_push(Err(SyncError::Network("unreachable".into())));
        }
        let handle = scheduler(&plane).spawn();
        handle.aggregator().record(10, 10);

        // First timer push at 60s, retries after 1, 2, 4, 8, 16, 32, then 60 (capped).
        sleep(Duration::from_secs(60 + 63 + 1)).await;
        assert_eq!(plane.pushed().len(), 7);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(plane.pushed().len(), 8);

        // Every attempt carried the same sample.
        let pushed = plane.pushed();
        assert!(pushed.iter().all(|p| p.sample == pushed[0].sample));
        assert_eq!(handle.aggregator().total_bytes(), 20);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_halts_until_rotation() {
        let plane = Arc::new(Scripted::default());
        plane.script_pull(Err(SyncError::Auth { node_id: 42 }));
        let handle = scheduler(&plane).spawn();

        sleep(Duration::from_millis(10)).await;
        let status = handle.status().borrow().clone();
        assert_eq!(status.halted, Some(SyncError::Auth { node_id: 42 }));

        // No automatic retries while halted.
        sleep(Duration::from_secs(300)).await;
        assert_eq!(plane.pull_log.lock().unwrap().len(), 1);
        assert!(plane.pushed().is_empty());

        handle.rotate_credential(Credential::new("rotated"));
        sleep(Duration::from_millis(10)).await;
        let log = plane.pull_log.lock().unwrap().clone();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].credential.expose(), "rotated");
        assert!(handle.status().borrow().halted.is_none());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_remaining_traffic() {
        let plane = Arc::new(Scripted::default());
        let handle = scheduler(&plane).spawn();
        sleep(Duration::from_millis(10)).await;

        handle.aggregator().record(5, 5);
        let result = handle.shutdown().await;
        assert!(result.unwrap().is_ok());

        let pushed = plane.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].sample.total(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_nothing_to_flush() {
        let plane = Arc::new(Scripted::default());
        let handle = scheduler(&plane).spawn();
        sleep(Duration::from_millis(10)).await;
        assert!(handle.shutdown().await.is_none());
        assert!(plane.pushed().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_push_drops_sample() {
        let plane = Arc::new(Scripted::default());
        plane.script_push(Err(SyncError::MalformedPayload("bad ack".into())));

        let scheduler = scheduler(&plane);
        let agg = scheduler.aggregator();
        agg.record(3, 4);
        assert!(matches!(
            scheduler.push_once().await,
            Err(SyncError::MalformedPayload(_))
        ));
        assert!(agg.is_empty());
        assert_eq!(agg.pending_samples(), 0);
        assert_eq!(scheduler.status().borrow().push_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_sample_does_not_block_later_traffic() {
        let plane = Arc::new(Scripted::default());
        plane.script_push(Err(SyncError::SchemaViolation("window out of range".into())));
        let handle = scheduler(&plane).spawn();
        let agg = handle.aggregator();
        agg.record(1, 1);

        // Rejected at 60s and not retried.
        sleep(Duration::from_secs(90)).await;
        assert_eq!(plane.pushed().len(), 1);
        assert!(agg.is_empty());
        assert_eq!(handle.status().borrow().push_failures, 1);

        agg.record(500, 500);
        sleep(Duration::from_secs(31)).await;
        let pushed = plane.pushed();
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[1].sample.total(), 1000);
        assert!(pushed[1].sample.window_end > pushed[0].sample.window_end);
        assert_eq!(handle.status().borrow().push_failures, 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulled_push_interval_takes_effect() {
        let plane = Arc::new(Scripted::default());
        plane.script_pull(Ok(PullResponse::Unchanged { version: 0 }));
        let faster = ConfigRecord {
            pull_interval: 60,
            push_interval: 60,
            ..Default::default()
        };
        plane.script_pull(updated(1, &faster));

        let slow = ConfigRecord {
            pull_interval: 60,
            push_interval: 600,
            ..Default::default()
        };
        let handle = scheduler_with(&plane, slow).spawn();

        sleep(Duration::from_secs(59)).await;
        assert!(plane.pushed().is_empty());

        // The pull at 60s shortens the interval; 60s has already elapsed.
        sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.active_record().version, 1);
        assert_eq!(handle.aggregator().push_interval(), Duration::from_secs(60));
        assert_eq!(plane.pushed().len(), 1);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(plane.pushed().len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_requeued_and_live_traffic() {
        let plane = Arc::new(Scripted::default());
        plane.script_push(Err(SyncError::Network("connection reset".into())));
        let handle = scheduler(&plane).spawn();
        let agg = handle.aggregator();
        agg.record(3, 0);

        // Timer push at 60s fails; the retry is not due until 61s.
        sleep(Duration::from_millis(60_500)).await;
        assert_eq!(plane.pushed().len(), 1);
        assert_eq!(agg.pending_samples(), 1);

        agg.record(7, 0);
        assert!(handle.shutdown().await.unwrap().is_ok());
        assert!(agg.is_empty());

        let pushed = plane.pushed();
        assert_eq!(pushed.len(), 3);
        assert_eq!(pushed[1].sample, pushed[0].sample);
        assert_eq!(pushed[1].sample.total(), 3);
        assert_eq!(pushed[2].sample.total(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flush_stops_at_first_failure() {
        let plane = Arc::new(Scripted::default());
        let handle = scheduler(&plane).spawn();
        let agg = handle.aggregator();
        sleep(Duration::from_millis(10)).await;

        agg.requeue(agg.drain());
        agg.record(2, 2);
        plane.script_push(Err(SyncError::Network("unreachable".into())));

        assert!(handle.shutdown().await.unwrap().unwrap_err().is_retryable());
        assert_eq!(plane.pushed().len(), 1);
        assert_eq!(agg.total_bytes(), 4);
    }
}
