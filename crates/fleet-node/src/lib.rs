//! Node side of the fleet sync protocol.
//!
//! A node runs a [`SyncScheduler`] that pulls its versioned configuration and
//! pushes traffic usage back to the control plane:
//!
//! - [`TrafficAggregator`] counts bytes from the data plane
//! - [`RecordSlot`] holds the active [`VersionedRecord`](fleet_core::VersionedRecord)
//! - [`HttpControlPlane`] talks to the control plane over HTTP
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleet_core::{ConfigRecord, Credential};
//! use fleet_node::{HttpControlPlane, SchedulerConfig, SyncScheduler};
//!
//! # async fn example() -> fleet_core::Result<()> {
//! let plane = Arc::new(HttpControlPlane::new("https://panel.example.com")?);
//! let config = SchedulerConfig::new(7, Credential::new("node-secret"));
//! let handle = SyncScheduler::new(config, plane, ConfigRecord::default()).spawn();
//!
//! handle.aggregator().record(1_024, 4_096);
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod aggregator;
mod config;
mod http;
mod scheduler;
mod slot;

pub use aggregator::TrafficAggregator;
pub use config::*;
pub use http::{HttpControlPlane, HttpControlPlaneBuilder, PULL_PATH, PUSH_PATH};
pub use scheduler::{PullOutcome, PullState, PushState, SyncHandle, SyncScheduler, SyncStatus};
pub use slot::{RecordApplier, RecordSlot, RuleSetApplier};

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_control::{DistributionService, LocalControlPlane};
    use fleet_core::{ConfigRecord, ControlPlane, Credential, SyncError};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn published() -> ConfigRecord {
        ConfigRecord {
            node_secret: "edge-secret".into(),
            pull_interval: 60,
            push_interval: 60,
            traffic_report_threshold: 1_000_000,
            ..Default::default()
        }
    }

    async fn control_plane() -> Arc<DistributionService> {
        let service = Arc::new(DistributionService::in_memory().unwrap());
        service
            .provision(3, Credential::new("edge-secret"))
            .await
            .unwrap();
        service.publish(3, published()).await.unwrap();
        service
    }

    fn spawn(service: &Arc<DistributionService>) -> SyncHandle {
        let plane: Arc<dyn ControlPlane> = Arc::new(LocalControlPlane::new(Arc::clone(service)));
        let config = SchedulerConfig::new(3, Credential::new("edge-secret"));
        SyncScheduler::new(config, plane, ConfigRecord::default()).spawn()
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_report_end_to_end() {
        let service = control_plane().await;
        let handle = spawn(&service);

        sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.active_record().version, 1);
        assert_eq!(handle.aggregator().threshold(), 1_000_000);

        // 1.2 MB at t=30s crosses the threshold well before the 60s timer.
        sleep(Duration::from_secs(30)).await;
        handle.aggregator().record(200_000, 1_000_000);
        sleep(Duration::from_millis(10)).await;

        let usage = service.usage(3).await.unwrap();
        assert_eq!(usage.reports, 1);
        assert_eq!(usage.bytes_up, 200_000);
        assert_eq!(usage.bytes_down, 1_000_000);
        assert!(handle.aggregator().is_empty());

        handle.aggregator().record(10, 10);
        handle.shutdown().await.unwrap().unwrap();
        assert_eq!(service.usage(3).await.unwrap().total(), 1_200_020);
    }

    #[tokio::test(start_paused = true)]
    async fn test_published_update_reaches_node() {
        let service = control_plane().await;
        let handle = spawn(&service);
        sleep(Duration::from_millis(10)).await;

        let mut next = published();
        next.block = vec!["*.tracker.example".into()];
        next.traffic_report_threshold = 0;
        assert_eq!(service.publish(3, next).await.unwrap(), 2);

        sleep(Duration::from_secs(61)).await;
        let active = handle.active_record();
        assert_eq!(active.version, 2);
        assert_eq!(active.record.block, vec!["*.tracker.example"]);
        assert_eq!(handle.aggregator().threshold(), 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotated_secret_halts_until_node_rotates() {
        let service = control_plane().await;
        let handle = spawn(&service);
        sleep(Duration::from_millis(10)).await;

        service
            .rotate_secret(3, Credential::new("rotated-secret"))
            .await
            .unwrap();
        sleep(Duration::from_secs(61)).await;
        assert_eq!(
            handle.status().borrow().halted,
            Some(SyncError::Auth { node_id: 3 })
        );

        handle.aggregator().record(1, 1);
        handle.rotate_credential(Credential::new("rotated-secret"));
        sleep(Duration::from_secs(61)).await;
        assert!(handle.status().borrow().halted.is_none());
        assert_eq!(service.usage(3).await.unwrap().total(), 2);

        handle.shutdown().await;
    }
}
