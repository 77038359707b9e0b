//! Config distribution and traffic commit.

use fleet_core::{
    ConfigRecord, Credential, NodeId, PullRequest, PullResponse, PushAck, SyncError,
    TrafficSample, Usage, VersionedRecord, WireCodec,
};
use ring::{hmac, rand::SystemRandom};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};
use crate::store::{InMemoryNodeStore, NodeRecord, NodeStore};

/// Serves node configs and commits traffic reports.
///
/// Reports for one node are applied one at a time; different nodes never
/// wait on each other.
pub struct DistributionService {
    store: Arc<dyn NodeStore>,
    report_locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
    // Per-process key; credentials are only ever compared as HMAC tags.
    key: hmac::Key,
}

impl DistributionService {
    /// Create a service over `store`
    pub fn new(store: Arc<dyn NodeStore>) -> Result<Self> {
        let key = hmac::Key::generate(hmac::HMAC_SHA256, &SystemRandom::new())
            .map_err(|_| ControlError::KeyGeneration)?;
        Ok(Self {
            store,
            report_locks: Mutex::new(HashMap::new()),
            key,
        })
    }

    /// Create a service over an empty [`InMemoryNodeStore`]
    pub fn in_memory() -> Result<Self> {
        Self::new(Arc::new(InMemoryNodeStore::new()))
    }

    /// The backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Resolve the record a node should run.
    ///
    /// The credential is checked before anything about the node's config is
    /// revealed. A provisioned node with nothing published is `NotFound`.
    pub async fn resolve(
        &self,
        node_id: NodeId,
        credential: &Credential,
    ) -> fleet_core::Result<VersionedRecord> {
        let node = self.authenticate(node_id, credential).await?;
        node.current().ok_or(SyncError::NotFound { node_id })
    }

    /// Answer a node's pull.
    pub async fn pull(&self, request: &PullRequest) -> fleet_core::Result<PullResponse> {
        let current = self.resolve(request.node_id, &request.credential).await?;

        if request.cached_version == current.version {
            debug!(node_id = request.node_id, version = current.version, "node is current");
            return Ok(PullResponse::Unchanged {
                version: current.version,
            });
        }

        debug!(
            node_id = request.node_id,
            cached = request.cached_version,
            version = current.version,
            "serving config"
        );
        Ok(PullResponse::Updated {
            version: current.version,
            payload: current.record.encode()?,
        })
    }

    /// Commit a traffic report.
    ///
    /// Reports are additive. A sample whose `window_end` is not newer than
    /// the last committed one is acknowledged as a duplicate and changes
    /// nothing.
    pub async fn apply_report(
        &self,
        node_id: NodeId,
        credential: &Credential,
        sample: &TrafficSample,
    ) -> fleet_core::Result<PushAck> {
        if sample.node_id != node_id {
            return Err(SyncError::SchemaViolation(format!(
                "node {node_id} reported a sample for node {}",
                sample.node_id
            )));
        }
        sample.validate()?;
        // Only authenticated nodes get an entry in the lock table.
        self.authenticate(node_id, credential).await?;

        let lock = self.report_lock(node_id);
        let _guard = lock.lock().await;
        // The credential may have been rotated while waiting for the lock.
        self.authenticate(node_id, credential).await?;

        let commit = self.store.commit_usage(node_id, sample).await?;
        if commit.duplicate {
            debug!(
                node_id,
                window_end = %sample.window_end,
                "duplicate traffic report ignored"
            );
        } else {
            info!(
                node_id,
                bytes_up = sample.bytes_up,
                bytes_down = sample.bytes_down,
                total = commit.cumulative.total(),
                "traffic committed"
            );
        }

        Ok(PushAck {
            accepted: true,
            duplicate: commit.duplicate,
            cumulative: commit.cumulative,
        })
    }

    /// Register a node with its credential
    pub async fn provision(&self, node_id: NodeId, secret: Credential) -> Result<()> {
        require_secret(&secret)?;
        self.store.insert(node_id, secret).await?;
        info!(node_id, "node provisioned");
        Ok(())
    }

    /// Issue `record` as the node's next version.
    ///
    /// The record's `NodeSecret` must be the node's current credential.
    pub async fn publish(&self, node_id: NodeId, record: ConfigRecord) -> Result<u64> {
        record.validate_active()?;
        let version = self.store.publish(node_id, Arc::new(record)).await?;
        info!(node_id, version, "config published");
        Ok(version)
    }

    /// Reissue a historical version as the node's next version.
    pub async fn rollback(&self, node_id: NodeId, version: u64) -> Result<u64> {
        let issued = self.store.rollback(node_id, version).await?;
        info!(node_id, from = version, version = issued, "config rolled back");
        Ok(issued)
    }

    /// Replace a node's credential. The old one stops working immediately.
    ///
    /// A published record is reissued carrying the new secret; its version
    /// is returned.
    pub async fn rotate_secret(&self, node_id: NodeId, secret: Credential) -> Result<Option<u64>> {
        require_secret(&secret)?;
        let version = self.store.set_secret(node_id, secret).await?;
        info!(node_id, ?version, "node credential rotated");
        Ok(version)
    }

    /// Committed usage for a node
    pub async fn usage(&self, node_id: NodeId) -> Result<Usage> {
        self.store
            .load(node_id)
            .await?
            .map(|node| node.cumulative_usage)
            .ok_or_else(|| ControlError::not_found(node_id))
    }

    async fn authenticate(
        &self,
        node_id: NodeId,
        credential: &Credential,
    ) -> fleet_core::Result<NodeRecord> {
        let node = self
            .store
            .load(node_id)
            .await?
            .ok_or(SyncError::NotFound { node_id })?;
        self.verify(node_id, &node.node_secret, credential)?;
        Ok(node)
    }

    fn verify(
        &self,
        node_id: NodeId,
        expected: &Credential,
        presented: &Credential,
    ) -> fleet_core::Result<()> {
        let tag = hmac::sign(&self.key, expected.expose().as_bytes());
        let matches =
            hmac::verify(&self.key, presented.expose().as_bytes(), tag.as_ref()).is_ok();
        if expected.is_empty() || !matches {
            warn!(node_id, "rejected node credential");
            return Err(SyncError::Auth { node_id });
        }
        Ok(())
    }

    fn report_lock(&self, node_id: NodeId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .report_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(node_id).or_default())
    }
}

fn require_secret(secret: &Credential) -> Result<()> {
    if secret.is_empty() {
        return Err(SyncError::SchemaViolation("node secret must not be empty".into()).into());
    }
    Ok(())
}
