//! Node persistence.
//!
//! The service only reaches persistence through [`NodeStore`]. The bundled
//! [`InMemoryNodeStore`] keeps everything in memory and can snapshot itself
//! to a JSON file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{ConfigRecord, Credential, NodeId, TrafficSample, Usage, VersionedRecord, WireCodec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;

use crate::error::{ControlError, Result};

/// Everything the control plane keeps for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node ID
    pub node_id: NodeId,

    /// Credential the node must present
    pub node_secret: Credential,

    /// Version currently distributed (0 = nothing published yet)
    #[serde(default)]
    pub current_version: u64,

    /// Every issued version
    #[serde(default)]
    pub history: BTreeMap<u64, Arc<ConfigRecord>>,

    /// End of the newest committed traffic window
    #[serde(default)]
    pub last_committed_window_end: Option<DateTime<Utc>>,

    /// Committed usage totals
    #[serde(default)]
    pub cumulative_usage: Usage,
}

impl NodeRecord {
    /// A freshly provisioned node with no published config
    #[must_use]
    pub fn new(node_id: NodeId, node_secret: Credential) -> Self {
        Self {
            node_id,
            node_secret,
            current_version: 0,
            history: BTreeMap::new(),
            last_committed_window_end: None,
            cumulative_usage: Usage::default(),
        }
    }

    /// The record currently distributed, if any
    #[must_use]
    pub fn current(&self) -> Option<VersionedRecord> {
        self.history
            .get(&self.current_version)
            .map(|record| VersionedRecord {
                version: self.current_version,
                record: Arc::clone(record),
            })
    }

    /// `record` with its secret replaced by the node credential
    fn with_node_secret(&self, record: Arc<ConfigRecord>) -> Arc<ConfigRecord> {
        if record.node_secret == self.node_secret.expose() {
            return record;
        }
        Arc::new(ConfigRecord {
            node_secret: self.node_secret.expose().to_owned(),
            ..(*record).clone()
        })
    }

    fn issue(&mut self, record: Arc<ConfigRecord>) -> Result<u64> {
        // A distributed secret must authenticate the node that receives it.
        if record.node_secret != self.node_secret.expose() {
            return Err(ControlError::SecretMismatch(self.node_id));
        }
        let version = self.current_version.checked_add(1).ok_or_else(|| {
            ControlError::State(format!("version overflow for node {}", self.node_id))
        })?;
        self.history.insert(version, record);
        self.current_version = version;
        Ok(version)
    }
}

/// Outcome of committing one traffic sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCommit {
    /// The window was already committed; totals are unchanged
    pub duplicate: bool,
    /// Totals after the commit
    pub cumulative: Usage,
}

/// Persistence boundary for node records.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch a node record
    async fn load(&self, node_id: NodeId) -> Result<Option<NodeRecord>>;

    /// Add a new node
    async fn insert(&self, node_id: NodeId, secret: Credential) -> Result<()>;

    /// Issue `record` as the node's next version.
    ///
    /// The record's secret must equal the node credential.
    async fn publish(&self, node_id: NodeId, record: Arc<ConfigRecord>) -> Result<u64>;

    /// Reissue a historical version, carrying the current credential, as the
    /// node's next version
    async fn rollback(&self, node_id: NodeId, version: u64) -> Result<u64>;

    /// Replace the node credential.
    ///
    /// When a record is published, it is reissued with the new secret and
    /// that version is returned.
    async fn set_secret(&self, node_id: NodeId, secret: Credential) -> Result<Option<u64>>;

    /// Add a sample to the node's usage unless its window was already committed
    async fn commit_usage(&self, node_id: NodeId, sample: &TrafficSample) -> Result<UsageCommit>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    nodes: Vec<NodeRecord>,
}

/// In-memory [`NodeStore`] with JSON snapshots.
#[derive(Debug, Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<HashMap<NodeId, Arc<Mutex<NodeRecord>>>>,
}

impl InMemoryNodeStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no nodes are stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a store from a snapshot file.
    ///
    /// A missing file yields an empty store. Every stored record is
    /// validated; a snapshot pointing at a version it does not hold is
    /// rejected.
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ControlError::State(format!("failed to read {}: {e}", path.display())))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| ControlError::State(format!("failed to parse snapshot: {e}")))?;

        let mut nodes = HashMap::with_capacity(snapshot.nodes.len());
        for node in snapshot.nodes {
            for record in node.history.values() {
                record.validate()?;
            }
            if node.current_version != 0 && !node.history.contains_key(&node.current_version) {
                return Err(ControlError::State(format!(
                    "node {} points at missing version {}",
                    node.node_id, node.current_version
                )));
            }
            let node_id = node.node_id;
            if nodes.insert(node_id, Arc::new(Mutex::new(node))).is_some() {
                return Err(ControlError::State(format!(
                    "node {node_id} appears twice in snapshot"
                )));
            }
        }

        debug!(path = %path.display(), nodes = nodes.len(), "loaded node snapshot");
        Ok(Self {
            nodes: RwLock::new(nodes),
        })
    }

    /// Write all node records to `path`.
    ///
    /// The snapshot is written next to the target and renamed into place.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let entries: Vec<_> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut nodes: Vec<NodeRecord> = entries.iter().map(|e| lock(e).clone()).collect();
        nodes.sort_by_key(|n| n.node_id);

        let json = serde_json::to_vec_pretty(&Snapshot { nodes })?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;

        debug!(path = %path.display(), nodes = entries.len(), "saved node snapshot");
        Ok(())
    }

    fn entry(&self, node_id: NodeId) -> Result<Arc<Mutex<NodeRecord>>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node_id)
            .cloned()
            .ok_or_else(|| ControlError::not_found(node_id))
    }
}

fn lock(entry: &Mutex<NodeRecord>) -> MutexGuard<'_, NodeRecord> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn load(&self, node_id: NodeId) -> Result<Option<NodeRecord>> {
        let entry = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node_id)
            .cloned();
        Ok(entry.map(|entry| lock(&entry).clone()))
    }

    async fn insert(&self, node_id: NodeId, secret: Credential) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if nodes.contains_key(&node_id) {
            return Err(ControlError::AlreadyProvisioned(node_id));
        }
        nodes.insert(node_id, Arc::new(Mutex::new(NodeRecord::new(node_id, secret))));
        Ok(())
    }

    async fn publish(&self, node_id: NodeId, record: Arc<ConfigRecord>) -> Result<u64> {
        let entry = self.entry(node_id)?;
        let mut node = lock(&entry);
        node.issue(record)
    }

    async fn rollback(&self, node_id: NodeId, version: u64) -> Result<u64> {
        let entry = self.entry(node_id)?;
        let mut node = lock(&entry);
        let record = node
            .history
            .get(&version)
            .cloned()
            .ok_or(ControlError::UnknownVersion { node_id, version })?;
        let record = node.with_node_secret(record);
        node.issue(record)
    }

    async fn set_secret(&self, node_id: NodeId, secret: Credential) -> Result<Option<u64>> {
        let entry = self.entry(node_id)?;
        let mut node = lock(&entry);
        node.node_secret = secret;
        match node.current() {
            Some(current) => {
                let record = node.with_node_secret(current.record);
                node.issue(record).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn commit_usage(&self, node_id: NodeId, sample: &TrafficSample) -> Result<UsageCommit> {
        let entry = self.entry(node_id)?;
        let mut node = lock(&entry);

        if node
            .last_committed_window_end
            .is_some_and(|last| sample.window_end <= last)
        {
            return Ok(UsageCommit {
                duplicate: true,
                cumulative: node.cumulative_usage,
            });
        }

        node.cumulative_usage.add(sample);
        node.last_committed_window_end = Some(sample.window_end);
        Ok(UsageCommit {
            duplicate: false,
            cumulative: node.cumulative_usage,
        })
    }
}
