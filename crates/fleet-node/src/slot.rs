//! The node's active configuration and the hook that applies it.

use fleet_core::{ConfigRecord, RuleSet, SyncError, VersionedRecord};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Holder of the record a node currently runs.
///
/// The slot is swapped whole; readers get either the old record or the new
/// one, never a mix. Version 0 holds the bootstrap record used until the
/// first successful pull.
#[derive(Debug)]
pub struct RecordSlot {
    tx: watch::Sender<VersionedRecord>,
}

impl RecordSlot {
    /// Create a slot holding the bootstrap record at version 0.
    #[must_use]
    pub fn new(bootstrap: ConfigRecord) -> Self {
        let (tx, _rx) = watch::channel(VersionedRecord::new(0, bootstrap));
        Self { tx }
    }

    /// Snapshot of the active record
    #[must_use]
    pub fn current(&self) -> VersionedRecord {
        self.tx.borrow().clone()
    }

    /// Version of the active record
    #[must_use]
    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    /// Subscribe to record changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<VersionedRecord> {
        self.tx.subscribe()
    }

    /// Install a new record, returning the one it replaced.
    pub fn swap(&self, next: VersionedRecord) -> VersionedRecord {
        self.tx.send_replace(next)
    }
}

/// Pushes a freshly pulled record into the node runtime.
///
/// Called before the record becomes active. Returning an error keeps the
/// previous record in force.
pub trait RecordApplier: Send + Sync {
    /// Apply a record to the runtime
    fn apply(&self, record: &VersionedRecord) -> Result<(), SyncError>;
}

/// Applier that compiles records into a [`RuleSet`] for the data plane.
#[derive(Debug)]
pub struct RuleSetApplier {
    tx: watch::Sender<Arc<RuleSet>>,
}

impl Default for RuleSetApplier {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleSetApplier {
    /// Start with an empty rule set
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(RuleSet::default()));
        Self { tx }
    }

    /// Current rule set
    #[must_use]
    pub fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.tx.borrow())
    }

    /// Subscribe to rule set changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<RuleSet>> {
        self.tx.subscribe()
    }
}

impl RecordApplier for RuleSetApplier {
    fn apply(&self, record: &VersionedRecord) -> Result<(), SyncError> {
        let rules = RuleSet::compile(&record.record)?;
        debug!(
            version = record.version,
            dns = record.record.dns.len(),
            block = record.record.block.len(),
            outbound = record.record.outbound.len(),
            "compiled rule set"
        );
        self.tx.send_replace(Arc::new(rules));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Route;

    #[test]
    fn test_slot_swap() {
        let slot = RecordSlot::new(ConfigRecord::default());
        assert_eq!(slot.version(), 0);

        let rx = slot.subscribe();
        let next = VersionedRecord::new(
            3,
            ConfigRecord {
                pull_interval: 30,
                ..Default::default()
            },
        );
        let previous = slot.swap(next.clone());

        assert_eq!(previous.version, 0);
        assert_eq!(slot.current(), next);
        assert_eq!(rx.borrow().version, 3);
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let slot = RecordSlot::new(ConfigRecord::default());
        let held = slot.current();
        slot.swap(VersionedRecord::new(1, ConfigRecord::default()));
        assert_eq!(held.version, 0);
        assert_eq!(slot.version(), 1);
    }

    #[test]
    fn test_rule_set_applier() {
        let applier = RuleSetApplier::new();
        let record = VersionedRecord::new(
            1,
            ConfigRecord {
                block: vec!["ads.example.com".into()],
                ..Default::default()
            },
        );
        applier.apply(&record).unwrap();
        assert_eq!(applier.rules().route("ads.example.com"), Route::Blocked);

        // A broken record is refused and the previous rules stay in place.
        let broken = VersionedRecord::new(
            2,
            ConfigRecord {
                block: vec!["bad pattern".into()],
                ..Default::default()
            },
        );
        assert!(matches!(
            applier.apply(&broken),
            Err(SyncError::SchemaViolation(_))
        ));
        assert_eq!(applier.rules().route("ads.example.com"), Route::Blocked);
    }
}
