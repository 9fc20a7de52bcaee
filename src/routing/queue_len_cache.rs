//! Time-bounded cache of replica queue lengths
//!
//! Each entry is a single point-in-time observation and is replaced
//! wholesale on update. Reads past the staleness window report "unknown"
//! instead of a number. The map is sharded, so updates for different
//! replicas never contend on the same lock.

use crate::clock::{Clock, MonotonicClock};
use crate::cluster::ReplicaId;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// One queue-length observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLenEntry {
    pub queue_len: u32,
    /// Clock reading when the observation was recorded
    pub timestamp: Duration,
}

/// Replica queue-length cache with a staleness window
pub struct QueueLenCache {
    entries: DashMap<ReplicaId, QueueLenEntry>,
    staleness: Duration,
    clock: Arc<dyn Clock>,
}

impl QueueLenCache {
    /// Create a cache driven by the monotonic clock
    pub fn new(staleness: Duration) -> Self {
        Self::with_clock(staleness, Arc::new(MonotonicClock::new()))
    }

    /// Create a cache with an explicit time source
    pub fn with_clock(staleness: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            staleness,
            clock,
        }
    }

    /// Last observed queue length, or `None` when absent or stale.
    ///
    /// An entry exactly `staleness` old is still fresh.
    pub fn get(&self, replica: &ReplicaId) -> Option<u32> {
        let entry = *self.entries.get(replica)?;
        let age = self.clock.now().saturating_sub(entry.timestamp);
        if age > self.staleness {
            return None;
        }
        Some(entry.queue_len)
    }

    /// Record a fresh observation, replacing any previous one
    pub fn update(&self, replica: &ReplicaId, queue_len: u32) {
        self.entries.insert(
            replica.clone(),
            QueueLenEntry {
                queue_len,
                timestamp: self.clock.now(),
            },
        );
    }

    /// Drop the observation for a replica. Returns whether one existed.
    pub fn invalidate(&self, replica: &ReplicaId) -> bool {
        self.entries.remove(replica).is_some()
    }

    /// Remove entries for every replica outside `active`. Returns the number
    /// of entries removed.
    ///
    /// Shards are locked one at a time, so concurrent `get`/`update` calls on
    /// other shards proceed during the sweep.
    pub fn prune(&self, active: &HashSet<ReplicaId>) -> usize {
        let mut removed = 0;
        self.entries.retain(|replica, _| {
            let keep = active.contains(replica);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Raw entry regardless of staleness
    pub fn entry(&self, replica: &ReplicaId) -> Option<QueueLenEntry> {
        self.entries.get(replica).map(|e| *e)
    }

    /// Number of stored entries, stale ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }
}
