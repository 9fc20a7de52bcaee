//! Cluster collaborators at the router's boundary
//!
//! The router never owns replica lifecycle. It reads the active set through
//! [`ReplicaMembership`] and invokes replicas through [`ReplicaTransport`].
//! [`ReplicaRegistry`] is an in-process membership implementation for hosts
//! that track replicas themselves, and for tests.

pub mod replica_registry;
pub mod transport;

pub use replica_registry::{RegistryStats, ReplicaRegistry};
pub use transport::{DispatchError, DispatchRequest, ReplicaReply, ReplicaTransport, ReplyBody};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::watch;

/// Opaque identity of one running replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Placement-relevant facts about a replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Replica identity
    pub id: ReplicaId,
    /// Physical node hosting the replica
    pub node_id: Option<String>,
    /// Availability zone of the hosting node
    pub availability_zone: Option<String>,
    /// Multiplexed model ids currently loaded on the replica
    pub multiplexed_model_ids: BTreeSet<String>,
    /// Queue length at which the replica is considered full
    pub max_ongoing_requests: u32,
}

impl ReplicaInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ReplicaId::new(id),
            node_id: None,
            availability_zone: None,
            multiplexed_model_ids: BTreeSet::new(),
            max_ongoing_requests: 5,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_availability_zone(mut self, zone: impl Into<String>) -> Self {
        self.availability_zone = Some(zone.into());
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.multiplexed_model_ids = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_ongoing_requests(mut self, max: u32) -> Self {
        self.max_ongoing_requests = max;
        self
    }

    /// Whether a queue length means this replica cannot take more work.
    pub fn is_full(&self, queue_len: u32) -> bool {
        queue_len >= self.max_ongoing_requests
    }
}

/// Source of the active replica set.
///
/// Implementations must answer from resident state: the router calls
/// `list_active_replicas` while selecting and must not block on I/O there.
pub trait ReplicaMembership: Send + Sync {
    /// Active replicas in a stable order. The order is the tie-breaker for
    /// otherwise equal candidates.
    fn list_active_replicas(&self) -> Vec<ReplicaInfo>;

    /// Change notifications. The value is a version that bumps on every
    /// membership change.
    fn subscribe(&self) -> watch::Receiver<u64>;
}
