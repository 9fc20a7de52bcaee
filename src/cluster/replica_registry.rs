//! In-process replica membership
//!
//! Keeps the active replica set in registration order and publishes a version
//! bump on every change so routers can prune state for departed replicas.

use super::{ReplicaId, ReplicaInfo, ReplicaMembership};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Registry of active replicas
pub struct ReplicaRegistry {
    /// Active replicas in registration order
    replicas: RwLock<Vec<ReplicaInfo>>,
    /// Membership version, bumped on every change
    version: watch::Sender<u64>,
}

impl ReplicaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            replicas: RwLock::new(Vec::new()),
            version,
        }
    }

    /// Register a new replica or replace an existing one in place
    pub fn register_replica(&self, replica: ReplicaInfo) {
        {
            let mut replicas = self.replicas.write();
            info!(
                "Registering replica {} (node={:?}, az={:?})",
                replica.id, replica.node_id, replica.availability_zone
            );
            match replicas.iter_mut().find(|r| r.id == replica.id) {
                Some(existing) => *existing = replica,
                None => replicas.push(replica),
            }
        }
        self.bump();
    }

    /// Remove a replica from the active set
    pub fn remove_replica(&self, replica_id: &ReplicaId) -> bool {
        let removed = {
            let mut replicas = self.replicas.write();
            let before = replicas.len();
            replicas.retain(|r| &r.id != replica_id);
            replicas.len() != before
        };

        if removed {
            info!("Removed replica {} from registry", replica_id);
            self.bump();
        } else {
            debug!("Remove requested for unknown replica {}", replica_id);
        }
        removed
    }

    /// Replace the set of multiplexed models loaded on a replica
    pub fn update_multiplexed_models(
        &self,
        replica_id: &ReplicaId,
        models: BTreeSet<String>,
    ) -> bool {
        let updated = {
            let mut replicas = self.replicas.write();
            match replicas.iter_mut().find(|r| &r.id == replica_id) {
                Some(replica) => {
                    debug!("Updating models for replica {}: {:?}", replica_id, models);
                    replica.multiplexed_model_ids = models;
                    true
                }
                None => false,
            }
        };

        if updated {
            self.bump();
        } else {
            warn!("Model update for unknown replica: {}", replica_id);
        }
        updated
    }

    /// Get replica by ID
    pub fn get_replica(&self, replica_id: &ReplicaId) -> Option<ReplicaInfo> {
        self.replicas
            .read()
            .iter()
            .find(|r| &r.id == replica_id)
            .cloned()
    }

    /// Number of active replicas
    pub fn len(&self) -> usize {
        self.replicas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.read().is_empty()
    }

    /// Get registry statistics
    pub fn get_stats(&self) -> RegistryStats {
        let replicas = self.replicas.read();

        let nodes: BTreeSet<&str> = replicas.iter().filter_map(|r| r.node_id.as_deref()).collect();
        let zones: BTreeSet<&str> = replicas
            .iter()
            .filter_map(|r| r.availability_zone.as_deref())
            .collect();
        let models: BTreeSet<&str> = replicas
            .iter()
            .flat_map(|r| r.multiplexed_model_ids.iter().map(String::as_str))
            .collect();

        RegistryStats {
            active_replicas: replicas.len(),
            nodes: nodes.len(),
            availability_zones: zones.len(),
            multiplexed_models: models.len(),
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl Default for ReplicaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaMembership for ReplicaRegistry {
    fn list_active_replicas(&self) -> Vec<ReplicaInfo> {
        self.replicas.read().clone()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

/// Registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub active_replicas: usize,
    pub nodes: usize,
    pub availability_zones: usize,
    pub multiplexed_models: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_registration() {
        let registry = ReplicaRegistry::new();

        registry.register_replica(ReplicaInfo::new("r1").with_node("node-a"));
        registry.register_replica(ReplicaInfo::new("r2").with_node("node-b"));

        let retrieved = registry.get_replica(&ReplicaId::new("r1"));
        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().node_id.as_deref(), Some("node-a"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registration_order_is_stable() {
        let registry = ReplicaRegistry::new();
        for id in ["c", "a", "b"] {
            registry.register_replica(ReplicaInfo::new(id));
        }

        // Re-registering keeps the original slot
        registry.register_replica(ReplicaInfo::new("a").with_node("node-z"));

        let ids: Vec<String> = registry
            .list_active_replicas()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(
            registry.get_replica(&ReplicaId::new("a")).unwrap().node_id.as_deref(),
            Some("node-z")
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ReplicaRegistry::new();
        registry.register_replica(ReplicaInfo::new("r1"));

        assert!(registry.remove_replica(&ReplicaId::new("r1")));
        assert!(!registry.remove_replica(&ReplicaId::new("r1")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let registry = ReplicaRegistry::new();
        let mut changes = registry.subscribe();
        let start = *changes.borrow_and_update();

        registry.register_replica(ReplicaInfo::new("r1"));
        changes.changed().await.unwrap();
        assert!(*changes.borrow_and_update() > start);

        // Unknown removal does not publish
        registry.remove_replica(&ReplicaId::new("missing"));
        assert!(!changes.has_changed().unwrap());
    }

    #[test]
    fn test_model_updates_and_stats() {
        let registry = ReplicaRegistry::new();
        registry.register_replica(
            ReplicaInfo::new("r1")
                .with_node("node-a")
                .with_availability_zone("az-1"),
        );
        registry.register_replica(
            ReplicaInfo::new("r2")
                .with_node("node-a")
                .with_availability_zone("az-2"),
        );

        let models: BTreeSet<String> = ["m1".to_string(), "m2".to_string()].into();
        assert!(registry.update_multiplexed_models(&ReplicaId::new("r2"), models));
        assert!(!registry.update_multiplexed_models(&ReplicaId::new("r9"), BTreeSet::new()));

        let stats = registry.get_stats();
        assert_eq!(stats.active_replicas, 2);
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.availability_zones, 2);
        assert_eq!(stats.multiplexed_models, 2);
    }
}
