use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::runner::RunState;
use crate::stats::{EndpointKey, EndpointStats};

/// Errors surfaced by the node registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Stats were reported for a node that was never registered or has been
    /// evicted. Never silently dropped; the caller decides how to react.
    #[error("unknown node: {0}")]
    UnknownNode(String),
}

/// The latest per-endpoint statistics reported by one worker node.
///
/// Replaced wholesale on every report; cross-node merging happens at
/// aggregation time, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub stats: BTreeMap<EndpointKey, EndpointStats>,
    pub reported_at: DateTime<Utc>,
}

impl NodeSnapshot {
    pub fn new(node_id: impl Into<String>, stats: BTreeMap<EndpointKey, EndpointStats>) -> Self {
        Self {
            node_id: node_id.into(),
            stats,
            reported_at: Utc::now(),
        }
    }

    fn empty(node_id: &str) -> Self {
        Self::new(node_id, BTreeMap::new())
    }
}

/// Liveness information for one node, refreshed on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub last_seen: DateTime<Utc>,
    /// Run state the node last announced.
    pub state: RunState,
    /// Users the node was simulating at that point.
    pub user_count: u64,
}

impl NodeHealth {
    fn initial() -> Self {
        Self {
            last_seen: Utc::now(),
            state: RunState::Ready,
            user_count: 0,
        }
    }
}

/// Per-node slot: the snapshot swap is guarded independently of the outer
/// map, so reports for different nodes never contend with each other.
struct NodeSlot {
    snapshot: RwLock<Arc<NodeSnapshot>>,
    health: RwLock<NodeHealth>,
}

impl NodeSlot {
    fn new(node_id: &str) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(NodeSnapshot::empty(node_id))),
            health: RwLock::new(NodeHealth::initial()),
        }
    }
}

/// Authoritative record of connected worker nodes and their latest snapshots.
///
/// The outer lock is held only for membership changes and brief lookups; each
/// snapshot replace is an `Arc` swap, so readers either see the previous or
/// the new snapshot for a node, never a torn one.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeSlot>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Add a node if absent. Idempotent: re-registering an existing node
    /// keeps its current snapshot.
    pub fn register(&self, node_id: &str) {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(node_id) {
            info!("Node {} registered", node_id);
            nodes.insert(node_id.to_string(), NodeSlot::new(node_id));
        }
    }

    /// Atomically replace the stored snapshot for a registered node.
    pub fn report(&self, node_id: &str, snapshot: NodeSnapshot) -> Result<(), RegistryError> {
        let nodes = self.nodes.read();
        let slot = nodes
            .get(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        debug!(
            "Node {} reported {} endpoint entries",
            node_id,
            snapshot.stats.len()
        );
        *slot.snapshot.write() = Arc::new(snapshot);
        Ok(())
    }

    /// Refresh a node's liveness record with what it just announced.
    pub fn heartbeat(
        &self,
        node_id: &str,
        state: RunState,
        user_count: u64,
    ) -> Result<(), RegistryError> {
        let nodes = self.nodes.read();
        let slot = nodes
            .get(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        *slot.health.write() = NodeHealth {
            last_seen: Utc::now(),
            state,
            user_count,
        };
        Ok(())
    }

    /// Drop a node and its last snapshot. Subsequent aggregation passes
    /// exclude it immediately; removing an unknown node is a no-op.
    pub fn remove(&self, node_id: &str) {
        if self.nodes.write().remove(node_id).is_some() {
            info!("Node {} removed", node_id);
        }
    }

    /// Point-in-time view of every node's latest snapshot, in no particular
    /// order. Each element is atomic per node; slight temporal skew across
    /// nodes is expected in a polling system.
    pub fn snapshots(&self) -> Vec<Arc<NodeSnapshot>> {
        self.nodes
            .read()
            .values()
            .map(|slot| Arc::clone(&slot.snapshot.read()))
            .collect()
    }

    /// Latest liveness record per node.
    pub fn heartbeats(&self) -> Vec<(String, NodeHealth)> {
        self.nodes
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.health.read().clone()))
            .collect()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Replace every node's snapshot with an empty one. Holding the outer
    /// write lock for the duration means a concurrent `snapshots()` call sees
    /// either the state before the reset or the fully cleared state.
    pub fn reset(&self) {
        let nodes = self.nodes.write();
        for (node_id, slot) in nodes.iter() {
            *slot.snapshot.write() = Arc::new(NodeSnapshot::empty(node_id));
        }
        info!("Registry snapshots reset for {} nodes", nodes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::EndpointKey;

    fn snapshot_with_requests(node_id: &str, requests: u64) -> NodeSnapshot {
        let mut stats = BTreeMap::new();
        let mut entry = EndpointStats::new();
        for _ in 0..requests {
            entry.log_at(1000, 10, 0);
        }
        stats.insert(EndpointKey::new("GET", "/x"), entry);
        NodeSnapshot::new(node_id, stats)
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = NodeRegistry::new();
        registry.register("worker-1");
        registry
            .report("worker-1", snapshot_with_requests("worker-1", 5))
            .unwrap();
        registry.register("worker-1");

        assert_eq!(registry.len(), 1);
        // Re-registration must not clobber the reported snapshot.
        let snapshots = registry.snapshots();
        assert_eq!(snapshots[0].stats.len(), 1);
    }

    #[test]
    fn test_report_unknown_node_fails() {
        let registry = NodeRegistry::new();
        let err = registry
            .report("ghost", snapshot_with_requests("ghost", 1))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownNode(ref id) if id == "ghost"));
    }

    #[test]
    fn test_remove_excludes_node() {
        let registry = NodeRegistry::new();
        registry.register("worker-1");
        registry.register("worker-2");
        registry
            .report("worker-1", snapshot_with_requests("worker-1", 5))
            .unwrap();
        registry
            .report("worker-2", snapshot_with_requests("worker-2", 7))
            .unwrap();

        registry.remove("worker-1");
        let total: u64 = registry
            .snapshots()
            .iter()
            .flat_map(|s| s.stats.values())
            .map(|e| e.num_requests)
            .sum();
        assert_eq!(total, 7);

        // Re-adding and re-reporting restores the contribution.
        registry.register("worker-1");
        registry
            .report("worker-1", snapshot_with_requests("worker-1", 5))
            .unwrap();
        let total: u64 = registry
            .snapshots()
            .iter()
            .flat_map(|s| s.stats.values())
            .map(|e| e.num_requests)
            .sum();
        assert_eq!(total, 12);
    }

    #[test]
    fn test_heartbeat_updates_health_record() {
        let registry = NodeRegistry::new();
        registry.register("worker-1");

        let (_, before) = registry.heartbeats().pop().unwrap();
        assert_eq!(before.state, RunState::Ready);
        assert_eq!(before.user_count, 0);

        registry
            .heartbeat("worker-1", RunState::Running, 25)
            .unwrap();
        let (id, after) = registry.heartbeats().pop().unwrap();
        assert_eq!(id, "worker-1");
        assert_eq!(after.state, RunState::Running);
        assert_eq!(after.user_count, 25);
        assert!(after.last_seen >= before.last_seen);
    }

    #[test]
    fn test_heartbeat_unknown_node_fails() {
        let registry = NodeRegistry::new();
        let err = registry
            .heartbeat("ghost", RunState::Running, 1)
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownNode(ref id) if id == "ghost"));
    }

    #[test]
    fn test_reset_clears_all_snapshots() {
        let registry = NodeRegistry::new();
        registry.register("worker-1");
        registry
            .report("worker-1", snapshot_with_requests("worker-1", 5))
            .unwrap();

        registry.reset();
        assert_eq!(registry.len(), 1);
        assert!(registry.snapshots().iter().all(|s| s.stats.is_empty()));
    }
}
