use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use strato_core::payloads::{InstanceStat, NodeRole, StatsPayload, TraceFrame};

/// Registry entry for one connected node, fed by NodeConnected events and
/// stats heartbeats.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: String,
    pub role: NodeRole,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub load: i64,
    pub mem_total_mb: i64,
    pub mem_available_mb: i64,
    pub disk_total_mb: i64,
    pub disk_available_mb: i64,
    pub instance_count: usize,
}

/// The non-durable partition: node registry, last-known per-instance
/// stats, trace frames. Everything here is rebuilt from the fleet after
/// a restart.
#[derive(Default)]
pub struct TransientStore {
    nodes: Mutex<HashMap<String, NodeInfo>>,
    instance_stats: Mutex<HashMap<Uuid, InstanceStat>>,
    traces: Mutex<Vec<TraceFrame>>,
}

impl TransientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_connected(&self, node_id: &str, role: NodeRole) {
        let now = Utc::now();
        let mut nodes = self.nodes.lock().unwrap();
        nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeInfo {
                node_id: node_id.to_string(),
                role,
                connected_at: now,
                last_heartbeat: now,
                load: 0,
                mem_total_mb: 0,
                mem_available_mb: 0,
                disk_total_mb: 0,
                disk_available_mb: 0,
                instance_count: 0,
            });
    }

    /// Remove a node from placement. In-flight commands for it surface as
    /// failures on the next stats cycle.
    pub fn node_disconnected(&self, node_id: &str) {
        self.nodes.lock().unwrap().remove(node_id);
    }

    /// Apply the node-health half of a stats frame. A stats frame from a
    /// node we never saw connect re-registers it (compute by default).
    pub fn heartbeat(&self, stats: &StatsPayload) {
        let now = Utc::now();
        let mut nodes = self.nodes.lock().unwrap();
        let entry = nodes
            .entry(stats.node_id.clone())
            .or_insert_with(|| NodeInfo {
                node_id: stats.node_id.clone(),
                role: NodeRole::Compute,
                connected_at: now,
                last_heartbeat: now,
                load: 0,
                mem_total_mb: 0,
                mem_available_mb: 0,
                disk_total_mb: 0,
                disk_available_mb: 0,
                instance_count: 0,
            });
        entry.last_heartbeat = now;
        entry.load = stats.load;
        entry.mem_total_mb = stats.mem_total_mb;
        entry.mem_available_mb = stats.mem_available_mb;
        entry.disk_total_mb = stats.disk_total_mb;
        entry.disk_available_mb = stats.disk_available_mb;
        entry.instance_count = stats.instances.len();

        let mut per_instance = self.instance_stats.lock().unwrap();
        for stat in &stats.instances {
            per_instance.insert(stat.instance_id, stat.clone());
        }
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<_> = self.nodes.lock().unwrap().values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn node(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.lock().unwrap().get(node_id).cloned()
    }

    pub fn instance_stat(&self, id: Uuid) -> Option<InstanceStat> {
        self.instance_stats.lock().unwrap().get(&id).cloned()
    }

    pub fn record_traces(&self, frames: &[TraceFrame]) {
        self.traces.lock().unwrap().extend_from_slice(frames);
    }

    pub fn traces(&self, label: Option<&str>) -> Vec<TraceFrame> {
        let traces = self.traces.lock().unwrap();
        match label {
            None => traces.clone(),
            Some(l) => traces.iter().filter(|t| t.label == l).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_core::instance::InstanceState;

    #[test]
    fn test_node_registry_lifecycle() {
        let store = TransientStore::new();
        store.node_connected("node-1", NodeRole::Compute);
        store.node_connected("node-2", NodeRole::Network);
        assert_eq!(store.nodes().len(), 2);

        store.node_disconnected("node-1");
        assert_eq!(store.nodes().len(), 1);
        assert!(store.node("node-1").is_none());
    }

    #[test]
    fn test_heartbeat_updates_node_and_instances() {
        let store = TransientStore::new();
        let iid = Uuid::new_v4();
        let stats = StatsPayload {
            node_id: "node-1".into(),
            load: 12,
            mem_total_mb: 8192,
            mem_available_mb: 4096,
            disk_total_mb: 100_000,
            disk_available_mb: 60_000,
            instances: vec![InstanceStat {
                instance_id: iid,
                state: InstanceState::Running,
                memory_usage_mb: 512,
                disk_usage_mb: 1024,
                cpu_usage: 30,
            }],
        };

        store.heartbeat(&stats);
        let node = store.node("node-1").unwrap();
        assert_eq!(node.load, 12);
        assert_eq!(node.instance_count, 1);
        assert_eq!(
            store.instance_stat(iid).unwrap().state,
            InstanceState::Running
        );
    }

    #[test]
    fn test_trace_filter_by_label() {
        let store = TransientStore::new();
        let frame = TraceFrame {
            label: "boot-bench".into(),
            instance_id: Uuid::new_v4(),
            node_id: "node-1".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        store.record_traces(&[frame]);
        assert_eq!(store.traces(Some("boot-bench")).len(), 1);
        assert!(store.traces(Some("other")).is_empty());
    }
}
