//! Typed payloads carried by node-bus frames.
//!
//! Field names are part of the wire contract with the node agents; they
//! serialize as snake_case key/value documents inside the frame envelope.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::InstanceState;
use crate::resources::ResourceRequest;
use crate::workload::{Firmware, VmType};

/// Storage attachment entry inside a START payload, in declared order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEntry {
    pub block_id: Uuid,
    #[serde(default)]
    pub boot: bool,
    #[serde(default)]
    pub ephemeral: bool,
}

/// Full instance description for START. A restart re-issues this frame
/// (with `restart = true`) because a stopped instance may have been
/// evicted from its node; everything the agent needs to re-materialise
/// the instance travels with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPayload {
    pub instance_id: Uuid,
    pub tenant_id: String,
    pub workload_id: Uuid,
    pub vm_type: VmType,
    pub firmware: Firmware,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub image_name: String,
    pub requested: Vec<ResourceRequest>,
    pub private_ip: Ipv4Addr,
    pub mac: String,
    pub vnic_id: Uuid,
    pub subnet: String,
    #[serde(default)]
    pub concentrator_id: String,
    #[serde(default)]
    pub concentrator_ip: String,
    #[serde(default)]
    pub storage: Vec<StorageEntry>,
    #[serde(default)]
    pub restart: bool,
    /// Opaque configuration blob consumed by the node agent.
    #[serde(default)]
    pub config: String,
    /// Present only for traced starts.
    #[serde(default)]
    pub trace_label: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCommandPayload {
    pub instance_id: Uuid,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvacuatePayload {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCommandPayload {
    pub volume_id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
}

/// Assign/release of a one-to-one NAT mapping, executed by the tenant's
/// network appliance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicIpPayload {
    pub tenant_id: String,
    pub instance_id: Uuid,
    pub external_ip: String,
    pub internal_ip: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Compute,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePayload {
    pub node_id: String,
    pub role: NodeRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEventPayload {
    pub instance_id: Uuid,
    #[serde(default)]
    pub node_id: String,
}

/// The tenant network appliance reported ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentratorPayload {
    pub instance_id: Uuid,
    pub tenant_id: String,
    pub ip: String,
    pub mac: String,
    #[serde(default)]
    pub subnet: String,
}

/// Per-instance snapshot inside a STATS frame; authoritative for
/// instance runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStat {
    pub instance_id: Uuid,
    pub state: InstanceState,
    #[serde(default)]
    pub memory_usage_mb: i64,
    #[serde(default)]
    pub disk_usage_mb: i64,
    #[serde(default)]
    pub cpu_usage: i64,
}

/// Periodic node-reported snapshot of its instances plus node health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsPayload {
    pub node_id: String,
    #[serde(default)]
    pub load: i64,
    #[serde(default)]
    pub mem_total_mb: i64,
    #[serde(default)]
    pub mem_available_mb: i64,
    #[serde(default)]
    pub disk_total_mb: i64,
    #[serde(default)]
    pub disk_available_mb: i64,
    #[serde(default)]
    pub instances: Vec<InstanceStat>,
}

/// One timing span reported by a node for a traced start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceFrame {
    pub label: String,
    pub instance_id: Uuid,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceReportPayload {
    pub frames: Vec<TraceFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurePayload {
    pub config: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantEventPayload {
    pub tenant_id: String,
    #[serde(default)]
    pub agent_ip: String,
    #[serde(default)]
    pub subnet: String,
}

/// Why a node rejected or failed a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The node had no room; the instance may be rescheduled.
    NoCapacity,
    InvalidPayload,
    ImageUnavailable,
    LaunchFailed,
    NetworkFailure,
    AlreadyRunning,
    NotRunning,
}

impl FailureReason {
    /// Fatal failures tear the instance down (unless the start was a
    /// restart attempt); transient ones leave it pending for another try.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidPayload | Self::ImageUnavailable | Self::LaunchFailed | Self::NetworkFailure
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCapacity => write!(f, "no capacity"),
            Self::InvalidPayload => write!(f, "invalid payload"),
            Self::ImageUnavailable => write!(f, "image unavailable"),
            Self::LaunchFailed => write!(f, "launch failed"),
            Self::NetworkFailure => write!(f, "network failure"),
            Self::AlreadyRunning => write!(f, "already running"),
            Self::NotRunning => write!(f, "not running"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFailurePayload {
    pub instance_id: Uuid,
    pub reason: FailureReason,
    /// True when the failed START was a restart of an exited instance.
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceFailurePayload {
    pub instance_id: Uuid,
    #[serde(default)]
    pub node_id: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeFailurePayload {
    pub instance_id: Uuid,
    pub volume_id: Uuid,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicIpFailurePayload {
    pub tenant_id: String,
    pub instance_id: Uuid,
    pub external_ip: String,
    #[serde(default)]
    pub internal_ip: String,
    #[serde(default)]
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_fatality() {
        assert!(!FailureReason::NoCapacity.is_fatal());
        assert!(!FailureReason::AlreadyRunning.is_fatal());
        assert!(FailureReason::LaunchFailed.is_fatal());
        assert!(FailureReason::ImageUnavailable.is_fatal());
    }

    #[test]
    fn test_start_payload_roundtrip() {
        let payload = StartPayload {
            instance_id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            workload_id: Uuid::new_v4(),
            vm_type: VmType::FullVm,
            firmware: Firmware::Efi,
            image_id: "img-1".into(),
            image_name: String::new(),
            requested: vec![],
            private_ip: Ipv4Addr::new(172, 16, 0, 3),
            mac: "02:00:ac:10:00:03".into(),
            vnic_id: Uuid::new_v4(),
            subnet: "172.16.0.0/24".into(),
            concentrator_id: String::new(),
            concentrator_ip: String::new(),
            storage: vec![],
            restart: false,
            config: "cpus: 2".into(),
            trace_label: None,
            started_at: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: StartPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.instance_id, payload.instance_id);
        assert!(!parsed.restart);
    }

    #[test]
    fn test_stats_payload_defaults() {
        let json = r#"{"node_id": "node-1"}"#;
        let parsed: StatsPayload = serde_json::from_str(json).unwrap();
        assert!(parsed.instances.is_empty());
        assert_eq!(parsed.load, 0);
    }
}
