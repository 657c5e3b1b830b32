use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::naming;

/// Instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Exited,
    Deleted,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// Validate an instance state transition.
///
/// pending → running is driven by a node stats frame naming the instance;
/// running → exited by a STOP ack; exited → running by a restart; any
/// state can go to deleted once the node confirms the DELETE. Same-state
/// transitions are no-ops so stats replay stays idempotent.
pub fn validate_transition(from: InstanceState, to: InstanceState) -> Result<()> {
    if from == to || to == InstanceState::Deleted {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        (InstanceState::Pending, InstanceState::Running)
            // A node can report an instance that started and died between
            // two stats frames.
            | (InstanceState::Pending, InstanceState::Exited)
            | (InstanceState::Running, InstanceState::Exited)
            | (InstanceState::Exited, InstanceState::Running)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::Precondition(format!(
            "invalid instance state transition: {} -> {}",
            from, to
        )))
    }
}

/// Instance row, persisted at instances/<id>.json.
///
/// Attachments are joined through the store by id; the row itself never
/// holds entity pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub tenant_id: String,
    pub workload_id: Uuid,
    #[serde(default)]
    pub name: String,
    /// Empty until a node stats frame claims the instance.
    #[serde(default)]
    pub node_id: String,
    pub state: InstanceState,
    pub private_ip: Ipv4Addr,
    pub mac: String,
    pub subnet: String,
    pub vnic_id: Uuid,
    /// Tenant network appliance instances bypass readiness and quota.
    #[serde(default)]
    pub cnci: bool,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(tenant_id: &str, workload_id: Uuid, name: &str, subnet: &str, ip: Ipv4Addr) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            workload_id,
            name: name.to_string(),
            node_id: String::new(),
            state: InstanceState::Pending,
            private_ip: ip,
            mac: naming::mac_from_ip(ip),
            subnet: subnet.to_string(),
            vnic_id: Uuid::new_v4(),
            cnci: false,
            created_at: Utc::now(),
        }
    }

    pub fn assigned(&self) -> bool {
        !self.node_id.is_empty()
    }
}
