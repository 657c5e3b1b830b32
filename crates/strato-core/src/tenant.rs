use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::naming;

/// Tenant row, persisted at tenants/<id>.json.
///
/// `appliance_ip` stays empty until the tenant's network appliance has
/// reported ready; readiness re-checks it after the launch completes.
/// The private-IP allocator state lives inside the row so an allocation
/// is durable together with the tenant it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Subnet key: index of this tenant's /24 within 172.16.0.0/12.
    pub net_id: u16,
    pub subnet: String,
    #[serde(default)]
    pub appliance_instance_id: String,
    #[serde(default)]
    pub appliance_ip: String,
    #[serde(default)]
    pub appliance_mac: String,
    pub created_at: DateTime<Utc>,
    /// Next host offset to hand out; monotonic until the /24 is exhausted.
    pub next_ip_offset: u16,
    /// Released offsets, recycled once the monotonic counter wraps.
    #[serde(default)]
    pub free_ip_offsets: Vec<u8>,
}

impl Tenant {
    pub fn new(id: &str, name: &str, net_id: u16, subnet: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            net_id,
            subnet: subnet.to_string(),
            appliance_instance_id: String::new(),
            appliance_ip: String::new(),
            appliance_mac: String::new(),
            created_at: Utc::now(),
            next_ip_offset: naming::FIRST_INSTANCE_OFFSET as u16,
            free_ip_offsets: Vec::new(),
        }
    }

    /// Whether the network appliance has reported its address.
    pub fn appliance_ready(&self) -> bool {
        !self.appliance_ip.is_empty()
    }
}
