use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Named set of externally routable addresses admins expose to tenants
/// for one-to-one NAT onto private instance IPs. Persisted at
/// pools/<id>.json; pool names are unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpPool {
    pub id: Uuid,
    pub name: String,
    /// CIDR blocks contributing their host addresses to the pool.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Literal addresses added one by one.
    #[serde(default)]
    pub ips: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl IpPool {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            subnets: Vec::new(),
            ips: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Total addresses this pool can hand out.
    pub fn total(&self) -> usize {
        let from_subnets: usize = self
            .subnets
            .iter()
            .filter_map(|s| subnet_host_count(s).ok())
            .sum();
        from_subnets + self.ips.len()
    }

    /// All candidate addresses, subnets first, in declaration order.
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        let mut out = Vec::new();
        for subnet in &self.subnets {
            if let Ok(hosts) = subnet_hosts(subnet) {
                out.extend(hosts);
            }
        }
        out.extend(self.ips.iter().filter_map(|s| s.parse::<Ipv4Addr>().ok()));
        out
    }
}

/// One-to-one NAT mapping from a pool address onto a private instance IP.
/// Persisted at mappings/<external-ip>.json; one mapping per external IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedIp {
    pub external_ip: String,
    pub internal_ip: String,
    pub tenant_id: String,
    pub instance_id: Uuid,
    pub pool_id: Uuid,
}

/// Pool listing row for the API layer: name plus derived counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSummary {
    pub id: Uuid,
    pub name: String,
    pub total: usize,
    pub free: usize,
}

/// Number of usable host addresses in a v4 CIDR (network and broadcast
/// excluded for prefixes shorter than /31).
pub fn subnet_host_count(cidr: &str) -> Result<usize> {
    let (_, prefix) = parse_cidr(cidr)?;
    Ok(match prefix {
        32 => 1,
        31 => 2,
        _ => (1usize << (32 - prefix)) - 2,
    })
}

/// Iterate the usable host addresses of a v4 CIDR in ascending order.
pub fn subnet_hosts(cidr: &str) -> Result<Vec<Ipv4Addr>> {
    let (base, prefix) = parse_cidr(cidr)?;
    let base = u32::from(base) & mask(prefix);
    let (first, last) = match prefix {
        32 => (base, base),
        31 => (base, base + 1),
        _ => (base + 1, base + (1 << (32 - prefix)) - 2),
    };
    Ok((first..=last).map(Ipv4Addr::from).collect())
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let bad = || CoreError::BadRequest(format!("malformed CIDR {:?}", cidr));
    let (addr, prefix) = cidr.split_once('/').ok_or_else(bad)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| bad())?;
    let prefix: u8 = prefix.parse().map_err(|_| bad())?;
    if prefix > 32 {
        return Err(bad());
    }
    // Refuse blocks too large to enumerate into a pool.
    if prefix < 16 {
        return Err(CoreError::BadRequest(format!(
            "subnet {} larger than /16 not supported for pools",
            cidr
        )));
    }
    Ok((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_host_count() {
        assert_eq!(subnet_host_count("203.0.113.0/24").unwrap(), 254);
        assert_eq!(subnet_host_count("203.0.113.0/30").unwrap(), 2);
        assert_eq!(subnet_host_count("203.0.113.4/31").unwrap(), 2);
        assert_eq!(subnet_host_count("203.0.113.4/32").unwrap(), 1);
        assert!(subnet_host_count("203.0.113.0").is_err());
        assert!(subnet_host_count("203.0.113.0/8").is_err());
    }

    #[test]
    fn test_subnet_hosts_excludes_network_and_broadcast() {
        let hosts = subnet_hosts("203.0.113.0/30").unwrap();
        assert_eq!(
            hosts,
            vec![
                Ipv4Addr::new(203, 0, 113, 1),
                Ipv4Addr::new(203, 0, 113, 2)
            ]
        );
    }

    #[test]
    fn test_pool_total_mixes_subnets_and_literals() {
        let mut pool = IpPool::new("public");
        pool.subnets.push("203.0.113.0/30".into());
        pool.ips.push("198.51.100.7".into());
        assert_eq!(pool.total(), 3);
        assert_eq!(pool.addresses().len(), 3);
    }

    #[test]
    fn test_mapped_ip_roundtrip() {
        let m = MappedIp {
            external_ip: "203.0.113.1".into(),
            internal_ip: "172.16.0.3".into(),
            tenant_id: "acme".into(),
            instance_id: Uuid::new_v4(),
            pool_id: Uuid::new_v4(),
        };
        let json = serde_json::to_string(&m).unwrap();
        let parsed: MappedIp = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.external_ip, "203.0.113.1");
    }
}
