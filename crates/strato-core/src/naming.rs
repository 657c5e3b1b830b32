use std::net::Ipv4Addr;

use crate::error::{CoreError, Result};

/// Validate a tenant or pool name: lowercase alphanumeric + hyphens, 1-63 chars.
pub fn validate_id(id: &str, kind: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 {
        return Err(CoreError::BadRequest(format!(
            "{} ID must be 1-63 characters, got {}",
            kind,
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(CoreError::BadRequest(format!(
            "{} ID must be lowercase alphanumeric + hyphens: {:?}",
            kind, id
        )));
    }
    if id.starts_with('-') || id.ends_with('-') {
        return Err(CoreError::BadRequest(format!(
            "{} ID must not start or end with a hyphen: {:?}",
            kind, id
        )));
    }
    Ok(())
}

/// Deterministic MAC address for an instance, derived from its private IP.
/// Format: 02:00:<a>:<b>:<c>:<d> (locally administered), so a node agent can
/// recompute the address from the IP alone.
pub fn mac_from_ip(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("02:00:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3])
}

/// Tenant subnet for a tenant net id, carved from 172.16.0.0/12.
/// One /24 per tenant; net ids above 4095 would leave the block.
pub fn tenant_subnet(net_id: u16) -> Result<String> {
    if net_id > 4095 {
        return Err(CoreError::Fatal(format!(
            "tenant net id {} outside the 172.16.0.0/12 block",
            net_id
        )));
    }
    Ok(format!("172.{}.{}.0/24", 16 + net_id / 256, net_id % 256))
}

/// Instance IP within a tenant subnet at the given host offset.
/// .1 is the subnet gateway, .2 the network appliance, instances use .3-.254.
pub fn tenant_ip(subnet: &str, offset: u8) -> Result<Ipv4Addr> {
    let base = subnet
        .split('/')
        .next()
        .and_then(|s| s.parse::<Ipv4Addr>().ok())
        .ok_or_else(|| CoreError::BadRequest(format!("malformed subnet {:?}", subnet)))?;
    let o = base.octets();
    Ok(Ipv4Addr::new(o[0], o[1], o[2], offset))
}

/// First usable host offset for instances within a tenant subnet.
pub const FIRST_INSTANCE_OFFSET: u8 = 3;
/// Last usable host offset within a tenant /24.
pub const LAST_INSTANCE_OFFSET: u8 = 254;
/// Host offset reserved for the tenant network appliance.
pub const APPLIANCE_OFFSET: u8 = 2;

/// Display name for the i-th instance of a start request.
/// Multi-instance requests get a numeric suffix; names are advisory.
pub fn instance_name(base: &str, index: usize, count: usize) -> String {
    if count > 1 {
        format!("{}-{}", base, index)
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id_valid() {
        assert!(validate_id("acme", "Tenant").is_ok());
        assert!(validate_id("pool-1", "Pool").is_ok());
        assert!(validate_id("a", "Tenant").is_ok());
    }

    #[test]
    fn test_validate_id_invalid() {
        assert!(validate_id("", "Tenant").is_err());
        assert!(validate_id("UPPER", "Tenant").is_err());
        assert!(validate_id("-leading", "Tenant").is_err());
        assert!(validate_id("trailing-", "Tenant").is_err());
        assert!(validate_id(&"a".repeat(64), "Tenant").is_err());
    }

    #[test]
    fn test_mac_from_ip_embeds_octets() {
        let mac = mac_from_ip(Ipv4Addr::new(172, 16, 3, 5));
        assert_eq!(mac, "02:00:ac:10:03:05");
        assert_eq!(mac.len(), 17);
    }

    #[test]
    fn test_tenant_subnet_layout() {
        assert_eq!(tenant_subnet(0).unwrap(), "172.16.0.0/24");
        assert_eq!(tenant_subnet(255).unwrap(), "172.16.255.0/24");
        assert_eq!(tenant_subnet(256).unwrap(), "172.17.0.0/24");
        assert_eq!(tenant_subnet(4095).unwrap(), "172.31.255.0/24");
        assert!(tenant_subnet(4096).is_err());
    }

    #[test]
    fn test_tenant_ip_offset() {
        let ip = tenant_ip("172.16.3.0/24", 7).unwrap();
        assert_eq!(ip, Ipv4Addr::new(172, 16, 3, 7));
        assert!(tenant_ip("not-a-subnet", 7).is_err());
    }

    #[test]
    fn test_instance_name_suffix_only_for_multi() {
        assert_eq!(instance_name("web", 0, 1), "web");
        assert_eq!(instance_name("web", 0, 3), "web-0");
        assert_eq!(instance_name("web", 2, 3), "web-2");
    }
}
