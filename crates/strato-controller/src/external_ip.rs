//! External-IP pool administration and one-to-one NAT mapping verbs.

use uuid::Uuid;

use strato_core::error::{CoreError, Result};
use strato_core::pool::{IpPool, MappedIp, PoolSummary};
use strato_core::resources::{ResourceKind, ResourceRequest};

use crate::Controller;

impl Controller {
    /// Create a pool. Each address argument is either a CIDR subnet or a
    /// literal IP.
    pub async fn add_pool(&self, name: &str, addresses: &[String]) -> Result<IpPool> {
        let (subnets, ips) = split_addresses(addresses);
        let mut pool = self.store.add_pool(name, subnets.first().map(|s| s.as_str()), &ips).await?;
        for subnet in subnets.iter().skip(1) {
            self.store
                .add_pool_addresses(pool.id, Some(subnet), &[])
                .await?;
        }
        if subnets.len() > 1 {
            pool = self.store.get_pool(pool.id).await?;
        }
        Ok(pool)
    }

    pub async fn list_pools(&self) -> Vec<PoolSummary> {
        self.store.pool_summaries().await
    }

    /// One pool with its derived counters.
    pub async fn show_pool(&self, name: &str) -> Result<(IpPool, PoolSummary)> {
        let pool = self
            .store
            .pool_by_name(name)
            .await
            .ok_or_else(|| CoreError::not_found("pool", name))?;
        let summary = self
            .store
            .pool_summaries()
            .await
            .into_iter()
            .find(|s| s.id == pool.id)
            .ok_or_else(|| CoreError::not_found("pool", name))?;
        Ok((pool, summary))
    }

    pub async fn delete_pool(&self, name: &str) -> Result<()> {
        let pool = self
            .store
            .pool_by_name(name)
            .await
            .ok_or_else(|| CoreError::not_found("pool", name))?;
        self.store.delete_pool(pool.id).await
    }

    /// Grow a pool by subnets and/or literal addresses.
    pub async fn add_pool_addresses(&self, name: &str, addresses: &[String]) -> Result<()> {
        let pool = self
            .store
            .pool_by_name(name)
            .await
            .ok_or_else(|| CoreError::not_found("pool", name))?;
        let (subnets, ips) = split_addresses(addresses);
        for subnet in &subnets {
            self.store
                .add_pool_addresses(pool.id, Some(subnet), &[])
                .await?;
        }
        if !ips.is_empty() {
            self.store.add_pool_addresses(pool.id, None, &ips).await?;
        }
        Ok(())
    }

    /// Shrink a pool by one subnet or one literal address; refused while
    /// any affected address is mapped.
    pub async fn remove_pool_address(&self, name: &str, address: &str) -> Result<()> {
        let pool = self
            .store
            .pool_by_name(name)
            .await
            .ok_or_else(|| CoreError::not_found("pool", name))?;
        self.store.remove_pool_address(pool.id, address).await
    }

    /// Map an external address onto an instance's private IP. With no
    /// pool name, pools are scanned in creation order for a free
    /// address. The mapping is durable before the appliance command is
    /// queued; a queue failure rolls back both mapping and quota.
    pub async fn map_address(
        &self,
        tenant_id: &str,
        pool_name: Option<&str>,
        instance_id: Uuid,
    ) -> Result<MappedIp> {
        let instance = self.owned_instance(tenant_id, instance_id).await?;

        let demand = [ResourceRequest::new(ResourceKind::ExternalIps, 1)];
        let outcome = self
            .quota
            .consume(tenant_id, &demand)
            .await
            .map_err(|_| CoreError::Fatal("quota engine unavailable".into()))?;
        if !outcome.allowed() {
            self.quota.release(tenant_id, outcome.resources());
            return Err(CoreError::QuotaExceeded(
                ResourceKind::ExternalIps.to_string(),
            ));
        }

        let mapping = match self
            .store
            .map_external_ip(pool_name, tenant_id, instance_id, instance.private_ip)
            .await
        {
            Ok(mapping) => mapping,
            Err(e) => {
                self.quota.release(tenant_id, outcome.resources());
                return Err(e);
            }
        };

        if let Err(e) = self.node.map_external_ip(&mapping).await {
            let _ = self.store.unmap_external_ip(&mapping.external_ip).await;
            self.quota.release(tenant_id, outcome.resources());
            return Err(e);
        }
        Ok(mapping)
    }

    /// Ask the appliance to drop a mapping. The store row goes away when
    /// the unassign event arrives, so the address cannot be re-handed out
    /// while the NAT rule may still exist.
    pub async fn unmap_address(&self, tenant_id: &str, external_ip: &str) -> Result<()> {
        let mapping = self.store.get_mapped_ip(external_ip).await?;
        if mapping.tenant_id != tenant_id {
            return Err(CoreError::ownership("mapped address", external_ip));
        }
        self.node.unmap_external_ip(&mapping).await
    }

    pub async fn mapped_addresses(&self, tenant_id: Option<&str>) -> Vec<MappedIp> {
        self.store.mapped_ips(tenant_id).await
    }
}

/// Partition address arguments into CIDR subnets and literal IPs.
fn split_addresses(addresses: &[String]) -> (Vec<String>, Vec<String>) {
    let mut subnets = Vec::new();
    let mut ips = Vec::new();
    for addr in addresses {
        if addr.contains('/') {
            subnets.push(addr.clone());
        } else {
            ips.push(addr.clone());
        }
    }
    (subnets, ips)
}
