//! Durable, transactional entity store for the controller.
//!
//! Two partitions: *persistent* (tenants, workloads, instances, block
//! devices, attachments, IP pools, mappings, event log) and *transient*
//! (node registry, last-known stats, trace frames). Every state-changing
//! call is durable before it returns; a failed write leaves no partial
//! mutation visible. All entities are owned here; other components hold
//! ids and join through this store.

pub mod block;
pub mod eventlog;
mod tables;
pub mod transient;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use strato_core::error::{CoreError, Result};
use strato_core::instance::{self, Instance, InstanceState};
use strato_core::naming;
use strato_core::payloads::{FailureReason, StatsPayload, TraceReportPayload};
use strato_core::pool::{IpPool, MappedIp, PoolSummary, subnet_hosts};
use strato_core::resources::ResourceRequest;
use strato_core::tenant::Tenant;
use strato_core::volume::{self, Attachment, BlockDevice, VolumeState};
use strato_core::workload::Workload;

pub use block::{BlockDriver, LocalBlockDriver};
pub use eventlog::{EventLog, EventLogEntry, LogKind};
pub use transient::{NodeInfo, TransientStore};

/// Per-tenant limits row, persisted at limits/<tenant>.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LimitsRow {
    tenant_id: String,
    limits: Vec<ResourceRequest>,
}

#[derive(Default)]
struct State {
    tenants: HashMap<String, Tenant>,
    limits: HashMap<String, Vec<ResourceRequest>>,
    workloads: HashMap<Uuid, Workload>,
    instances: HashMap<Uuid, Instance>,
    volumes: HashMap<Uuid, BlockDevice>,
    attachments: HashMap<Uuid, Attachment>,
    pools: HashMap<Uuid, IpPool>,
    /// Keyed by external IP; one mapping per address.
    mappings: HashMap<String, MappedIp>,
    next_net_id: u16,
}

/// The persistent store. Writes are serialised by the table lock; reads
/// are consistent snapshots.
pub struct Datastore {
    dir: PathBuf,
    // Held for the store's lifetime so two controllers cannot share a
    // database directory.
    _lock: std::fs::File,
    state: RwLock<State>,
    events: EventLog,
    transient: TransientStore,
}

impl Datastore {
    /// Open (or create) the database at `dir`, replaying every table.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| CoreError::Fatal(format!("cannot create {}: {e}", dir.display())))?;
        tables::prepare(dir)?;

        let lock = std::fs::File::create(dir.join(".lock"))
            .map_err(|e| CoreError::Fatal(format!("cannot create lock file: {e}")))?;
        lock.try_lock_exclusive().map_err(|_| {
            CoreError::Fatal(format!("database {} is locked by another process", dir.display()))
        })?;

        let mut state = State::default();
        for tenant in tables::load_table::<Tenant>(dir, "tenants")? {
            state.next_net_id = state.next_net_id.max(tenant.net_id + 1);
            state.tenants.insert(tenant.id.clone(), tenant);
        }
        for row in tables::load_table::<LimitsRow>(dir, "limits")? {
            state.limits.insert(row.tenant_id, row.limits);
        }
        for workload in tables::load_table::<Workload>(dir, "workloads")? {
            state.workloads.insert(workload.id, workload);
        }
        for inst in tables::load_table::<Instance>(dir, "instances")? {
            state.instances.insert(inst.id, inst);
        }
        for vol in tables::load_table::<BlockDevice>(dir, "volumes")? {
            state.volumes.insert(vol.id, vol);
        }
        for att in tables::load_table::<Attachment>(dir, "attachments")? {
            state.attachments.insert(att.id, att);
        }
        for pool in tables::load_table::<IpPool>(dir, "pools")? {
            state.pools.insert(pool.id, pool);
        }
        for mapping in tables::load_table::<MappedIp>(dir, "mappings")? {
            state.mappings.insert(mapping.external_ip.clone(), mapping);
        }

        let events = EventLog::open(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            state: RwLock::new(state),
            events,
            transient: TransientStore::new(),
        })
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn transient(&self) -> &TransientStore {
        &self.transient
    }

    // ------------------------------------------------------------------
    // Tenants
    // ------------------------------------------------------------------

    /// Create a tenant row, assigning the next free subnet key.
    pub async fn add_tenant(&self, id: &str, name: &str) -> Result<Tenant> {
        naming::validate_id(id, "tenant")?;
        let mut state = self.state.write().await;
        if state.tenants.contains_key(id) {
            return Err(CoreError::Precondition(format!("tenant {id} already exists")));
        }
        let net_id = state.next_net_id;
        let subnet = naming::tenant_subnet(net_id)?;
        let tenant = Tenant::new(id, name, net_id, &subnet);
        tables::write_row(&self.dir, "tenants", id, &tenant).await?;
        state.next_net_id = net_id + 1;
        state.tenants.insert(id.to_string(), tenant.clone());
        Ok(tenant)
    }

    /// None means "not yet created", a hit rather than an error; tenants
    /// are created lazily on their first workload request.
    pub async fn get_tenant(&self, id: &str) -> Option<Tenant> {
        self.state.read().await.tenants.get(id).cloned()
    }

    pub async fn all_tenants(&self) -> Vec<Tenant> {
        let mut tenants: Vec<_> = self.state.read().await.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        tenants
    }

    pub async fn set_tenant_appliance(
        &self,
        tenant_id: &str,
        instance_id: Uuid,
        ip: &str,
        mac: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let mut tenant = state
            .tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("tenant", tenant_id))?;
        tenant.appliance_instance_id = instance_id.to_string();
        tenant.appliance_ip = ip.to_string();
        tenant.appliance_mac = mac.to_string();
        tables::write_row(&self.dir, "tenants", tenant_id, &tenant).await?;
        state.tenants.insert(tenant_id.to_string(), tenant);
        Ok(())
    }

    /// Forget the tenant's appliance, forcing the next readiness check to
    /// launch a new one.
    pub async fn clear_tenant_appliance(&self, tenant_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let mut tenant = state
            .tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("tenant", tenant_id))?;
        tenant.appliance_instance_id.clear();
        tenant.appliance_ip.clear();
        tenant.appliance_mac.clear();
        tables::write_row(&self.dir, "tenants", tenant_id, &tenant).await?;
        state.tenants.insert(tenant_id.to_string(), tenant);
        Ok(())
    }

    pub async fn tenant_limits(&self, tenant_id: &str) -> Vec<ResourceRequest> {
        self.state
            .read()
            .await
            .limits
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_tenant_limits(
        &self,
        tenant_id: &str,
        limits: Vec<ResourceRequest>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let row = LimitsRow {
            tenant_id: tenant_id.to_string(),
            limits: limits.clone(),
        };
        tables::write_row(&self.dir, "limits", tenant_id, &row).await?;
        state.limits.insert(tenant_id.to_string(), limits);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tenant private IPs
    // ------------------------------------------------------------------

    /// Hand out the next private IP in the tenant's subnet. Monotonic
    /// until the /24 is exhausted, then released offsets are recycled.
    /// Concurrent callers always receive distinct addresses.
    pub async fn allocate_tenant_ip(&self, tenant_id: &str) -> Result<Ipv4Addr> {
        let mut state = self.state.write().await;
        let mut tenant = state
            .tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("tenant", tenant_id))?;

        let offset = if tenant.next_ip_offset <= naming::LAST_INSTANCE_OFFSET as u16 {
            let offset = tenant.next_ip_offset as u8;
            tenant.next_ip_offset += 1;
            offset
        } else if let Some(offset) = tenant.free_ip_offsets.pop() {
            offset
        } else {
            return Err(CoreError::ResourceBusy(format!(
                "tenant {tenant_id} subnet {} exhausted",
                tenant.subnet
            )));
        };

        let ip = naming::tenant_ip(&tenant.subnet, offset)?;
        tables::write_row(&self.dir, "tenants", tenant_id, &tenant).await?;
        state.tenants.insert(tenant_id.to_string(), tenant);
        Ok(ip)
    }

    pub async fn release_tenant_ip(&self, tenant_id: &str, ip: Ipv4Addr) -> Result<()> {
        let mut state = self.state.write().await;
        let mut tenant = state
            .tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("tenant", tenant_id))?;
        let offset = ip.octets()[3];
        if offset >= naming::FIRST_INSTANCE_OFFSET && !tenant.free_ip_offsets.contains(&offset) {
            tenant.free_ip_offsets.push(offset);
            tables::write_row(&self.dir, "tenants", tenant_id, &tenant).await?;
            state.tenants.insert(tenant_id.to_string(), tenant);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workloads
    // ------------------------------------------------------------------

    pub async fn add_workload(&self, workload: Workload) -> Result<Workload> {
        workload.validate()?;
        let mut state = self.state.write().await;
        tables::write_row(&self.dir, "workloads", &workload.id.to_string(), &workload).await?;
        state.workloads.insert(workload.id, workload.clone());
        Ok(workload)
    }

    /// Tenant-scoped lookup first, then the global scope.
    pub async fn get_workload(&self, tenant_id: &str, id: Uuid) -> Result<Workload> {
        let state = self.state.read().await;
        let workload = state
            .workloads
            .get(&id)
            .ok_or_else(|| CoreError::not_found("workload", id))?;
        match &workload.tenant_id {
            None => Ok(workload.clone()),
            Some(owner) if owner == tenant_id => Ok(workload.clone()),
            Some(_) => Err(CoreError::ownership("workload", id)),
        }
    }

    pub async fn all_workloads(&self) -> Vec<Workload> {
        let mut out: Vec<_> = self.state.read().await.workloads.values().cloned().collect();
        out.sort_by_key(|w| w.id);
        out
    }

    /// The network-appliance template, when one has been registered.
    pub async fn appliance_workload(&self) -> Option<Workload> {
        self.state
            .read()
            .await
            .workloads
            .values()
            .find(|w| w.cnci)
            .cloned()
    }

    /// Workloads visible to a tenant: its own plus the global ones.
    pub async fn workloads_for_tenant(&self, tenant_id: &str) -> Vec<Workload> {
        let state = self.state.read().await;
        let mut out: Vec<_> = state
            .workloads
            .values()
            .filter(|w| w.tenant_id.is_none() || w.tenant_id.as_deref() == Some(tenant_id))
            .cloned()
            .collect();
        out.sort_by_key(|w| w.id);
        out
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    pub async fn add_instance(&self, inst: &Instance) -> Result<()> {
        let mut state = self.state.write().await;
        tables::write_row(&self.dir, "instances", &inst.id.to_string(), inst).await?;
        state.instances.insert(inst.id, inst.clone());
        Ok(())
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<Instance> {
        self.state
            .read()
            .await
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("instance", id))
    }

    pub async fn all_instances(&self) -> Vec<Instance> {
        let mut out: Vec<_> = self.state.read().await.instances.values().cloned().collect();
        out.sort_by_key(|i| i.created_at);
        out
    }

    pub async fn instances_for_tenant(&self, tenant_id: &str) -> Vec<Instance> {
        let mut out: Vec<_> = self
            .state
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.created_at);
        out
    }

    pub async fn instances_on_node(&self, node_id: &str) -> Vec<Instance> {
        self.state
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Mark an instance exited after the node confirmed the stop.
    pub async fn instance_exited(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let mut inst = state
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("instance", id))?;
        instance::validate_transition(inst.state, InstanceState::Exited)?;
        if inst.state == InstanceState::Exited {
            return Ok(());
        }
        inst.state = InstanceState::Exited;
        tables::write_row(&self.dir, "instances", &id.to_string(), &inst).await?;
        state.instances.insert(id, inst);
        Ok(())
    }

    /// Precondition check for a restart; the state itself only moves when
    /// a later stats frame reports the instance running again.
    pub async fn restart_instance(&self, id: Uuid) -> Result<Instance> {
        let state = self.state.read().await;
        let inst = state
            .instances
            .get(&id)
            .ok_or_else(|| CoreError::not_found("instance", id))?;
        if inst.state != InstanceState::Exited {
            return Err(CoreError::Precondition(format!(
                "instance {id} is {}, only exited instances can be restarted",
                inst.state
            )));
        }
        Ok(inst.clone())
    }

    /// Remove an instance row together with its attachments, and return
    /// the private IP to the tenant's allocator.
    pub async fn delete_instance(&self, id: Uuid) -> Result<Instance> {
        let mut state = self.state.write().await;
        let inst = state
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("instance", id))?;

        tables::remove_row(&self.dir, "instances", &id.to_string()).await?;
        state.instances.remove(&id);

        let attachment_ids: Vec<Uuid> = state
            .attachments
            .values()
            .filter(|a| a.instance_id == id)
            .map(|a| a.id)
            .collect();
        for att_id in attachment_ids {
            tables::remove_row(&self.dir, "attachments", &att_id.to_string()).await?;
            state.attachments.remove(&att_id);
        }

        // The appliance's reserved offset is not allocator-owned and must
        // not enter the free list.
        let offset = inst.private_ip.octets()[3];
        if offset >= naming::FIRST_INSTANCE_OFFSET {
            if let Some(mut tenant) = state.tenants.get(&inst.tenant_id).cloned() {
                if !tenant.free_ip_offsets.contains(&offset) {
                    tenant.free_ip_offsets.push(offset);
                    tables::write_row(&self.dir, "tenants", &inst.tenant_id, &tenant).await?;
                    state.tenants.insert(inst.tenant_id.clone(), tenant);
                }
            }
        }

        Ok(inst)
    }

    // ------------------------------------------------------------------
    // Stats and traces
    // ------------------------------------------------------------------

    /// Apply a node stats frame. Authoritative for instance runtime
    /// state: a pending instance named by a node becomes that node's, a
    /// reported exit moves the row to exited. Idempotent under replay
    /// and reorder; stale reports for unknown instances are dropped.
    pub async fn handle_stats(&self, stats: &StatsPayload) -> Result<()> {
        self.transient.heartbeat(stats);

        let mut state = self.state.write().await;
        for stat in &stats.instances {
            let Some(mut inst) = state.instances.get(&stat.instance_id).cloned() else {
                debug!(instance = %stat.instance_id, node = %stats.node_id,
                       "stats for unknown instance");
                continue;
            };

            let node_changed = inst.node_id != stats.node_id;
            let state_changed = inst.state != stat.state;
            if state_changed
                && instance::validate_transition(inst.state, stat.state).is_err()
            {
                debug!(instance = %stat.instance_id, from = %inst.state, to = %stat.state,
                       "ignoring stale state report");
                continue;
            }
            if !node_changed && !state_changed {
                continue;
            }

            inst.node_id = stats.node_id.clone();
            inst.state = stat.state;
            tables::write_row(&self.dir, "instances", &inst.id.to_string(), &inst).await?;
            state.instances.insert(inst.id, inst);
        }
        Ok(())
    }

    /// Trace frames never touch the control plane; transient only.
    pub fn handle_trace_report(&self, report: &TraceReportPayload) {
        self.transient.record_traces(&report.frames);
    }

    // ------------------------------------------------------------------
    // Block devices and attachments
    // ------------------------------------------------------------------

    pub async fn add_volume(&self, vol: &BlockDevice) -> Result<()> {
        let mut state = self.state.write().await;
        tables::write_row(&self.dir, "volumes", &vol.id.to_string(), vol).await?;
        state.volumes.insert(vol.id, vol.clone());
        Ok(())
    }

    pub async fn get_volume(&self, id: Uuid) -> Result<BlockDevice> {
        self.state
            .read()
            .await
            .volumes
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("volume", id))
    }

    pub async fn all_volumes(&self) -> Vec<BlockDevice> {
        self.state.read().await.volumes.values().cloned().collect()
    }

    pub async fn volumes_for_tenant(&self, tenant_id: &str) -> Vec<BlockDevice> {
        let mut out: Vec<_> = self
            .state
            .read()
            .await
            .volumes
            .values()
            .filter(|v| v.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by_key(|v| v.created_at);
        out
    }

    pub async fn set_volume_state(&self, id: Uuid, to: VolumeState) -> Result<()> {
        let mut state = self.state.write().await;
        let mut vol = state
            .volumes
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("volume", id))?;
        volume::validate_transition(vol.state, to)?;
        if vol.state == to {
            return Ok(());
        }
        vol.state = to;
        tables::write_row(&self.dir, "volumes", &id.to_string(), &vol).await?;
        state.volumes.insert(id, vol);
        Ok(())
    }

    pub async fn delete_volume(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.volumes.contains_key(&id) {
            return Err(CoreError::not_found("volume", id));
        }
        tables::remove_row(&self.dir, "volumes", &id.to_string()).await?;
        state.volumes.remove(&id);
        Ok(())
    }

    pub async fn create_attachment(
        &self,
        instance_id: Uuid,
        block_id: Uuid,
        boot: bool,
        ephemeral: bool,
    ) -> Result<Attachment> {
        let mut state = self.state.write().await;
        let ordinal = state
            .attachments
            .values()
            .filter(|a| a.instance_id == instance_id)
            .map(|a| a.ordinal + 1)
            .max()
            .unwrap_or(0);
        let att = Attachment::new(instance_id, block_id, boot, ephemeral, ordinal);
        tables::write_row(&self.dir, "attachments", &att.id.to_string(), &att).await?;
        state.attachments.insert(att.id, att.clone());
        Ok(att)
    }

    pub async fn delete_attachment(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        tables::remove_row(&self.dir, "attachments", &id.to_string()).await?;
        state.attachments.remove(&id);
        Ok(())
    }

    /// Attachments of an instance, in declaration order.
    pub async fn attachments_for_instance(&self, instance_id: Uuid) -> Vec<Attachment> {
        let mut out: Vec<_> = self
            .state
            .read()
            .await
            .attachments
            .values()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.ordinal);
        out
    }

    pub async fn attachment_for_volume(&self, block_id: Uuid) -> Option<Attachment> {
        self.state
            .read()
            .await
            .attachments
            .values()
            .find(|a| a.block_id == block_id)
            .cloned()
    }

    // ------------------------------------------------------------------
    // External IP pools
    // ------------------------------------------------------------------

    pub async fn add_pool(
        &self,
        name: &str,
        subnet: Option<&str>,
        ips: &[String],
    ) -> Result<IpPool> {
        naming::validate_id(name, "pool")?;
        let mut state = self.state.write().await;
        if state.pools.values().any(|p| p.name == name) {
            return Err(CoreError::Precondition(format!("pool {name} already exists")));
        }
        let mut pool = IpPool::new(name);
        if let Some(subnet) = subnet {
            subnet_hosts(subnet)?;
            pool.subnets.push(subnet.to_string());
        }
        for ip in ips {
            ip.parse::<Ipv4Addr>()
                .map_err(|_| CoreError::BadRequest(format!("malformed address {ip:?}")))?;
            pool.ips.push(ip.clone());
        }
        tables::write_row(&self.dir, "pools", &pool.id.to_string(), &pool).await?;
        state.pools.insert(pool.id, pool.clone());
        Ok(pool)
    }

    pub async fn get_pool(&self, id: Uuid) -> Result<IpPool> {
        self.state
            .read()
            .await
            .pools
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("pool", id))
    }

    pub async fn pool_by_name(&self, name: &str) -> Option<IpPool> {
        self.state
            .read()
            .await
            .pools
            .values()
            .find(|p| p.name == name)
            .cloned()
    }

    pub async fn pool_summaries(&self) -> Vec<PoolSummary> {
        let state = self.state.read().await;
        let mut pools: Vec<_> = state.pools.values().collect();
        pools.sort_by_key(|p| p.created_at);
        pools
            .iter()
            .map(|p| {
                let mapped = state.mappings.values().filter(|m| m.pool_id == p.id).count();
                PoolSummary {
                    id: p.id,
                    name: p.name.clone(),
                    total: p.total(),
                    free: p.total().saturating_sub(mapped),
                }
            })
            .collect()
    }

    /// Delete a pool; refused while any of its addresses is mapped.
    pub async fn delete_pool(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.pools.contains_key(&id) {
            return Err(CoreError::not_found("pool", id));
        }
        if state.mappings.values().any(|m| m.pool_id == id) {
            return Err(CoreError::ResourceBusy(format!(
                "pool {id} has mapped addresses"
            )));
        }
        tables::remove_row(&self.dir, "pools", &id.to_string()).await?;
        state.pools.remove(&id);
        Ok(())
    }

    pub async fn add_pool_addresses(
        &self,
        id: Uuid,
        subnet: Option<&str>,
        ips: &[String],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let mut pool = state
            .pools
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("pool", id))?;
        if let Some(subnet) = subnet {
            subnet_hosts(subnet)?;
            if !pool.subnets.contains(&subnet.to_string()) {
                pool.subnets.push(subnet.to_string());
            }
        }
        for ip in ips {
            ip.parse::<Ipv4Addr>()
                .map_err(|_| CoreError::BadRequest(format!("malformed address {ip:?}")))?;
            if !pool.ips.contains(ip) {
                pool.ips.push(ip.clone());
            }
        }
        tables::write_row(&self.dir, "pools", &id.to_string(), &pool).await?;
        state.pools.insert(id, pool);
        Ok(())
    }

    /// Remove one literal address or one whole subnet from a pool;
    /// refused while any affected address is mapped.
    pub async fn remove_pool_address(&self, id: Uuid, addr: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let mut pool = state
            .pools
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("pool", id))?;

        if let Some(pos) = pool.subnets.iter().position(|s| s == addr) {
            let hosts = subnet_hosts(addr)?;
            if hosts
                .iter()
                .any(|h| state.mappings.contains_key(&h.to_string()))
            {
                return Err(CoreError::ResourceBusy(format!(
                    "subnet {addr} has mapped addresses"
                )));
            }
            pool.subnets.remove(pos);
        } else if let Some(pos) = pool.ips.iter().position(|i| i == addr) {
            if state.mappings.contains_key(addr) {
                return Err(CoreError::ResourceBusy(format!("address {addr} is mapped")));
            }
            pool.ips.remove(pos);
        } else {
            return Err(CoreError::not_found("pool address", addr));
        }

        tables::write_row(&self.dir, "pools", &id.to_string(), &pool).await?;
        state.pools.insert(id, pool);
        Ok(())
    }

    /// Reserve an external address for an instance. With no pool name,
    /// pools are scanned in creation order for one with a free address.
    pub async fn map_external_ip(
        &self,
        pool_name: Option<&str>,
        tenant_id: &str,
        instance_id: Uuid,
        internal_ip: Ipv4Addr,
    ) -> Result<MappedIp> {
        let mut state = self.state.write().await;

        let mut candidates: Vec<IpPool> = match pool_name {
            Some(name) => vec![
                state
                    .pools
                    .values()
                    .find(|p| p.name == name)
                    .cloned()
                    .ok_or_else(|| CoreError::not_found("pool", name))?,
            ],
            None => {
                let mut pools: Vec<_> = state.pools.values().cloned().collect();
                pools.sort_by_key(|p| p.created_at);
                pools
            }
        };

        for pool in candidates.drain(..) {
            for addr in pool.addresses() {
                let key = addr.to_string();
                if state.mappings.contains_key(&key) {
                    continue;
                }
                let mapping = MappedIp {
                    external_ip: key.clone(),
                    internal_ip: internal_ip.to_string(),
                    tenant_id: tenant_id.to_string(),
                    instance_id,
                    pool_id: pool.id,
                };
                tables::write_row(&self.dir, "mappings", &key, &mapping).await?;
                state.mappings.insert(key, mapping.clone());
                return Ok(mapping);
            }
        }

        Err(CoreError::ResourceBusy(match pool_name {
            Some(name) => format!("pool {name} has no free addresses"),
            None => "no pool has free addresses".into(),
        }))
    }

    pub async fn unmap_external_ip(&self, external_ip: &str) -> Result<MappedIp> {
        let mut state = self.state.write().await;
        let mapping = state
            .mappings
            .get(external_ip)
            .cloned()
            .ok_or_else(|| CoreError::not_found("mapped address", external_ip))?;
        tables::remove_row(&self.dir, "mappings", external_ip).await?;
        state.mappings.remove(external_ip);
        Ok(mapping)
    }

    pub async fn get_mapped_ip(&self, external_ip: &str) -> Result<MappedIp> {
        self.state
            .read()
            .await
            .mappings
            .get(external_ip)
            .cloned()
            .ok_or_else(|| CoreError::not_found("mapped address", external_ip))
    }

    pub async fn mapped_ips(&self, tenant_id: Option<&str>) -> Vec<MappedIp> {
        let state = self.state.read().await;
        let mut out: Vec<_> = state
            .mappings
            .values()
            .filter(|m| tenant_id.is_none_or(|t| m.tenant_id == t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.external_ip.cmp(&b.external_ip));
        out
    }

    pub async fn mappings_for_instance(&self, instance_id: Uuid) -> Vec<MappedIp> {
        self.state
            .read()
            .await
            .mappings
            .values()
            .filter(|m| m.instance_id == instance_id)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Failure recorders
    // ------------------------------------------------------------------

    pub async fn start_failure(
        &self,
        instance_id: Uuid,
        reason: FailureReason,
        restart: bool,
    ) -> Result<()> {
        let tenant = self
            .state
            .read()
            .await
            .instances
            .get(&instance_id)
            .map(|i| i.tenant_id.clone());
        let verb = if restart { "restart" } else { "start" };
        self.events
            .append(
                tenant.as_deref(),
                LogKind::Error,
                format!("{verb} of instance {instance_id} failed: {reason}"),
            )
            .await
    }

    pub async fn stop_failure(&self, instance_id: Uuid, reason: FailureReason) -> Result<()> {
        let tenant = self
            .state
            .read()
            .await
            .instances
            .get(&instance_id)
            .map(|i| i.tenant_id.clone());
        self.events
            .append(
                tenant.as_deref(),
                LogKind::Error,
                format!("stop of instance {instance_id} failed: {reason}"),
            )
            .await
    }

    pub async fn restart_failure(&self, instance_id: Uuid, reason: FailureReason) -> Result<()> {
        let tenant = self
            .state
            .read()
            .await
            .instances
            .get(&instance_id)
            .map(|i| i.tenant_id.clone());
        self.events
            .append(
                tenant.as_deref(),
                LogKind::Error,
                format!("restart of instance {instance_id} failed: {reason}"),
            )
            .await
    }

    /// Revert a failed attach: the device returns to `available` and the
    /// provisional attachment row is dropped.
    pub async fn attach_volume_failure(
        &self,
        instance_id: Uuid,
        volume_id: Uuid,
        reason: &str,
    ) -> Result<()> {
        let attachment = self.attachment_for_volume(volume_id).await;
        if let Some(att) = attachment.filter(|a| a.instance_id == instance_id) {
            self.delete_attachment(att.id).await?;
        }
        self.set_volume_state(volume_id, VolumeState::Available).await?;

        let tenant = self
            .state
            .read()
            .await
            .volumes
            .get(&volume_id)
            .map(|v| v.tenant_id.clone());
        self.events
            .append(
                tenant.as_deref(),
                LogKind::Error,
                format!("attach of volume {volume_id} to instance {instance_id} failed: {reason}"),
            )
            .await
    }

    /// Revert a failed detach: the device stays attached, back to `in-use`.
    pub async fn detach_volume_failure(
        &self,
        instance_id: Uuid,
        volume_id: Uuid,
        reason: &str,
    ) -> Result<()> {
        self.set_volume_state(volume_id, VolumeState::InUse).await?;
        let tenant = self
            .state
            .read()
            .await
            .volumes
            .get(&volume_id)
            .map(|v| v.tenant_id.clone());
        self.events
            .append(
                tenant.as_deref(),
                LogKind::Error,
                format!("detach of volume {volume_id} from instance {instance_id} failed: {reason}"),
            )
            .await
    }
}
