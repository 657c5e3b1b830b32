//! Workload lifecycle verbs and tenant confirmation.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use strato_core::error::{CoreError, Result};
use strato_core::instance::{Instance, InstanceState};
use strato_core::naming;
use strato_core::resources::{ResourceKind, ResourceRequest};
use strato_core::tenant::Tenant;
use strato_core::volume::{Attachment, BlockDevice, VolumeState};
use strato_core::workload::{Firmware, StorageResource, StorageSource, VmType, Workload};
use strato_node::build_start_payload;

use crate::Controller;
use crate::events;
use crate::readiness::Claim;

/// Bounded wait for the appliance to report its address. Everything else
/// in the production path is event-driven and does not time out.
const APPLIANCE_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// One workload start request, N independent instances.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub tenant_id: String,
    pub workload_id: Uuid,
    pub instances: usize,
    /// Existing volumes to attach to each instance at boot.
    pub volumes: Vec<Uuid>,
    pub name: Option<String>,
    pub trace_label: Option<String>,
}

/// Outcome of a start: instance creations are independent, so some may
/// have succeeded before the first failure. The error is deferred; the
/// successfully created instances stand.
#[derive(Debug)]
pub struct StartResult {
    pub instances: Vec<Instance>,
    pub error: Option<CoreError>,
}

/// Everything to undo when one instance creation fails mid-build.
#[derive(Default)]
struct CleanupLedger {
    quota: Option<Vec<ResourceRequest>>,
    attachments: Vec<Uuid>,
    created_volumes: Vec<Uuid>,
    borrowed_volumes: Vec<Uuid>,
}

impl Controller {
    /// Start `request.instances` instances of a workload. Partial success
    /// is allowed; iteration stops at the first failed creation and the
    /// failure is reported alongside the instances that made it.
    pub async fn start_workload(&self, request: StartRequest) -> Result<StartResult> {
        if request.instances == 0 {
            return Err(CoreError::BadRequest(
                "instance count must be positive".into(),
            ));
        }

        let workload = self
            .store
            .get_workload(&request.tenant_id, request.workload_id)
            .await?;
        workload.validate()?;

        // Appliance workloads are what readiness waits for; sending them
        // through confirmation would deadlock on themselves.
        if !workload.cnci {
            self.confirm_tenant(&request.tenant_id).await?;
        }
        let tenant = self
            .store
            .get_tenant(&request.tenant_id)
            .await
            .ok_or_else(|| CoreError::not_found("tenant", &request.tenant_id))?;

        let mut result = StartResult {
            instances: Vec::new(),
            error: None,
        };
        let base_name = request.name.clone().unwrap_or_default();

        for i in 0..request.instances {
            let name = if base_name.is_empty() {
                String::new()
            } else {
                naming::instance_name(&base_name, i, request.instances)
            };

            match self.build_instance(&tenant, &workload, &request, &name).await {
                Ok((instance, attachments)) => {
                    let payload =
                        build_start_payload(&instance, &workload, &tenant, &attachments, false);
                    let sent = match &request.trace_label {
                        Some(label) => {
                            self.node
                                .start_traced_workload(payload, Utc::now(), label)
                                .await
                        }
                        None => self.node.start_workload(payload).await,
                    };
                    if let Err(e) = sent {
                        // The instance stays pending; recovery is driven
                        // by later stats/failure frames.
                        warn!(instance = %instance.id, error = %e, "START not queued");
                    }
                    info!(instance = %instance.id, tenant = %tenant.id,
                          workload = %workload.id, "instance created");
                    result.instances.push(instance);
                }
                Err(e) => {
                    result.error = Some(e);
                    break;
                }
            }
        }
        Ok(result)
    }

    /// Build one instance: private IP, deterministic MAC, storage
    /// composition, quota, persistence. Returns the attachments in
    /// declared order for the START frame. Any failure unwinds
    /// everything this instance acquired.
    async fn build_instance(
        &self,
        tenant: &Tenant,
        workload: &Workload,
        request: &StartRequest,
        name: &str,
    ) -> Result<(Instance, Vec<Attachment>)> {
        // The appliance owns the reserved host offset in the tenant
        // subnet; ordinary instances draw from the allocator.
        let ip = if workload.cnci {
            naming::tenant_ip(&tenant.subnet, naming::APPLIANCE_OFFSET)?
        } else {
            self.store.allocate_tenant_ip(&tenant.id).await?
        };

        let mut instance = Instance::new(&tenant.id, workload.id, name, &tenant.subnet, ip);
        instance.cnci = workload.cnci;

        let mut ledger = CleanupLedger::default();
        match self
            .compose_instance(&mut ledger, tenant, workload, request, &instance)
            .await
        {
            Ok(attachments) => Ok((instance, attachments)),
            Err(e) => {
                self.clean(&tenant.id, ip, workload.cnci, ledger).await;
                Err(e)
            }
        }
    }

    async fn compose_instance(
        &self,
        ledger: &mut CleanupLedger,
        tenant: &Tenant,
        workload: &Workload,
        request: &StartRequest,
        instance: &Instance,
    ) -> Result<Vec<Attachment>> {
        let mut attachments = Vec::new();

        for resource in &workload.storage {
            let att = match resource.source {
                StorageSource::Volume => {
                    let volume_id = Uuid::parse_str(&resource.source_id).map_err(|_| {
                        CoreError::BadRequest(format!(
                            "storage source {:?} is not a volume id",
                            resource.source_id
                        ))
                    })?;
                    self.attach_existing(ledger, tenant, instance, volume_id, resource.bootable)
                        .await?
                }
                _ => self.create_device(ledger, tenant, instance, resource).await?,
            };
            attachments.push(att);
        }

        for volume_id in &request.volumes {
            let att = self
                .attach_existing(ledger, tenant, instance, *volume_id, false)
                .await?;
            attachments.push(att);
        }

        if !workload.cnci {
            let mut demand = vec![ResourceRequest::new(ResourceKind::Instances, 1)];
            for kind in [ResourceKind::VCpus, ResourceKind::MemMb, ResourceKind::DiskMb] {
                let value = workload.requested(kind);
                if value > 0 {
                    demand.push(ResourceRequest::new(kind, value));
                }
            }

            let outcome = self
                .quota
                .consume(&tenant.id, &demand)
                .await
                .map_err(|_| CoreError::Fatal("quota engine unavailable".into()))?;
            ledger.quota = Some(outcome.resources().to_vec());
            if !outcome.allowed() {
                let kinds: Vec<String> =
                    outcome.overrun().iter().map(|k| k.to_string()).collect();
                return Err(CoreError::QuotaExceeded(kinds.join(", ")));
            }
        }

        self.store.add_instance(instance).await?;
        Ok(attachments)
    }

    /// Attach an already-existing, available, tenant-owned volume.
    async fn attach_existing(
        &self,
        ledger: &mut CleanupLedger,
        tenant: &Tenant,
        instance: &Instance,
        volume_id: Uuid,
        boot: bool,
    ) -> Result<Attachment> {
        let vol = self.store.get_volume(volume_id).await?;
        if vol.tenant_id != tenant.id {
            return Err(CoreError::ownership("volume", volume_id));
        }
        if vol.state != VolumeState::Available {
            return Err(CoreError::Precondition(format!(
                "volume {volume_id} is {}, must be available",
                vol.state
            )));
        }

        // Boot-time attachments are materialised by the START itself, so
        // the device is in use as soon as the instance exists.
        self.store
            .set_volume_state(volume_id, VolumeState::Attaching)
            .await?;
        self.store
            .set_volume_state(volume_id, VolumeState::InUse)
            .await?;
        ledger.borrowed_volumes.push(volume_id);

        let att = self
            .store
            .create_attachment(instance.id, volume_id, boot, false)
            .await?;
        ledger.attachments.push(att.id);
        Ok(att)
    }

    /// Create a per-instance device from a workload storage declaration.
    async fn create_device(
        &self,
        ledger: &mut CleanupLedger,
        tenant: &Tenant,
        instance: &Instance,
        resource: &StorageResource,
    ) -> Result<Attachment> {
        let vol = BlockDevice::new(
            &tenant.id,
            "",
            resource.size_gb,
            resource.bootable,
            resource.ephemeral,
        );

        match resource.source {
            StorageSource::Empty => self.block.create(vol.id, resource.size_gb).await?,
            StorageSource::Image => {
                self.block
                    .create_from_image(vol.id, &resource.source_id)
                    .await?
            }
            StorageSource::Snapshot => {
                self.block
                    .create_from_snapshot(vol.id, &resource.source_id)
                    .await?
            }
            // Handled by attach_existing.
            StorageSource::Volume => {
                return Err(CoreError::BadRequest(
                    "volume-sourced storage is attached, not created".into(),
                ));
            }
        }
        ledger.created_volumes.push(vol.id);

        self.store.add_volume(&vol).await?;
        self.store
            .set_volume_state(vol.id, VolumeState::Attaching)
            .await?;
        self.store.set_volume_state(vol.id, VolumeState::InUse).await?;

        let att = self
            .store
            .create_attachment(instance.id, vol.id, resource.bootable, resource.ephemeral)
            .await?;
        ledger.attachments.push(att.id);
        Ok(att)
    }

    /// Undo a partially built instance: quota echo, attachments, devices,
    /// private IP. Best-effort; leftovers are logged, not propagated.
    async fn clean(&self, tenant_id: &str, ip: Ipv4Addr, cnci: bool, ledger: CleanupLedger) {
        if let Some(echo) = ledger.quota {
            self.quota.release(tenant_id, &echo);
        }
        for att_id in ledger.attachments {
            if let Err(e) = self.store.delete_attachment(att_id).await {
                warn!(attachment = %att_id, error = %e, "rollback left an attachment");
            }
        }
        for vol_id in ledger.created_volumes {
            if let Err(e) = self.block.delete(vol_id).await {
                warn!(volume = %vol_id, error = %e, "rollback left a backend device");
            }
            if let Err(e) = self.store.delete_volume(vol_id).await {
                warn!(volume = %vol_id, error = %e, "rollback left a volume row");
            }
        }
        for vol_id in ledger.borrowed_volumes {
            let detach = self
                .store
                .set_volume_state(vol_id, VolumeState::Detaching)
                .await;
            let avail = self
                .store
                .set_volume_state(vol_id, VolumeState::Available)
                .await;
            if detach.is_err() || avail.is_err() {
                warn!(volume = %vol_id, "rollback could not free a borrowed volume");
            }
        }
        if !cnci {
            if let Err(e) = self.store.release_tenant_ip(tenant_id, ip).await {
                warn!(tenant = %tenant_id, error = %e, "rollback left a private IP");
            }
        }
    }

    // ------------------------------------------------------------------
    // Tenant confirmation
    // ------------------------------------------------------------------

    /// Block until the tenant can host workloads: the tenant row exists
    /// and, unless networking is disabled, its network appliance has
    /// reported an address. Concurrent callers share one in-flight
    /// confirmation; at most one appliance launch is ever in flight per
    /// tenant.
    pub async fn confirm_tenant(&self, tenant_id: &str) -> Result<()> {
        match self.readiness.claim(tenant_id) {
            Claim::Waiter(ticket) => ticket.wait().await,
            Claim::Owner(token) => {
                let outcome = self.bootstrap_tenant(tenant_id).await;
                let result = outcome.clone();
                self.readiness.finish(token, outcome);
                result
            }
        }
    }

    /// The unsynchronised bootstrap body, run by the single memo owner.
    async fn bootstrap_tenant(&self, tenant_id: &str) -> Result<()> {
        if self.store.get_tenant(tenant_id).await.is_none() {
            self.store.add_tenant(tenant_id, tenant_id).await?;
            info!(tenant = %tenant_id, "tenant created on first workload request");
        }
        if self.config.no_network {
            return Ok(());
        }

        let tenant = self
            .store
            .get_tenant(tenant_id)
            .await
            .ok_or_else(|| CoreError::Fatal(format!("tenant {tenant_id} vanished")))?;
        if tenant.appliance_ready() {
            return Ok(());
        }

        let workload = self.ensure_appliance_workload().await?;

        // Register before the START goes out so the ready event cannot
        // race the registration.
        let ready = self.readiness.register_appliance_wait(tenant_id);

        let launched = Box::pin(self.start_workload(StartRequest {
            tenant_id: tenant_id.to_string(),
            workload_id: workload.id,
            instances: 1,
            volumes: Vec::new(),
            name: Some(format!("cnci-{tenant_id}")),
            trace_label: None,
        }))
        .await?;
        if launched.instances.is_empty() {
            return Err(launched.error.unwrap_or_else(|| {
                CoreError::Transient(format!("appliance launch failed for tenant {tenant_id}"))
            }));
        }

        match tokio::time::timeout(APPLIANCE_READY_TIMEOUT, ready).await {
            Ok(Ok(payload)) => {
                info!(tenant = %tenant_id, ip = %payload.ip, "tenant appliance ready");
            }
            Ok(Err(_)) => {
                return Err(CoreError::Transient(format!(
                    "appliance wait for tenant {tenant_id} was cancelled"
                )));
            }
            Err(_) => {
                return Err(CoreError::Transient(format!(
                    "timed out waiting for tenant {tenant_id} appliance"
                )));
            }
        }

        let tenant = self
            .store
            .get_tenant(tenant_id)
            .await
            .ok_or_else(|| CoreError::Fatal(format!("tenant {tenant_id} vanished")))?;
        if !tenant.appliance_ready() {
            return Err(CoreError::Transient(format!(
                "tenant {tenant_id} appliance reported no address"
            )));
        }
        Ok(())
    }

    /// The registered appliance template, or a synthesised one sized
    /// from the controller configuration.
    async fn ensure_appliance_workload(&self) -> Result<Workload> {
        if let Some(workload) = self.store.appliance_workload().await {
            return Ok(workload);
        }
        let workload = Workload {
            id: Uuid::new_v4(),
            tenant_id: None,
            description: "tenant network appliance".into(),
            vm_type: VmType::FullVm,
            firmware: Firmware::Legacy,
            image_id: "cnci".into(),
            image_name: String::new(),
            storage: vec![StorageResource {
                source: StorageSource::Image,
                source_id: "cnci".into(),
                bootable: true,
                ephemeral: true,
                size_gb: 0,
            }],
            defaults: vec![
                ResourceRequest::new(ResourceKind::VCpus, self.config.appliance_vcpus),
                ResourceRequest::new(ResourceKind::MemMb, self.config.appliance_mem_mb),
                ResourceRequest::new(ResourceKind::DiskMb, self.config.appliance_disk_mb),
            ],
            config: String::new(),
            cnci: true,
        };
        self.store.add_workload(workload).await
    }

    // ------------------------------------------------------------------
    // Instance lifecycle verbs
    // ------------------------------------------------------------------

    /// Ask the node to stop a running instance.
    pub async fn stop_instance(&self, tenant_id: &str, instance_id: Uuid) -> Result<()> {
        let instance = self.owned_instance(tenant_id, instance_id).await?;
        if !instance.assigned() {
            return Err(CoreError::Precondition(format!(
                "instance {instance_id} is not assigned to a node"
            )));
        }
        if instance.state == InstanceState::Pending {
            return Err(CoreError::Precondition(format!(
                "instance {instance_id} is pending and cannot be stopped"
            )));
        }
        self.node.stop_instance(instance_id, &instance.node_id).await
    }

    /// Re-issue a full START for an exited instance. The instance may
    /// have been evicted from its node, so the frame carries everything
    /// needed to re-materialise it.
    pub async fn restart_instance(&self, tenant_id: &str, instance_id: Uuid) -> Result<()> {
        let instance = self.owned_instance(tenant_id, instance_id).await?;
        let instance = self.store.restart_instance(instance.id).await?;
        let workload = self
            .store
            .get_workload(&instance.tenant_id, instance.workload_id)
            .await?;
        let tenant = self
            .store
            .get_tenant(&instance.tenant_id)
            .await
            .ok_or_else(|| CoreError::not_found("tenant", &instance.tenant_id))?;
        let attachments = self.store.attachments_for_instance(instance.id).await;
        self.node
            .restart_instance(&instance, &workload, &tenant, &attachments)
            .await
    }

    /// Delete an instance. Refused while any external IP maps to it. The
    /// record itself is removed when the node confirms, except for an
    /// instance no node ever claimed, which is torn down directly.
    pub async fn delete_instance(&self, tenant_id: &str, instance_id: Uuid) -> Result<()> {
        let instance = self.owned_instance(tenant_id, instance_id).await?;

        if !self.store.mappings_for_instance(instance_id).await.is_empty() {
            return Err(CoreError::ResourceBusy(format!(
                "instance {instance_id} has mapped external addresses"
            )));
        }

        if !instance.assigned() {
            if instance.state == InstanceState::Pending {
                return Err(CoreError::Precondition(format!(
                    "instance {instance_id} is not assigned to a node"
                )));
            }
            // No node holds this instance, so no DELETE can be confirmed;
            // remove it here instead of waiting for an ack that never comes.
            events::teardown_instance(
                &self.store,
                &self.quota,
                self.block.as_ref(),
                &self.readiness,
                &instance,
            )
            .await?;
            return Ok(());
        }

        self.node.delete_instance(instance_id, &instance.node_id).await
    }

    /// Ask the scheduler to move every instance off a node.
    pub async fn evacuate_node(&self, node_id: &str) -> Result<()> {
        self.node.evacuate_node(node_id).await
    }

    pub(crate) async fn owned_instance(
        &self,
        tenant_id: &str,
        instance_id: Uuid,
    ) -> Result<Instance> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.tenant_id != tenant_id {
            return Err(CoreError::ownership("instance", instance_id));
        }
        Ok(instance)
    }
}
