//! Single-threaded dispatcher over inbound node-bus frames.
//!
//! Every frame mutates the data model and quotas exactly as the
//! asynchronous half of the verb contracts requires. The original API
//! callers have long since returned, so failures here are recovered
//! locally: state reverts plus an event-log entry, never a propagated
//! error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use strato_core::error::{CoreError, Result};
use strato_core::frame::{Command, Event, Frame, FrameKind, NodeError};
use strato_core::instance::Instance;
use strato_core::resources::{ResourceKind, ResourceRequest};
use strato_quota::QuotaEngine;
use strato_store::{BlockDriver, Datastore, LogKind};

use crate::readiness::TenantReadiness;

/// Release an instance's quota, ephemeral storage, row, and private IP.
/// Shared by InstanceDeleted, fatal start failures, and deletion of
/// instances no node ever claimed. Appliance instances release no tenant
/// quota and instead invalidate the tenant's readiness memo.
pub(crate) async fn teardown_instance(
    store: &Datastore,
    quota: &QuotaEngine,
    block: &dyn BlockDriver,
    readiness: &TenantReadiness,
    instance: &Instance,
) -> Result<()> {
    if !instance.cnci {
        let mut release = vec![ResourceRequest::new(ResourceKind::Instances, 1)];
        match store
            .get_workload(&instance.tenant_id, instance.workload_id)
            .await
        {
            Ok(workload) => {
                for kind in [ResourceKind::VCpus, ResourceKind::MemMb, ResourceKind::DiskMb] {
                    let value = workload.requested(kind);
                    if value > 0 {
                        release.push(ResourceRequest::new(kind, value));
                    }
                }
            }
            Err(e) => {
                warn!(instance = %instance.id, error = %e,
                      "workload gone, releasing instance count only");
            }
        }
        quota.release(&instance.tenant_id, &release);
    }

    for att in store.attachments_for_instance(instance.id).await {
        if att.ephemeral {
            if let Err(e) = block.delete(att.block_id).await {
                warn!(volume = %att.block_id, error = %e, "backend device not deleted");
            }
            if let Err(e) = store.delete_volume(att.block_id).await {
                warn!(volume = %att.block_id, error = %e, "volume row not deleted");
            }
        } else {
            // Durable devices outlive the instance and become available
            // again.
            let _ = store
                .set_volume_state(att.block_id, strato_core::volume::VolumeState::Detaching)
                .await;
            let _ = store
                .set_volume_state(att.block_id, strato_core::volume::VolumeState::Available)
                .await;
        }
    }

    store.delete_instance(instance.id).await?;

    if instance.cnci {
        let _ = store.clear_tenant_appliance(&instance.tenant_id).await;
        readiness.invalidate(&instance.tenant_id);
    }
    Ok(())
}

/// Consumes node-originated frames, one at a time, and correlates them
/// back to entity state machines. Also hosts the typed reply router:
/// code that wants to await a frame of a given kind registers a one-shot
/// listener; each dispatch emits the frame to every registered listener
/// and discards the registrations.
pub struct EventHandler {
    store: Arc<Datastore>,
    quota: QuotaEngine,
    block: Arc<dyn BlockDriver>,
    readiness: Arc<TenantReadiness>,
    listeners: Mutex<HashMap<FrameKind, Vec<oneshot::Sender<Frame>>>>,
}

impl EventHandler {
    pub fn new(
        store: Arc<Datastore>,
        quota: QuotaEngine,
        block: Arc<dyn BlockDriver>,
        readiness: Arc<TenantReadiness>,
    ) -> Self {
        Self {
            store,
            quota,
            block,
            readiness,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Await the next frame of `kind`. The registration is consumed by
    /// the first matching dispatch.
    pub fn subscribe(&self, kind: FrameKind) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.listeners.lock().unwrap().entry(kind).or_default().push(tx);
        rx
    }

    /// Drain the inbound channel until it closes. Frames are handled
    /// strictly in order; state machines tolerate reorder across frames
    /// that raced on the wire.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            self.handle_frame(frame).await;
        }
        debug!("event handler stopped");
    }

    pub async fn handle_frame(&self, frame: Frame) {
        if let Err(e) = self.dispatch(&frame).await {
            warn!(kind = ?frame.kind(), error = %e, "event not applied");
        }
        self.notify(&frame);
    }

    fn notify(&self, frame: &Frame) {
        if let Some(list) = self.listeners.lock().unwrap().remove(&frame.kind()) {
            for tx in list {
                let _ = tx.send(frame.clone());
            }
        }
    }

    async fn dispatch(&self, frame: &Frame) -> Result<()> {
        match frame {
            Frame::Command(cmd) => self.dispatch_command(cmd).await,
            Frame::Event(event) => self.dispatch_event(event).await,
            Frame::Error(error) => self.dispatch_error(error).await,
        }
    }

    async fn dispatch_command(&self, cmd: &Command) -> Result<()> {
        match cmd {
            Command::Stats(stats) => self.store.handle_stats(stats).await,
            Command::Configure(_) => {
                // Configuration is a constructor-time value; a mid-run
                // CONFIGURE cannot be applied.
                self.store
                    .events()
                    .append(
                        None,
                        LogKind::Warn,
                        "CONFIGURE received; configuration is fixed at startup",
                    )
                    .await
            }
            other => {
                warn!(kind = ?Frame::Command(other.clone()).kind(),
                      "unexpected inbound command");
                Ok(())
            }
        }
    }

    async fn dispatch_event(&self, event: &Event) -> Result<()> {
        match event {
            Event::NodeConnected(p) => {
                self.store.transient().node_connected(&p.node_id, p.role);
                self.store
                    .events()
                    .append(None, LogKind::Info, format!("node {} connected", p.node_id))
                    .await
            }
            Event::NodeDisconnected(p) => {
                self.store.transient().node_disconnected(&p.node_id);
                self.store
                    .events()
                    .append(None, LogKind::Warn, format!("node {} disconnected", p.node_id))
                    .await
            }
            Event::InstanceDeleted(p) => {
                match self.store.get_instance(p.instance_id).await {
                    Ok(instance) => {
                        teardown_instance(
                            &self.store,
                            &self.quota,
                            self.block.as_ref(),
                            &self.readiness,
                            &instance,
                        )
                        .await
                    }
                    // A second ack for a retried DELETE is a no-op.
                    Err(CoreError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Event::InstanceStopped(p) => match self.store.instance_exited(p.instance_id).await {
                Ok(()) => Ok(()),
                Err(CoreError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },
            Event::ConcentratorInstanceAdded(p) => {
                self.store
                    .set_tenant_appliance(&p.tenant_id, p.instance_id, &p.ip, &p.mac)
                    .await?;
                self.readiness.appliance_ready(p);
                info!(tenant = %p.tenant_id, ip = %p.ip, "tenant appliance reported ready");
                Ok(())
            }
            Event::TraceReport(p) => {
                self.store.handle_trace_report(p);
                Ok(())
            }
            Event::PublicIpAssigned(p) => {
                self.store
                    .events()
                    .append(
                        Some(&p.tenant_id),
                        LogKind::Info,
                        format!("mapped {} -> {}", p.external_ip, p.internal_ip),
                    )
                    .await
            }
            Event::PublicIpUnassigned(p) => {
                match self.store.unmap_external_ip(&p.external_ip).await {
                    Ok(mapping) => {
                        self.quota.release(
                            &mapping.tenant_id,
                            &[ResourceRequest::new(ResourceKind::ExternalIps, 1)],
                        );
                    }
                    Err(CoreError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                self.store
                    .events()
                    .append(
                        Some(&p.tenant_id),
                        LogKind::Info,
                        format!("unmapped {}", p.external_ip),
                    )
                    .await
            }
            Event::TenantAdded(p) => {
                self.store
                    .events()
                    .append(
                        Some(&p.tenant_id),
                        LogKind::Info,
                        format!("tenant subnet {} reported on {}", p.subnet, p.agent_ip),
                    )
                    .await
            }
            Event::TenantRemoved(p) => {
                self.store
                    .events()
                    .append(
                        Some(&p.tenant_id),
                        LogKind::Info,
                        format!("tenant subnet {} removed from {}", p.subnet, p.agent_ip),
                    )
                    .await
            }
        }
    }

    async fn dispatch_error(&self, error: &NodeError) -> Result<()> {
        match error {
            NodeError::StartFailure(p) => {
                self.store
                    .start_failure(p.instance_id, p.reason, p.restart)
                    .await?;
                // A failed restart leaves the exited instance in place;
                // a transient failure leaves the pending instance for
                // rescheduling.
                if p.reason.is_fatal() && !p.restart {
                    if let Ok(instance) = self.store.get_instance(p.instance_id).await {
                        teardown_instance(
                            &self.store,
                            &self.quota,
                            self.block.as_ref(),
                            &self.readiness,
                            &instance,
                        )
                        .await?;
                    }
                }
                Ok(())
            }
            NodeError::StopFailure(p) => self.store.stop_failure(p.instance_id, p.reason).await,
            NodeError::RestartFailure(p) => {
                self.store.restart_failure(p.instance_id, p.reason).await
            }
            NodeError::DeleteFailure(p) => {
                self.store
                    .events()
                    .append(
                        None,
                        LogKind::Error,
                        format!("delete of instance {} failed: {}", p.instance_id, p.reason),
                    )
                    .await
            }
            NodeError::AttachVolumeFailure(p) => {
                self.store
                    .attach_volume_failure(p.instance_id, p.volume_id, &p.reason)
                    .await
            }
            NodeError::DetachVolumeFailure(p) => {
                self.store
                    .detach_volume_failure(p.instance_id, p.volume_id, &p.reason)
                    .await
            }
            NodeError::AssignPublicIpFailure(p) => {
                match self.store.unmap_external_ip(&p.external_ip).await {
                    Ok(mapping) => {
                        self.quota.release(
                            &mapping.tenant_id,
                            &[ResourceRequest::new(ResourceKind::ExternalIps, 1)],
                        );
                    }
                    Err(CoreError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                self.store
                    .events()
                    .append(
                        Some(&p.tenant_id),
                        LogKind::Error,
                        format!("assign of {} failed: {}", p.external_ip, p.reason),
                    )
                    .await
            }
            NodeError::UnassignPublicIpFailure(p) => {
                // The NAT state on the appliance is unknown; all we can
                // do is record it.
                self.store
                    .events()
                    .append(
                        Some(&p.tenant_id),
                        LogKind::Error,
                        format!("unassign of {} failed: {}", p.external_ip, p.reason),
                    )
                    .await
            }
        }
    }
}
