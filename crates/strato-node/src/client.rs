use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use strato_core::error::{CoreError, Result};
use strato_core::frame::{Command, Frame};
use strato_core::instance::Instance;
use strato_core::payloads::{
    EvacuatePayload, InstanceCommandPayload, PublicIpPayload, StartPayload, StorageEntry,
    VolumeCommandPayload,
};
use strato_core::pool::MappedIp;
use strato_core::tenant::Tenant;
use strato_core::volume::Attachment;
use strato_core::workload::Workload;

use crate::transport::NodeTransport;

/// Depth of the outbound frame queue. Verbs block briefly when the queue
/// is full rather than dropping frames.
const SEND_QUEUE_DEPTH: usize = 256;

/// Assemble the full START description for an instance. Restarts reuse
/// this with `restart = true`: a stopped instance may have been evicted
/// from its node, so the frame re-carries the original MAC, vnic uuid,
/// subnet, private IP, appliance coordinates, and the attachments in
/// their declared order.
pub fn build_start_payload(
    instance: &Instance,
    workload: &Workload,
    tenant: &Tenant,
    attachments: &[Attachment],
    restart: bool,
) -> StartPayload {
    StartPayload {
        instance_id: instance.id,
        tenant_id: instance.tenant_id.clone(),
        workload_id: workload.id,
        vm_type: workload.vm_type,
        firmware: workload.firmware,
        image_id: workload.image_id.clone(),
        image_name: workload.image_name.clone(),
        requested: workload.defaults.clone(),
        private_ip: instance.private_ip,
        mac: instance.mac.clone(),
        vnic_id: instance.vnic_id,
        subnet: instance.subnet.clone(),
        concentrator_id: tenant.appliance_instance_id.clone(),
        concentrator_ip: tenant.appliance_ip.clone(),
        storage: attachments
            .iter()
            .map(|a| StorageEntry {
                block_id: a.block_id,
                boot: a.boot,
                ephemeral: a.ephemeral,
            })
            .collect(),
        restart,
        config: workload.config.clone(),
        trace_label: None,
        started_at: None,
    }
}

/// Handle to the single duplex node-bus session.
///
/// Sending is fire-and-forget: every verb returns once its frame is on
/// the bounded send queue; a writer task drains the queue in FIFO order.
/// A queued command cannot be retracted; recovery happens by acting on
/// the subsequent failure or stats frame. Inbound frames are forwarded
/// to the event handler channel by a reader task.
#[derive(Clone)]
pub struct NodeClient {
    send_tx: mpsc::Sender<Frame>,
    shutdown: watch::Sender<bool>,
}

impl NodeClient {
    /// Spawn the writer and reader tasks over `transport`. Inbound frames
    /// land on `inbound`, in arrival order.
    pub fn start(transport: Arc<dyn NodeTransport>, inbound: mpsc::Sender<Frame>) -> Self {
        let (send_tx, mut send_rx) = mpsc::channel::<Frame>(SEND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let writer_transport = Arc::clone(&transport);
        let mut writer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = send_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = writer_transport.send(&frame).await {
                            // The command is lost; the fleet reports the
                            // consequences through failure/stats frames.
                            warn!(error = %e, "node send failed");
                        }
                    }
                    _ = writer_shutdown.changed() => break,
                }
            }
            debug!("node writer stopped");
        });

        let mut reader_shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = transport.recv() => {
                        match frame {
                            Ok(frame) => {
                                if inbound.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "node session lost");
                                break;
                            }
                        }
                    }
                    _ = reader_shutdown.changed() => break,
                }
            }
            debug!("node reader stopped");
        });

        Self {
            send_tx,
            shutdown: shutdown_tx,
        }
    }

    async fn enqueue(&self, frame: Frame) -> Result<()> {
        self.send_tx
            .send(frame)
            .await
            .map_err(|_| CoreError::Transient("node session closed".into()))
    }

    pub async fn start_workload(&self, payload: StartPayload) -> Result<()> {
        self.enqueue(Frame::Command(Command::Start(payload))).await
    }

    /// START variant stamped for boot-time tracing.
    pub async fn start_traced_workload(
        &self,
        mut payload: StartPayload,
        started_at: DateTime<Utc>,
        label: &str,
    ) -> Result<()> {
        payload.trace_label = Some(label.to_string());
        payload.started_at = Some(started_at);
        self.enqueue(Frame::Command(Command::Start(payload))).await
    }

    pub async fn stop_instance(&self, instance_id: Uuid, node_id: &str) -> Result<()> {
        self.enqueue(Frame::Command(Command::Stop(InstanceCommandPayload {
            instance_id,
            node_id: node_id.to_string(),
        })))
        .await
    }

    pub async fn delete_instance(&self, instance_id: Uuid, node_id: &str) -> Result<()> {
        self.enqueue(Frame::Command(Command::Delete(InstanceCommandPayload {
            instance_id,
            node_id: node_id.to_string(),
        })))
        .await
    }

    /// Re-issue a full START for an exited instance.
    pub async fn restart_instance(
        &self,
        instance: &Instance,
        workload: &Workload,
        tenant: &Tenant,
        attachments: &[Attachment],
    ) -> Result<()> {
        let payload = build_start_payload(instance, workload, tenant, attachments, true);
        self.enqueue(Frame::Command(Command::Restart(payload))).await
    }

    pub async fn evacuate_node(&self, node_id: &str) -> Result<()> {
        self.enqueue(Frame::Command(Command::Evacuate(EvacuatePayload {
            node_id: node_id.to_string(),
        })))
        .await
    }

    pub async fn attach_volume(
        &self,
        volume_id: Uuid,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<()> {
        self.enqueue(Frame::Command(Command::AttachVolume(VolumeCommandPayload {
            volume_id,
            instance_id,
            node_id: node_id.to_string(),
        })))
        .await
    }

    pub async fn detach_volume(
        &self,
        volume_id: Uuid,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<()> {
        self.enqueue(Frame::Command(Command::DetachVolume(VolumeCommandPayload {
            volume_id,
            instance_id,
            node_id: node_id.to_string(),
        })))
        .await
    }

    /// Ask the tenant's network appliance to install a NAT mapping.
    pub async fn map_external_ip(&self, mapping: &MappedIp) -> Result<()> {
        self.enqueue(Frame::Command(Command::AssignPublicIp(PublicIpPayload {
            tenant_id: mapping.tenant_id.clone(),
            instance_id: mapping.instance_id,
            external_ip: mapping.external_ip.clone(),
            internal_ip: mapping.internal_ip.clone(),
        })))
        .await
    }

    pub async fn unmap_external_ip(&self, mapping: &MappedIp) -> Result<()> {
        self.enqueue(Frame::Command(Command::ReleasePublicIp(PublicIpPayload {
            tenant_id: mapping.tenant_id.clone(),
            instance_id: mapping.instance_id,
            external_ip: mapping.external_ip.clone(),
            internal_ip: mapping.internal_ip.clone(),
        })))
        .await
    }

    /// Stop both session tasks. Queued frames not yet written are lost,
    /// as they would be on a dropped connection.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }
}
