//! End-to-end controller scenarios over the in-memory node transport and
//! a tempdir-backed datastore.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;
use uuid::Uuid;

use strato_controller::{Controller, EventHandler, StartRequest, build};
use strato_core::config::CoreConfig;
use strato_core::error::CoreError;
use strato_core::frame::{Command, Event, Frame, FrameKind, NodeError};
use strato_core::instance::InstanceState;
use strato_core::payloads::{
    ConcentratorPayload, FailureReason, InstanceEventPayload, InstanceStat, StartFailurePayload,
    StatsPayload, VolumeFailurePayload,
};
use strato_core::resources::{ResourceKind, ResourceRequest};
use strato_core::volume::{BlockDevice, VolumeState};
use strato_core::workload::{Firmware, StorageResource, StorageSource, VmType, Workload};
use strato_node::{ChannelTransport, PeerHandle};
use strato_store::{BlockDriver, Datastore, LocalBlockDriver};

/// In-process waits on node replies use the conventional 25s bound.
const WAIT: Duration = Duration::from_secs(25);

struct Harness {
    controller: Arc<Controller>,
    events: Arc<EventHandler>,
    peer: PeerHandle,
    store: Arc<Datastore>,
    block: Arc<LocalBlockDriver>,
    _tmp: TempDir,
}

async fn harness(no_network: bool) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = CoreConfig::default();
    config.database.persistent = tmp.path().join("data");
    config.workloads_path = tmp.path().join("workloads");
    config.tables_init_path = tmp.path().join("tables");
    config.no_network = no_network;

    let store = Arc::new(Datastore::open(&config.database.persistent).unwrap());
    let block = Arc::new(LocalBlockDriver::new());
    let driver: Arc<dyn BlockDriver> = Arc::clone(&block) as Arc<dyn BlockDriver>;
    let (transport, peer) = ChannelTransport::pair();

    let (controller, events) = build(config, Arc::clone(&store), driver, Arc::new(transport));
    controller.initialize().await.unwrap();

    Harness {
        controller,
        events,
        peer,
        store,
        block,
        _tmp: tmp,
    }
}

fn web_workload() -> Workload {
    Workload {
        id: Uuid::new_v4(),
        tenant_id: None,
        description: "general purpose web server".into(),
        vm_type: VmType::FullVm,
        firmware: Firmware::Efi,
        image_id: "img-web".into(),
        image_name: String::new(),
        storage: vec![StorageResource {
            source: StorageSource::Image,
            source_id: "img-web".into(),
            bootable: true,
            ephemeral: true,
            size_gb: 0,
        }],
        defaults: vec![
            ResourceRequest::new(ResourceKind::VCpus, 2),
            ResourceRequest::new(ResourceKind::MemMb, 4096),
        ],
        config: "cpus = 2".into(),
        cnci: false,
    }
}

fn start_request(tenant: &str, workload: Uuid, instances: usize) -> StartRequest {
    StartRequest {
        tenant_id: tenant.to_string(),
        workload_id: workload,
        instances,
        volumes: Vec::new(),
        name: Some("web".into()),
        trace_label: None,
    }
}

async fn next_frame(peer: &mut PeerHandle) -> Frame {
    timeout(WAIT, peer.from_controller.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("peer channel closed")
}

fn assert_no_frame(peer: &mut PeerHandle) {
    assert!(
        peer.from_controller.try_recv().is_err(),
        "unexpected frame queued"
    );
}

/// Report an instance running on a node, and wait until the stats frame
/// has been applied.
async fn report_running(h: &mut Harness, instance_id: Uuid, node_id: &str) {
    let seen = h.events.subscribe(FrameKind::Stats);
    h.peer
        .to_controller
        .send(Frame::Command(Command::Stats(StatsPayload {
            node_id: node_id.to_string(),
            load: 1,
            mem_total_mb: 32768,
            mem_available_mb: 16384,
            disk_total_mb: 500_000,
            disk_available_mb: 400_000,
            instances: vec![InstanceStat {
                instance_id,
                state: InstanceState::Running,
                memory_usage_mb: 512,
                disk_usage_mb: 1024,
                cpu_usage: 10,
            }],
        })))
        .unwrap();
    timeout(WAIT, seen).await.unwrap().unwrap();
}

async fn quota_usage(controller: &Controller, tenant: &str, kind: ResourceKind) -> i64 {
    controller
        .dump_quotas(tenant)
        .await
        .into_iter()
        .find(|d| d.kind == kind)
        .map(|d| d.usage)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------
// Scenario 1: single start
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_single_start_creates_instance_quota_and_one_frame() {
    let mut h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();

    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    assert!(result.error.is_none());
    assert_eq!(result.instances.len(), 1);

    let instance = &result.instances[0];
    assert_eq!(instance.state, InstanceState::Pending);
    assert_eq!(instance.name, "web");
    assert!(!instance.assigned());

    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::Instances).await, 1);
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::VCpus).await, 2);
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::MemMb).await, 4096);

    let frame = next_frame(&mut h.peer).await;
    let Frame::Command(Command::Start(payload)) = frame else {
        panic!("expected a START frame");
    };
    assert_eq!(payload.instance_id, instance.id);
    assert_eq!(payload.tenant_id, "acme");
    assert_eq!(payload.workload_id, w.id);
    assert_eq!(payload.config, "cpus = 2");
    assert!(!payload.restart);
    assert_eq!(payload.storage.len(), 1);
    assert!(payload.storage[0].boot);
    assert_no_frame(&mut h.peer);

    // The composed boot device exists in the backend.
    assert_eq!(h.block.device_count(), 1);
}

// ----------------------------------------------------------------------
// Scenario 2: quota rejection with partial success
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_quota_rejection_allows_partial_success() {
    let h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();
    h.controller
        .update_tenant_limits("acme", vec![ResourceRequest::new(ResourceKind::Instances, 1)])
        .await
        .unwrap();

    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 2))
        .await
        .unwrap();
    assert_eq!(result.instances.len(), 1);
    assert!(matches!(result.error, Some(CoreError::QuotaExceeded(_))));
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::Instances).await, 1);

    // The rolled-back second instance left nothing behind.
    assert_eq!(h.store.instances_for_tenant("acme").await.len(), 1);
    assert_eq!(h.block.device_count(), 1);
}

// ----------------------------------------------------------------------
// Scenario 3: mapped instances cannot be deleted
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_mapped_instance_delete_is_refused() {
    let mut h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();

    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    let instance = result.instances[0].clone();
    report_running(&mut h, instance.id, "node-1").await;

    h.controller.add_pool("public", &["198.51.100.7".into()]).await.unwrap();
    let mapping = h
        .controller
        .map_address("acme", Some("public"), instance.id)
        .await
        .unwrap();
    assert_eq!(mapping.external_ip, "198.51.100.7");

    let err = h.controller.delete_instance("acme", instance.id).await;
    assert!(matches!(err, Err(CoreError::ResourceBusy(_))));

    // START and AssignPublicIp went out; no DELETE may follow.
    assert_eq!(next_frame(&mut h.peer).await.kind(), FrameKind::Start);
    assert_eq!(next_frame(&mut h.peer).await.kind(), FrameKind::AssignPublicIp);
    assert_no_frame(&mut h.peer);

    // The instance is still there and still mapped.
    assert!(h.store.get_instance(instance.id).await.is_ok());
    assert_eq!(h.store.mappings_for_instance(instance.id).await.len(), 1);
}

// ----------------------------------------------------------------------
// Scenario 4: attach, then node-side failure
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_attach_failure_reverts_volume_and_quota() {
    let mut h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();

    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    let instance = result.instances[0].clone();
    report_running(&mut h, instance.id, "node-1").await;

    let vol = BlockDevice::new("acme", "data", 20, false, false);
    h.store.add_volume(&vol).await.unwrap();

    let quota_before = h.controller.dump_quotas("acme").await;
    h.controller
        .attach_volume("acme", vol.id, instance.id)
        .await
        .unwrap();
    assert_eq!(
        h.store.get_volume(vol.id).await.unwrap().state,
        VolumeState::Attaching
    );

    assert_eq!(next_frame(&mut h.peer).await.kind(), FrameKind::Start);
    assert_eq!(next_frame(&mut h.peer).await.kind(), FrameKind::AttachVolume);

    let reverted = h.events.subscribe(FrameKind::AttachVolumeFailure);
    h.peer
        .to_controller
        .send(Frame::Error(NodeError::AttachVolumeFailure(
            VolumeFailurePayload {
                instance_id: instance.id,
                volume_id: vol.id,
                node_id: "node-1".into(),
                reason: "no such device on node".into(),
            },
        )))
        .unwrap();
    timeout(WAIT, reverted).await.unwrap().unwrap();

    assert_eq!(
        h.store.get_volume(vol.id).await.unwrap().state,
        VolumeState::Available
    );
    assert!(h.store.attachment_for_volume(vol.id).await.is_none());

    let quota_after = h.controller.dump_quotas("acme").await;
    for (before, after) in quota_before.iter().zip(quota_after.iter()) {
        assert_eq!(before.usage, after.usage, "{} changed", before.kind);
    }
}

// ----------------------------------------------------------------------
// Scenario 5: concurrent tenant confirmation
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_confirm_launches_one_appliance() {
    let mut h = harness(false).await;

    let mut confirms = Vec::new();
    for _ in 0..10 {
        let controller = Arc::clone(&h.controller);
        confirms.push(tokio::spawn(async move {
            controller.confirm_tenant("acme").await
        }));
    }

    // Exactly one appliance START reaches the fleet.
    let frame = next_frame(&mut h.peer).await;
    let Frame::Command(Command::Start(payload)) = frame else {
        panic!("expected the appliance START");
    };
    assert_eq!(payload.tenant_id, "acme");

    h.peer
        .to_controller
        .send(Frame::Event(Event::ConcentratorInstanceAdded(
            ConcentratorPayload {
                instance_id: payload.instance_id,
                tenant_id: "acme".into(),
                ip: "172.16.0.2".into(),
                mac: "02:00:ac:10:00:02".into(),
                subnet: "172.16.0.0/24".into(),
            },
        )))
        .unwrap();

    for confirm in confirms {
        timeout(WAIT, confirm).await.unwrap().unwrap().unwrap();
    }
    assert_no_frame(&mut h.peer);

    let tenant = h.store.get_tenant("acme").await.unwrap();
    assert_eq!(tenant.appliance_ip, "172.16.0.2");
    assert_eq!(tenant.appliance_instance_id, payload.instance_id.to_string());

    // The appliance consumed no tenant quota.
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::Instances).await, 0);

    // A later confirmation is a memoised no-op.
    h.controller.confirm_tenant("acme").await.unwrap();
    assert_no_frame(&mut h.peer);
}

// ----------------------------------------------------------------------
// Scenario 6: crash recovery re-derives usage
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_crash_recovery_rederives_usage() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = CoreConfig::default();
    config.database.persistent = tmp.path().join("data");
    config.workloads_path = tmp.path().join("workloads");
    config.tables_init_path = tmp.path().join("tables");
    config.no_network = true;

    let workload_id;
    let volume_size = 20i64;
    {
        let store = Arc::new(Datastore::open(&config.database.persistent).unwrap());
        let block: Arc<dyn BlockDriver> = Arc::new(LocalBlockDriver::new());
        let (transport, mut peer) = ChannelTransport::pair();
        let (controller, events) =
            build(config.clone(), Arc::clone(&store), block, Arc::new(transport));
        controller.initialize().await.unwrap();

        let w = store.add_workload(web_workload()).await.unwrap();
        workload_id = w.id;

        let result = controller
            .start_workload(start_request("acme", w.id, 2))
            .await
            .unwrap();
        assert_eq!(result.instances.len(), 2);

        // Both instances report running before the crash.
        for inst in &result.instances {
            let seen = events.subscribe(FrameKind::Stats);
            peer.to_controller
                .send(Frame::Command(Command::Stats(StatsPayload {
                    node_id: "node-1".into(),
                    load: 0,
                    mem_total_mb: 0,
                    mem_available_mb: 0,
                    disk_total_mb: 0,
                    disk_available_mb: 0,
                    instances: vec![InstanceStat {
                        instance_id: inst.id,
                        state: InstanceState::Running,
                        memory_usage_mb: 0,
                        disk_usage_mb: 0,
                        cpu_usage: 0,
                    }],
                })))
                .unwrap();
            timeout(WAIT, seen).await.unwrap().unwrap();
        }

        let vol = BlockDevice::new("acme", "data", volume_size, false, false);
        store.add_volume(&vol).await.unwrap();
        controller.add_pool("public", &["198.51.100.7".into()]).await.unwrap();
        controller
            .map_address("acme", None, result.instances[0].id)
            .await
            .unwrap();

        controller.shutdown();
        // Simulated crash: everything is dropped without cleanup.
    }

    // The lock is released once the old store is fully dropped.
    let store = loop {
        match Datastore::open(&config.database.persistent) {
            Ok(store) => break Arc::new(store),
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };
    let block: Arc<dyn BlockDriver> = Arc::new(LocalBlockDriver::new());
    let (transport, _peer) = ChannelTransport::pair();
    let (controller, _events) = build(config, Arc::clone(&store), block, Arc::new(transport));
    controller.initialize().await.unwrap();

    let workload = store.get_workload("acme", workload_id).await.unwrap();
    let vcpus = workload.requested(ResourceKind::VCpus);
    let mem = workload.requested(ResourceKind::MemMb);

    assert_eq!(quota_usage(&controller, "acme", ResourceKind::Instances).await, 2);
    assert_eq!(quota_usage(&controller, "acme", ResourceKind::VCpus).await, 2 * vcpus);
    assert_eq!(quota_usage(&controller, "acme", ResourceKind::MemMb).await, 2 * mem);
    assert_eq!(quota_usage(&controller, "acme", ResourceKind::Volumes).await, 1);
    assert_eq!(
        quota_usage(&controller, "acme", ResourceKind::SharedDiskGb).await,
        volume_size
    );
    assert_eq!(quota_usage(&controller, "acme", ResourceKind::ExternalIps).await, 1);
}

// ----------------------------------------------------------------------
// Lifecycle verbs
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_pending_instance_cannot_be_stopped() {
    let h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();
    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    let instance = &result.instances[0];

    let err = h.controller.stop_instance("acme", instance.id).await;
    assert!(matches!(err, Err(CoreError::Precondition(_))));
}

#[tokio::test]
async fn test_stop_then_restart_reissues_full_start() {
    let mut h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();
    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    let instance = result.instances[0].clone();
    report_running(&mut h, instance.id, "node-1").await;

    // Restart of a running instance is refused.
    assert!(matches!(
        h.controller.restart_instance("acme", instance.id).await,
        Err(CoreError::Precondition(_))
    ));

    h.controller.stop_instance("acme", instance.id).await.unwrap();

    let stopped = h.events.subscribe(FrameKind::InstanceStopped);
    h.peer
        .to_controller
        .send(Frame::Event(Event::InstanceStopped(InstanceEventPayload {
            instance_id: instance.id,
            node_id: "node-1".into(),
        })))
        .unwrap();
    timeout(WAIT, stopped).await.unwrap().unwrap();
    assert_eq!(
        h.store.get_instance(instance.id).await.unwrap().state,
        InstanceState::Exited
    );

    h.controller.restart_instance("acme", instance.id).await.unwrap();

    assert_eq!(next_frame(&mut h.peer).await.kind(), FrameKind::Start);
    assert_eq!(next_frame(&mut h.peer).await.kind(), FrameKind::Stop);
    let frame = next_frame(&mut h.peer).await;
    let Frame::Command(Command::Restart(payload)) = frame else {
        panic!("expected a RESTART frame");
    };
    assert!(payload.restart);
    assert_eq!(payload.instance_id, instance.id);
    assert_eq!(payload.mac, instance.mac);
    assert_eq!(payload.private_ip, instance.private_ip);
    assert_eq!(payload.vnic_id, instance.vnic_id);
    assert_eq!(payload.subnet, instance.subnet);
    assert_eq!(payload.storage.len(), 1);
}

#[tokio::test]
async fn test_delete_running_instance_settles_on_node_ack() {
    let mut h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();
    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    let instance = result.instances[0].clone();
    report_running(&mut h, instance.id, "node-1").await;
    assert_eq!(h.block.device_count(), 1);

    h.controller.delete_instance("acme", instance.id).await.unwrap();
    // Still present until the node confirms.
    assert!(h.store.get_instance(instance.id).await.is_ok());

    let deleted = h.events.subscribe(FrameKind::InstanceDeleted);
    h.peer
        .to_controller
        .send(Frame::Event(Event::InstanceDeleted(InstanceEventPayload {
            instance_id: instance.id,
            node_id: "node-1".into(),
        })))
        .unwrap();
    timeout(WAIT, deleted).await.unwrap().unwrap();

    assert!(h.store.get_instance(instance.id).await.is_err());
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::Instances).await, 0);
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::VCpus).await, 0);
    // The ephemeral boot device died with the instance.
    assert_eq!(h.block.device_count(), 0);

    // A duplicate ack for a retried DELETE is a no-op.
    let dup = h.events.subscribe(FrameKind::InstanceDeleted);
    h.peer
        .to_controller
        .send(Frame::Event(Event::InstanceDeleted(InstanceEventPayload {
            instance_id: instance.id,
            node_id: "node-1".into(),
        })))
        .unwrap();
    timeout(WAIT, dup).await.unwrap().unwrap();
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::Instances).await, 0);
}

#[tokio::test]
async fn test_fatal_start_failure_tears_instance_down() {
    let mut h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();
    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    let instance = result.instances[0].clone();

    let failed = h.events.subscribe(FrameKind::StartFailure);
    h.peer
        .to_controller
        .send(Frame::Error(NodeError::StartFailure(StartFailurePayload {
            instance_id: instance.id,
            reason: FailureReason::LaunchFailed,
            restart: false,
        })))
        .unwrap();
    timeout(WAIT, failed).await.unwrap().unwrap();

    assert!(h.store.get_instance(instance.id).await.is_err());
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::Instances).await, 0);
    assert_eq!(h.block.device_count(), 0);
    assert!(!h.controller.list_events(Some("acme")).await.is_empty());
}

#[tokio::test]
async fn test_transient_start_failure_keeps_instance_pending() {
    let mut h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();
    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    let instance = result.instances[0].clone();

    let failed = h.events.subscribe(FrameKind::StartFailure);
    h.peer
        .to_controller
        .send(Frame::Error(NodeError::StartFailure(StartFailurePayload {
            instance_id: instance.id,
            reason: FailureReason::NoCapacity,
            restart: false,
        })))
        .unwrap();
    timeout(WAIT, failed).await.unwrap().unwrap();

    let kept = h.store.get_instance(instance.id).await.unwrap();
    assert_eq!(kept.state, InstanceState::Pending);
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::Instances).await, 1);
}

// ----------------------------------------------------------------------
// Deterministic MAC derivation (property MAC1)
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_allocated_ips_derive_macs_from_octets() {
    let h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();
    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 3))
        .await
        .unwrap();
    assert_eq!(result.instances.len(), 3);

    for instance in &result.instances {
        let o = instance.private_ip.octets();
        assert_eq!(
            instance.mac,
            format!("02:00:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3])
        );
    }
    // Multi-instance requests get indexed names.
    assert_eq!(result.instances[0].name, "web-0");
    assert_eq!(result.instances[2].name, "web-2");
}

// ----------------------------------------------------------------------
// External IP unmap settles on the unassign event
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_unmap_releases_on_event_not_before() {
    let mut h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();
    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    let instance = result.instances[0].clone();
    report_running(&mut h, instance.id, "node-1").await;

    h.controller.add_pool("public", &["198.51.100.7".into()]).await.unwrap();
    let mapping = h
        .controller
        .map_address("acme", None, instance.id)
        .await
        .unwrap();
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::ExternalIps).await, 1);

    h.controller.unmap_address("acme", &mapping.external_ip).await.unwrap();
    // The mapping survives until the appliance confirms.
    assert_eq!(h.store.mapped_ips(Some("acme")).await.len(), 1);

    let unassigned = h.events.subscribe(FrameKind::PublicIpUnassigned);
    h.peer
        .to_controller
        .send(Frame::Event(Event::PublicIpUnassigned(
            strato_core::payloads::PublicIpPayload {
                tenant_id: "acme".into(),
                instance_id: instance.id,
                external_ip: mapping.external_ip.clone(),
                internal_ip: mapping.internal_ip.clone(),
            },
        )))
        .unwrap();
    timeout(WAIT, unassigned).await.unwrap().unwrap();

    assert!(h.store.mapped_ips(Some("acme")).await.is_empty());
    assert_eq!(quota_usage(&h.controller, "acme", ResourceKind::ExternalIps).await, 0);

    // The address is free for the next mapping.
    let again = h.controller.map_address("acme", None, instance.id).await.unwrap();
    assert_eq!(again.external_ip, "198.51.100.7");
}

// ----------------------------------------------------------------------
// Pool administration
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_pool_admin_surface() {
    let mut h = harness(true).await;

    h.controller
        .add_pool("public", &["203.0.113.0/30".into()])
        .await
        .unwrap();
    h.controller
        .add_pool_addresses("public", &["198.51.100.7".into()])
        .await
        .unwrap();

    let (pool, summary) = h.controller.show_pool("public").await.unwrap();
    assert_eq!(pool.subnets, vec!["203.0.113.0/30".to_string()]);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.free, 3);
    assert_eq!(h.controller.list_pools().await.len(), 1);

    // Map one address, then try to shrink the pool under it.
    let w = h.store.add_workload(web_workload()).await.unwrap();
    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    let instance = result.instances[0].clone();
    report_running(&mut h, instance.id, "node-1").await;

    let mapping = h
        .controller
        .map_address("acme", Some("public"), instance.id)
        .await
        .unwrap();
    assert_eq!(mapping.internal_ip, instance.private_ip.to_string());

    assert!(matches!(
        h.controller.remove_pool_address("public", "203.0.113.0/30").await,
        Err(CoreError::ResourceBusy(_))
    ));
    assert!(matches!(
        h.controller.delete_pool("public").await,
        Err(CoreError::ResourceBusy(_))
    ));

    // The literal address is unmapped and removable.
    h.controller
        .remove_pool_address("public", "198.51.100.7")
        .await
        .unwrap();
    let (_, summary) = h.controller.show_pool("public").await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.free, 1);
}

#[tokio::test]
async fn test_evacuate_emits_frame_and_events_are_listable() {
    let mut h = harness(true).await;

    h.controller.evacuate_node("node-7").await.unwrap();
    let frame = next_frame(&mut h.peer).await;
    assert_eq!(frame.kind(), FrameKind::Evacuate);

    let connected = h.events.subscribe(FrameKind::NodeConnected);
    h.peer
        .to_controller
        .send(Frame::Event(Event::NodeConnected(
            strato_core::payloads::NodePayload {
                node_id: "node-7".into(),
                role: strato_core::payloads::NodeRole::Compute,
            },
        )))
        .unwrap();
    timeout(WAIT, connected).await.unwrap().unwrap();

    assert_eq!(h.store.transient().nodes().len(), 1);
    assert!(!h.controller.list_events(None).await.is_empty());

    h.controller.clear_events().await.unwrap();
    assert!(h.controller.list_events(None).await.is_empty());
}

// ----------------------------------------------------------------------
// Bad requests
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_zero_instances_is_rejected() {
    let h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();
    let err = h
        .controller
        .start_workload(start_request("acme", w.id, 0))
        .await;
    assert!(matches!(err, Err(CoreError::BadRequest(_))));
}

#[tokio::test]
async fn test_unknown_workload_is_rejected() {
    let h = harness(true).await;
    let err = h
        .controller
        .start_workload(start_request("acme", Uuid::new_v4(), 1))
        .await;
    assert!(matches!(err, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn test_boot_volume_cannot_be_detached() {
    let mut h = harness(true).await;
    let w = h.store.add_workload(web_workload()).await.unwrap();
    let result = h
        .controller
        .start_workload(start_request("acme", w.id, 1))
        .await
        .unwrap();
    let instance = result.instances[0].clone();
    report_running(&mut h, instance.id, "node-1").await;

    let attachments = h.store.attachments_for_instance(instance.id).await;
    let boot = attachments.iter().find(|a| a.boot).unwrap();

    let err = h.controller.detach_volume("acme", boot.block_id).await;
    assert!(matches!(err, Err(CoreError::Precondition(_))));
}
