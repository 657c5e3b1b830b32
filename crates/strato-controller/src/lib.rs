//! Orchestration core of the controller.
//!
//! The [`Controller`] owns the synchronous halves of every API verb;
//! the [`EventHandler`](events::EventHandler) owns the asynchronous
//! halves, correlating node-bus frames back to entity state machines.

pub mod dispatcher;
pub mod events;
mod external_ip;
pub mod readiness;
pub mod recovery;
mod volumes;

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use strato_core::config::CoreConfig;
use strato_core::error::{CoreError, Result};
use strato_core::resources::{QuotaDetail, ResourceRequest};
use strato_core::workload::{Firmware, StorageResource, VmType, Workload};
use strato_node::{NodeClient, NodeTransport};
use strato_quota::QuotaEngine;
use strato_store::{BlockDriver, Datastore, EventLogEntry};

pub use dispatcher::{StartRequest, StartResult};
pub use events::EventHandler;
pub use readiness::TenantReadiness;

/// The orchestration core. All fields are construction-time values; no
/// configuration lives in module state.
pub struct Controller {
    pub(crate) config: CoreConfig,
    pub(crate) store: Arc<Datastore>,
    pub(crate) quota: QuotaEngine,
    pub(crate) node: NodeClient,
    pub(crate) block: Arc<dyn BlockDriver>,
    pub(crate) readiness: Arc<TenantReadiness>,
}

/// Wire the core together: quota engine, node session, event handler,
/// controller. The event handler task runs until the node session ends.
pub fn build(
    config: CoreConfig,
    store: Arc<Datastore>,
    block: Arc<dyn BlockDriver>,
    transport: Arc<dyn NodeTransport>,
) -> (Arc<Controller>, Arc<EventHandler>) {
    let quota = QuotaEngine::new();
    let readiness = Arc::new(TenantReadiness::new());

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let node = NodeClient::start(transport, inbound_tx);

    let events = Arc::new(EventHandler::new(
        Arc::clone(&store),
        quota.clone(),
        Arc::clone(&block),
        Arc::clone(&readiness),
    ));
    tokio::spawn(Arc::clone(&events).run(inbound_rx));

    let controller = Arc::new(Controller {
        config,
        store,
        quota,
        node,
        block,
        readiness,
    });
    (controller, events)
}

/// On-disk workload definition; the stored workload gets a fresh uuid.
#[derive(Debug, Deserialize)]
struct WorkloadDef {
    description: String,
    vm_type: VmType,
    #[serde(default = "default_firmware")]
    firmware: Firmware,
    #[serde(default)]
    image_id: String,
    #[serde(default)]
    image_name: String,
    #[serde(default)]
    storage: Vec<StorageResource>,
    #[serde(default)]
    defaults: Vec<ResourceRequest>,
    #[serde(default)]
    config: String,
    #[serde(default)]
    cnci: bool,
}

fn default_firmware() -> Firmware {
    Firmware::Legacy
}

#[derive(Debug, Deserialize)]
struct LimitsSeed {
    #[serde(default)]
    tenants: Vec<TenantLimitsSeed>,
}

#[derive(Debug, Deserialize)]
struct TenantLimitsSeed {
    id: String,
    limits: Vec<ResourceRequest>,
}

impl Controller {
    /// Startup sequence: seed workload definitions and tenant limits on
    /// first boot, then re-derive quota usage from the replayed store.
    pub async fn initialize(&self) -> Result<()> {
        self.seed_workloads().await?;
        self.seed_limits().await?;
        recovery::rederive_usage(&self.store, &self.quota).await
    }

    /// Load `workloads_path/*.toml` into the global scope. Runs only
    /// while the workload table is empty so restarts do not mint
    /// duplicate templates under fresh uuids.
    async fn seed_workloads(&self) -> Result<()> {
        if !self.store.all_workloads().await.is_empty() {
            return Ok(());
        }
        let dir = &self.config.workloads_path;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(CoreError::Fatal(format!(
                    "cannot read workloads dir {}: {e}",
                    dir.display()
                )));
            }
        };

        let mut loaded = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::Fatal(format!("cannot scan workloads dir: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let workload = parse_workload_def(&path).await?;
            self.store.add_workload(workload).await?;
            loaded += 1;
        }
        if loaded > 0 {
            info!(count = loaded, "workload definitions loaded");
        }
        Ok(())
    }

    /// Apply `tables_init_path/limits.toml` to tenants that have no
    /// stored limits yet.
    async fn seed_limits(&self) -> Result<()> {
        let path = self.config.tables_init_path.join("limits.toml");
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(CoreError::Fatal(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };
        let seed: LimitsSeed = toml::from_str(&raw)
            .map_err(|e| CoreError::BadRequest(format!("cannot parse {}: {e}", path.display())))?;

        for tenant in seed.tenants {
            if self.store.tenant_limits(&tenant.id).await.is_empty() {
                self.store
                    .set_tenant_limits(&tenant.id, tenant.limits)
                    .await?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Datastore> {
        &self.store
    }

    /// Usage/limit snapshot for one tenant.
    pub async fn dump_quotas(&self, tenant_id: &str) -> Vec<QuotaDetail> {
        self.quota.dump(tenant_id).await
    }

    /// Usage/limit snapshots for every tenant with a ledger.
    pub async fn dump_all_quotas(&self) -> Vec<(String, Vec<QuotaDetail>)> {
        let mut out = Vec::new();
        for tenant in self.quota.tenants().await {
            let details = self.quota.dump(&tenant).await;
            out.push((tenant, details));
        }
        out
    }

    /// Replace a tenant's limits, durably and in the live engine.
    pub async fn update_tenant_limits(
        &self,
        tenant_id: &str,
        limits: Vec<ResourceRequest>,
    ) -> Result<()> {
        self.store.set_tenant_limits(tenant_id, limits.clone()).await?;
        self.quota.update_limits(tenant_id, &limits);
        Ok(())
    }

    pub async fn list_events(&self, tenant_id: Option<&str>) -> Vec<EventLogEntry> {
        self.store.events().list(tenant_id).await
    }

    /// Admin-only.
    pub async fn clear_events(&self) -> Result<()> {
        self.store.events().clear().await
    }

    /// Release the node session and stop the quota engine.
    pub fn shutdown(&self) {
        self.node.disconnect();
        self.quota.shutdown();
    }
}

async fn parse_workload_def(path: &Path) -> Result<Workload> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CoreError::Fatal(format!("cannot read {}: {e}", path.display())))?;
    let def: WorkloadDef = toml::from_str(&raw)
        .map_err(|e| CoreError::BadRequest(format!("cannot parse {}: {e}", path.display())))?;
    let workload = Workload {
        id: Uuid::new_v4(),
        tenant_id: None,
        description: def.description,
        vm_type: def.vm_type,
        firmware: def.firmware,
        image_id: def.image_id,
        image_name: def.image_name,
        storage: def.storage,
        defaults: def.defaults,
        config: def.config,
        cnci: def.cnci,
    };
    workload.validate()?;
    Ok(workload)
}
