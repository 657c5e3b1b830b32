//! Per-tenant resource ledger.
//!
//! One actor task per tenant (spawned lazily, routed by the engine task)
//! owns that tenant's usage and limits, so a tenant's decisions are
//! linearisable without a lock around the ledger. Every operation is a
//! message; consume answers on a single-shot channel the caller MUST
//! read before treating the decision as final.
//!
//! A consume always applies its demand to the ledger and reports whether
//! any finite limit was overrun. When the caller abandons the work (the
//! demand was denied, or a later step failed) it releases the exact
//! resource echo carried by the result. This keeps the invariant
//! `usage = Σconsumed − Σreleased` under any interleaving.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use strato_core::resources::{QuotaDetail, ResourceKind, ResourceRequest, UNLIMITED, collapse};

/// Outcome of one consume, delivered on a single-shot channel.
#[derive(Debug, Clone)]
pub struct ConsumeResult {
    allowed: bool,
    resources: Vec<ResourceRequest>,
    overrun: Vec<ResourceKind>,
}

impl ConsumeResult {
    /// Whether every finite limit still holds after this consume.
    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// Exactly what was applied to the ledger; release this on rollback.
    pub fn resources(&self) -> &[ResourceRequest] {
        &self.resources
    }

    /// The resource kinds whose limits were overrun, for error reporting.
    pub fn overrun(&self) -> &[ResourceKind] {
        &self.overrun
    }
}

enum TenantCmd {
    Consume {
        resources: Vec<ResourceRequest>,
        reply: oneshot::Sender<ConsumeResult>,
    },
    Release {
        resources: Vec<ResourceRequest>,
    },
    Update {
        limits: Vec<ResourceRequest>,
    },
    Dump {
        reply: oneshot::Sender<Vec<QuotaDetail>>,
    },
}

enum EngineCmd {
    Route { tenant_id: String, cmd: TenantCmd },
    Tenants { reply: oneshot::Sender<Vec<String>> },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    usage: i64,
    limit: i64,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            usage: 0,
            limit: UNLIMITED,
        }
    }
}

async fn tenant_worker(tenant_id: String, mut rx: mpsc::UnboundedReceiver<TenantCmd>) {
    let mut ledger: HashMap<ResourceKind, Entry> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            TenantCmd::Consume { resources, reply } => {
                let resources = collapse(&resources);
                let mut overrun = Vec::new();
                for req in &resources {
                    let entry = ledger.entry(req.kind).or_default();
                    entry.usage += req.value;
                    if entry.limit != UNLIMITED && entry.usage > entry.limit {
                        overrun.push(req.kind);
                    }
                }
                let result = ConsumeResult {
                    allowed: overrun.is_empty(),
                    resources,
                    overrun,
                };
                // The caller may have given up waiting; the ledger change
                // stands either way and recovery re-derives it.
                let _ = reply.send(result);
            }
            TenantCmd::Release { resources } => {
                for req in collapse(&resources) {
                    let entry = ledger.entry(req.kind).or_default();
                    entry.usage -= req.value;
                    if entry.usage < 0 {
                        warn!(tenant = %tenant_id, kind = %req.kind,
                              "release drove usage negative, clamping");
                        entry.usage = 0;
                    }
                }
            }
            TenantCmd::Update { limits } => {
                for req in limits {
                    ledger.entry(req.kind).or_default().limit = req.value;
                }
            }
            TenantCmd::Dump { reply } => {
                let details = ResourceKind::ALL
                    .iter()
                    .map(|&kind| {
                        let entry = ledger.get(&kind).copied().unwrap_or_default();
                        QuotaDetail {
                            kind,
                            usage: entry.usage,
                            limit: entry.limit,
                        }
                    })
                    .collect();
                let _ = reply.send(details);
            }
        }
    }
}

async fn engine_loop(mut rx: mpsc::UnboundedReceiver<EngineCmd>) {
    let mut workers: HashMap<String, mpsc::UnboundedSender<TenantCmd>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            EngineCmd::Route { tenant_id, cmd } => {
                let tx = workers.entry(tenant_id.clone()).or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    tokio::spawn(tenant_worker(tenant_id.clone(), rx));
                    tx
                });
                // A worker never exits while its sender lives.
                let _ = tx.send(cmd);
            }
            EngineCmd::Tenants { reply } => {
                let mut tenants: Vec<_> = workers.keys().cloned().collect();
                tenants.sort();
                let _ = reply.send(tenants);
            }
            EngineCmd::Shutdown => break,
        }
    }
    // Dropping the senders lets every worker drain and exit.
}

/// Handle to the quota engine. Cheap to clone; all clones feed the same
/// ledgers.
#[derive(Clone)]
pub struct QuotaEngine {
    tx: mpsc::UnboundedSender<EngineCmd>,
}

impl QuotaEngine {
    /// Start the engine task. Requires a running tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(engine_loop(rx));
        Self { tx }
    }

    fn route(&self, tenant_id: &str, cmd: TenantCmd) {
        let _ = self.tx.send(EngineCmd::Route {
            tenant_id: tenant_id.to_string(),
            cmd,
        });
    }

    /// Apply a demand to the tenant's ledger. The returned channel
    /// carries the decision; read it before assuming anything. A closed
    /// channel means the engine was shut down.
    pub fn consume(
        &self,
        tenant_id: &str,
        resources: &[ResourceRequest],
    ) -> oneshot::Receiver<ConsumeResult> {
        let (reply, rx) = oneshot::channel();
        self.route(
            tenant_id,
            TenantCmd::Consume {
                resources: resources.to_vec(),
                reply,
            },
        );
        rx
    }

    /// Unconditionally return resources to the tenant's ledger.
    pub fn release(&self, tenant_id: &str, resources: &[ResourceRequest]) {
        self.route(
            tenant_id,
            TenantCmd::Release {
                resources: resources.to_vec(),
            },
        );
    }

    /// Replace the limits for the listed kinds. Current usage may exceed
    /// a lowered limit; future consumes fail until enough is released.
    pub fn update_limits(&self, tenant_id: &str, limits: &[ResourceRequest]) {
        self.route(
            tenant_id,
            TenantCmd::Update {
                limits: limits.to_vec(),
            },
        );
    }

    /// Usage/limit snapshot across all resource kinds.
    pub async fn dump(&self, tenant_id: &str) -> Vec<QuotaDetail> {
        let (reply, rx) = oneshot::channel();
        self.route(tenant_id, TenantCmd::Dump { reply });
        rx.await.unwrap_or_default()
    }

    /// Tenants with a ledger (those that ever consumed or got limits).
    pub async fn tenants(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(EngineCmd::Tenants { reply });
        rx.await.unwrap_or_default()
    }

    /// Stop the engine; outstanding consumes observe a closed channel.
    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineCmd::Shutdown);
    }
}

impl Default for QuotaEngine {
    fn default() -> Self {
        Self::new()
    }
}
