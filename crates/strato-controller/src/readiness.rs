//! Per-tenant at-most-once bootstrap bookkeeping.
//!
//! A memo map under one mutex hands ownership of the bootstrap body to
//! exactly one caller per tenant; everyone else waits on the memo's
//! completion signal. The mutex is released before the body runs, so a
//! slow appliance launch never blocks other tenants. Failure purges the
//! memo so a later call retries; success leaves it cached.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{oneshot, watch};

use strato_core::error::{CoreError, Result};
use strato_core::payloads::ConcentratorPayload;

struct Memo {
    done: watch::Receiver<bool>,
    result: std::sync::Arc<Mutex<Option<Result<()>>>>,
}

/// What `claim` hands back: either the right (and duty) to run the
/// bootstrap body, or a ticket to wait for whoever holds it.
pub enum Claim {
    /// Caller owns the in-flight confirmation and must call
    /// [`TenantReadiness::finish`] exactly once.
    Owner(BootstrapToken),
    /// Another caller is (or was) confirming this tenant.
    Waiter(WaitTicket),
}

pub struct BootstrapToken {
    tenant_id: String,
    signal: watch::Sender<bool>,
    result: std::sync::Arc<Mutex<Option<Result<()>>>>,
}

pub struct WaitTicket {
    done: watch::Receiver<bool>,
    result: std::sync::Arc<Mutex<Option<Result<()>>>>,
}

impl WaitTicket {
    /// Block until the in-flight confirmation completes and share its
    /// outcome.
    pub async fn wait(mut self) -> Result<()> {
        while !*self.done.borrow() {
            if self.done.changed().await.is_err() {
                // The owner disappeared without finishing.
                return Err(CoreError::Transient(
                    "tenant confirmation interrupted".into(),
                ));
            }
        }
        self.result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(CoreError::Transient("tenant confirmation interrupted".into())))
    }
}

#[derive(Default)]
pub struct TenantReadiness {
    memos: Mutex<HashMap<String, Memo>>,
    /// In-flight waits for the appliance-ready event, one per tenant.
    cnci_waiters: Mutex<HashMap<String, oneshot::Sender<ConcentratorPayload>>>,
}

impl TenantReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or join the memo for a tenant. At any moment at most one
    /// caller holds the `Owner` claim per tenant.
    pub fn claim(&self, tenant_id: &str) -> Claim {
        let mut memos = self.memos.lock().unwrap();
        if let Some(memo) = memos.get(tenant_id) {
            return Claim::Waiter(WaitTicket {
                done: memo.done.clone(),
                result: memo.result.clone(),
            });
        }

        let (signal, done) = watch::channel(false);
        let result = std::sync::Arc::new(Mutex::new(None));
        memos.insert(
            tenant_id.to_string(),
            Memo {
                done,
                result: result.clone(),
            },
        );
        Claim::Owner(BootstrapToken {
            tenant_id: tenant_id.to_string(),
            signal,
            result,
        })
    }

    /// Record the bootstrap outcome and wake every waiter. A failure
    /// purges the memo so the next `claim` starts a fresh attempt.
    pub fn finish(&self, token: BootstrapToken, outcome: Result<()>) {
        if outcome.is_err() {
            self.memos.lock().unwrap().remove(&token.tenant_id);
            self.cnci_waiters.lock().unwrap().remove(&token.tenant_id);
        }
        *token.result.lock().unwrap() = Some(outcome);
        let _ = token.signal.send(true);
    }

    /// Drop a cached success, forcing the next confirmation to re-check
    /// the tenant (used when the appliance instance goes away).
    pub fn invalidate(&self, tenant_id: &str) {
        self.memos.lock().unwrap().remove(tenant_id);
    }

    /// Register for the tenant's next appliance-ready event. Must be
    /// called before the appliance START is submitted so the event
    /// cannot race the registration.
    pub fn register_appliance_wait(
        &self,
        tenant_id: &str,
    ) -> oneshot::Receiver<ConcentratorPayload> {
        let (tx, rx) = oneshot::channel();
        self.cnci_waiters
            .lock()
            .unwrap()
            .insert(tenant_id.to_string(), tx);
        rx
    }

    /// Called by the event handler when ConcentratorInstanceAdded
    /// arrives; wakes the in-flight bootstrap, if any.
    pub fn appliance_ready(&self, payload: &ConcentratorPayload) {
        if let Some(tx) = self
            .cnci_waiters
            .lock()
            .unwrap()
            .remove(&payload.tenant_id)
        {
            let _ = tx.send(payload.clone());
        }
    }
}
