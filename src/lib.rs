//! # strato — tenant-aware cloud workload controller
//!
//! Facade crate that re-exports the strato workspace crates so consumers
//! can depend on a single `stratod` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | strato-core | Types, ids, frames, config, error taxonomy |
//! | [`store`] | strato-store | Durable entity tables, event log, block driver seam |
//! | [`quota`] | strato-quota | Per-tenant resource ledger |
//! | [`node`] | strato-node | Node-bus session: send queue, transport, verbs |
//! | [`controller`] | strato-controller | Dispatcher verbs, readiness, event handling, recovery |

pub use strato_controller as controller;
pub use strato_core as core;
pub use strato_node as node;
pub use strato_quota as quota;
pub use strato_store as store;
