//! Ledger reconciliation library
//!
//! Audits stored user balances against the balance formula, fixes drift with
//! per-user undo records, rolls fixes back, and keeps an append-only history.
//! The binary in `main.rs` wraps this in a CLI and an admin HTTP API.

pub mod api;
pub mod config;
pub mod error;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod reconcile;

pub use config::{PnlRounding, ReconcileConfig};
pub use error::{FailedItem, ItemFailure, ReconcileError, ReconcileResult};
pub use ledger::LedgerDb;
pub use reconcile::Reconciler;
