//! Balance reconciliation
//!
//! Audit, fix and rollback of stored balances against the ledger formula,
//! plus the append-only history of every run.

pub mod auditor;
pub mod fixer;
pub mod formula;
pub mod history;
pub mod resolver;
pub mod rollback;

pub use auditor::{AuditReport, AuditScope, Classification, UserAuditResult, UserDiscrepancy};
pub use fixer::{FixRequest, FixResult, SkipReason, SkippedUser};
pub use resolver::UserIdentifier;
pub use rollback::{RestoredUser, RollbackResult};

use crate::config::ReconcileConfig;
use crate::error::ReconcileResult;
use crate::ledger::LedgerDb;
use crate::models::AuditRunLogEntry;
use rust_decimal::Decimal;

/// The five admin operations over one ledger
#[derive(Clone)]
pub struct Reconciler {
    db: LedgerDb,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(db: LedgerDb, config: ReconcileConfig) -> Self {
        Self { db, config }
    }

    pub fn db(&self) -> &LedgerDb {
        &self.db
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn run_full_audit(&self, triggered_by: &str) -> ReconcileResult<AuditReport> {
        auditor::run_audit(&self.db, AuditScope::All, triggered_by, &self.config)
    }

    pub fn audit_user(
        &self,
        identifier: &str,
        current_price: Option<Decimal>,
        triggered_by: &str,
    ) -> ReconcileResult<UserAuditResult> {
        let ident = UserIdentifier::parse(identifier);
        auditor::audit_user(&self.db, &ident, current_price, triggered_by, &self.config)
    }

    pub fn apply_fix(&self, request: &FixRequest) -> ReconcileResult<FixResult> {
        fixer::apply_fix(&self.db, request, &self.config)
    }

    pub fn rollback(&self, fix_log_id: i64, triggered_by: &str) -> ReconcileResult<RollbackResult> {
        rollback::rollback(&self.db, fix_log_id, triggered_by)
    }

    /// Most recent first; `limit` is clamped to the configured bounds
    pub fn list_history(&self, limit: Option<usize>) -> ReconcileResult<Vec<AuditRunLogEntry>> {
        let limit = self.config.history_limit(limit);
        self.db.with_conn(|conn| history::list_history(conn, limit))
    }
}
