//! Fixer
//!
//! Overwrites stored balances with the expected balance for fixable users
//! and records per-user undo data.
//!
//! The whole run is one IMMEDIATE transaction; each user gets its own
//! savepoint. Inside it the user is re-audited from fresh rows, then written
//! with a compare-and-swap against the balance the audit saw. A failing user
//! rolls back only its savepoint. The `fix` history entry and every
//! [`FixRecord`] commit together with the balance writes.

use crate::config::ReconcileConfig;
use crate::error::{FailedItem, ItemFailure, ReconcileError, ReconcileResult};
use crate::ledger::{set_balance_if, LedgerDb};
use crate::models::{AuditType, Cents, FixRecord, NewAuditRun, UserId};
use crate::reconcile::auditor::{audit_one, run_audit, AuditReport, AuditScope, Classification, UserDiscrepancy};
use crate::reconcile::history;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

fn default_source() -> String {
    "admin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRequest {
    /// Fix every fixable user
    #[serde(default)]
    pub fix_all: bool,
    /// Restrict to these users (intersected with the fixable set)
    #[serde(default)]
    pub user_ids: Option<Vec<UserId>>,
    pub triggered_by: String,
    #[serde(default = "default_source")]
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Balance already matches
    Correct,
    /// Has open trades: needs manual review
    OpenPositions,
    NotFound,
    /// The audit could not read this user's rows
    ReadError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedUser {
    pub user_id: UserId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixResult {
    /// The audit run the fix was planned from
    pub audit_run_id: i64,
    /// `None` when nothing was written
    pub run_id: Option<i64>,
    pub fixes: Vec<FixRecord>,
    pub failed: Vec<FailedItem>,
    pub skipped: Vec<SkippedUser>,
    pub total_adjustment_cents: Cents,
}

impl FixRequest {
    fn validate(&self) -> ReconcileResult<()> {
        let has_ids = self.user_ids.as_ref().is_some_and(|ids| !ids.is_empty());
        if !self.fix_all && !has_ids {
            return Err(ReconcileError::InvalidRequest(
                "either fix_all or a non-empty user_ids list is required".to_string(),
            ));
        }
        if self.triggered_by.trim().is_empty() {
            return Err(ReconcileError::InvalidRequest(
                "triggered_by is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Audit, then fix every fixable user in scope
pub fn apply_fix(
    db: &LedgerDb,
    request: &FixRequest,
    config: &ReconcileConfig,
) -> ReconcileResult<FixResult> {
    request.validate()?;
    let report = run_audit(db, AuditScope::All, &request.triggered_by, config)?;
    apply_fix_with_report(db, request, &report, config)
}

/// Fix from an existing audit report. The report only nominates candidates
/// and pins the balance each one was audited at; every candidate is
/// re-audited from fresh rows before its write.
pub fn apply_fix_with_report(
    db: &LedgerDb,
    request: &FixRequest,
    report: &AuditReport,
    config: &ReconcileConfig,
) -> ReconcileResult<FixResult> {
    request.validate()?;
    let (candidates, mut skipped) = select_candidates(request, report);

    if candidates.is_empty() {
        info!(
            audit_run_id = report.run_id,
            skipped = skipped.len(),
            "🩹 No fixable users, nothing written"
        );
        return Ok(FixResult {
            audit_run_id: report.run_id,
            run_id: None,
            fixes: Vec::new(),
            failed: Vec::new(),
            skipped,
            total_adjustment_cents: 0,
        });
    }

    let (run_id, fixes, failed) = db.with_transaction(|tx| {
        let mut fixes: Vec<FixRecord> = Vec::new();
        let mut failed: Vec<FailedItem> = Vec::new();

        // Candidates still fixable on the in-transaction re-audit
        let mut still_fixable: i64 = 0;

        for candidate in &candidates {
            let outcome = match tx.savepoint() {
                Ok(sp) => match fix_one(&sp, candidate, config) {
                    Ok(FixOutcome::Rejected(failure)) => {
                        // Savepoint rolls back on drop
                        still_fixable += 1;
                        Err(failure)
                    }
                    Ok(outcome) => {
                        if matches!(outcome, FixOutcome::Applied(_)) {
                            still_fixable += 1;
                        }
                        sp.commit()
                            .map(|_| outcome)
                            .map_err(|e| ItemFailure::Persistence(e.to_string()))
                    }
                    Err(failure) => Err(failure),
                },
                Err(e) => Err(ItemFailure::Persistence(e.to_string())),
            };

            match outcome {
                Ok(FixOutcome::Applied(record)) => fixes.push(record),
                Ok(FixOutcome::AlreadyCorrect) => skipped.push(SkippedUser {
                    user_id: candidate.user_id,
                    reason: SkipReason::Correct,
                }),
                Ok(FixOutcome::Rejected(reason)) | Err(reason) => {
                    warn!(user_id = candidate.user_id, %reason, "Balance fix failed for user");
                    failed.push(FailedItem {
                        user_id: candidate.user_id,
                        reason,
                    });
                }
            }
        }

        if fixes.is_empty() {
            return Ok((None, fixes, failed));
        }

        let total_adjustment: Cents = fixes.iter().map(|f| f.adjustment_cents).sum();
        let entry = history::insert_run(
            tx,
            &NewAuditRun {
                audit_type: AuditType::Fix,
                total_users_checked: candidates.len() as i64,
                discrepancies_found: still_fixable,
                fixes_applied: fixes.len() as i64,
                total_adjustment_cents: total_adjustment,
                triggered_by: request.triggered_by.clone(),
                notes: Some(fix_notes(request, report.run_id, failed.len())),
                rollback_of: None,
            },
        )?;
        history::insert_fix_records(tx, entry.id, &fixes)?;

        Ok((Some(entry.id), fixes, failed))
    })?;

    let total_adjustment_cents: Cents = fixes.iter().map(|f| f.adjustment_cents).sum();
    info!(
        run_id = ?run_id,
        audit_run_id = report.run_id,
        triggered_by = %request.triggered_by,
        source = %request.source,
        fixes_applied = fixes.len(),
        failed = failed.len(),
        skipped = skipped.len(),
        total_adjustment_cents,
        "🩹 Balance fix run complete"
    );

    Ok(FixResult {
        audit_run_id: report.run_id,
        run_id,
        fixes,
        failed,
        skipped,
        total_adjustment_cents,
    })
}

enum FixOutcome {
    Applied(FixRecord),
    AlreadyCorrect,
    /// Still fixable on re-audit, but the write did not land
    Rejected(ItemFailure),
}

/// Re-audit one user inside its savepoint and write the correction.
/// `Err` means the user was no longer a fix candidate.
fn fix_one(
    conn: &Connection,
    candidate: &UserDiscrepancy,
    config: &ReconcileConfig,
) -> Result<FixOutcome, ItemFailure> {
    let fresh = audit_one(conn, candidate.user_id, config)
        .map_err(|e| ItemFailure::Persistence(e.to_string()))?
        .ok_or(ItemFailure::NotFound)?;

    match fresh.classification {
        Classification::Correct => return Ok(FixOutcome::AlreadyCorrect),
        Classification::NeedsManualReview => return Err(ItemFailure::OpenPositionsPresent),
        Classification::Fixable => {}
    }

    // Pinned to the balance the audit reported, not the fresh read
    match set_balance_if(
        conn,
        candidate.user_id,
        candidate.balance_cents,
        fresh.expected_cents,
    ) {
        Ok(true) => {}
        Ok(false) => return Ok(FixOutcome::Rejected(ItemFailure::StaleWrite)),
        Err(e) => return Ok(FixOutcome::Rejected(ItemFailure::Persistence(e.to_string()))),
    }

    Ok(FixOutcome::Applied(FixRecord {
        user_id: candidate.user_id,
        username: fresh.username,
        previous_balance_cents: candidate.balance_cents,
        new_balance_cents: fresh.expected_cents,
        adjustment_cents: fresh.expected_cents - candidate.balance_cents,
        had_open_positions: fresh.open_trades_count > 0,
    }))
}

/// Fixable users in scope, plus why each requested non-candidate was left out
fn select_candidates(
    request: &FixRequest,
    report: &AuditReport,
) -> (Vec<UserDiscrepancy>, Vec<SkippedUser>) {
    let wanted: Option<HashSet<UserId>> = if request.fix_all {
        None
    } else {
        request
            .user_ids
            .as_ref()
            .map(|ids| ids.iter().copied().collect())
    };
    let in_scope = |id: UserId| wanted.as_ref().map_or(true, |w| w.contains(&id));

    let candidates: Vec<UserDiscrepancy> = report
        .users
        .iter()
        .filter(|u| u.is_fixable() && in_scope(u.user_id))
        .cloned()
        .collect();

    let mut skipped = Vec::new();
    if let Some(ids) = request.user_ids.as_ref().filter(|_| !request.fix_all) {
        let mut seen = HashSet::new();
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            let reason = match report.users.iter().find(|u| u.user_id == id) {
                Some(u) => match u.classification {
                    Classification::Fixable => continue,
                    Classification::Correct => SkipReason::Correct,
                    Classification::NeedsManualReview => SkipReason::OpenPositions,
                },
                None if report.errors.iter().any(|e| e.user_id == id) => SkipReason::ReadError,
                None => SkipReason::NotFound,
            };
            skipped.push(SkippedUser { user_id: id, reason });
        }
    }

    (candidates, skipped)
}

fn fix_notes(request: &FixRequest, audit_run_id: i64, failed: usize) -> String {
    let mut notes = format!("source={} audit_run={}", request.source, audit_run_id);
    if failed > 0 {
        notes.push_str(&format!(" failed={}", failed));
    }
    notes
}
