//! Rollback engine
//!
//! Literal undo of a fix run: every user the fix touched gets its recorded
//! previous balance back. No re-derivation. Preconditions, restores, the
//! `rolled_back_at` stamp and the `rollback` entry commit as one transaction.
//! A user deleted since the fix is reported per item and does not block the
//! restore of everyone else.

use crate::error::{FailedItem, ItemFailure, ReconcileError, ReconcileResult};
use crate::ledger::{set_balance, LedgerDb, LedgerSource};
use crate::models::{AuditType, Cents, NewAuditRun, UserId};
use crate::reconcile::history;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoredUser {
    pub user_id: UserId,
    pub username: String,
    /// Balance right before the restore
    pub balance_before_cents: Cents,
    pub restored_balance_cents: Cents,
    /// Balance had moved since the fix wrote it
    pub drifted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub run_id: i64,
    pub rollback_of: i64,
    pub restored: Vec<RestoredUser>,
    /// Users the fix touched that no longer exist
    pub failed: Vec<FailedItem>,
    /// Negation of the restored users' fix adjustments
    pub total_adjustment_cents: Cents,
}

pub fn rollback(
    db: &LedgerDb,
    fix_log_id: i64,
    triggered_by: &str,
) -> ReconcileResult<RollbackResult> {
    let result = db.with_transaction(|tx| {
        let entry = history::get_run(tx, fix_log_id)?
            .ok_or_else(|| ReconcileError::NotFound(format!("audit run {}", fix_log_id)))?;
        if entry.audit_type != AuditType::Fix {
            return Err(ReconcileError::WrongLogType {
                id: fix_log_id,
                actual: entry.audit_type.as_str().to_string(),
            });
        }
        if entry.rolled_back_at.is_some() {
            return Err(ReconcileError::AlreadyRolledBack(fix_log_id));
        }

        let records = history::fix_records_for_run(tx, fix_log_id)?;
        let mut restored = Vec::with_capacity(records.len());
        let mut failed = Vec::new();
        let mut total_adjustment: Cents = 0;
        for rec in &records {
            let Some(before) = tx.user_balance(rec.user_id)? else {
                warn!(fix_log_id, user_id = rec.user_id, "User gone since fix, nothing to restore");
                failed.push(FailedItem {
                    user_id: rec.user_id,
                    reason: ItemFailure::NotFound,
                });
                continue;
            };
            let drifted = before != rec.new_balance_cents;
            if drifted {
                warn!(
                    fix_log_id,
                    user_id = rec.user_id,
                    fixed_to = rec.new_balance_cents,
                    current = before,
                    "Balance moved since fix, restoring recorded value anyway"
                );
            }
            set_balance(tx, rec.user_id, rec.previous_balance_cents)?;
            total_adjustment -= rec.adjustment_cents;
            restored.push(RestoredUser {
                user_id: rec.user_id,
                username: rec.username.clone(),
                balance_before_cents: before,
                restored_balance_cents: rec.previous_balance_cents,
                drifted,
            });
        }

        if !history::mark_rolled_back(tx, fix_log_id, Utc::now())? {
            return Err(ReconcileError::AlreadyRolledBack(fix_log_id));
        }

        let drifted = restored.iter().filter(|r| r.drifted).count();
        let mut notes = format!("rollback of run {}", fix_log_id);
        if drifted > 0 {
            notes.push_str(&format!(" drifted={}", drifted));
        }
        if !failed.is_empty() {
            notes.push_str(&format!(" failed={}", failed.len()));
        }
        let run = history::insert_run(
            tx,
            &NewAuditRun {
                audit_type: AuditType::Rollback,
                total_users_checked: records.len() as i64,
                discrepancies_found: 0,
                fixes_applied: restored.len() as i64,
                total_adjustment_cents: total_adjustment,
                triggered_by: triggered_by.to_string(),
                notes: Some(notes),
                rollback_of: Some(fix_log_id),
            },
        )?;

        Ok(RollbackResult {
            run_id: run.id,
            rollback_of: fix_log_id,
            restored,
            failed,
            total_adjustment_cents: total_adjustment,
        })
    })?;

    info!(
        run_id = result.run_id,
        rollback_of = fix_log_id,
        triggered_by,
        restored = result.restored.len(),
        failed = result.failed.len(),
        total_adjustment_cents = result.total_adjustment_cents,
        "⏪ Fix run rolled back"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileConfig;
    use crate::reconcile::auditor::{run_audit, AuditScope};
    use crate::reconcile::fixer::{apply_fix, FixRequest};

    fn fix_everything(db: &LedgerDb) -> i64 {
        let result = apply_fix(
            db,
            &FixRequest {
                fix_all: true,
                user_ids: None,
                triggered_by: "tester".to_string(),
                source: "unit".to_string(),
            },
            &ReconcileConfig::default(),
        )
        .unwrap();
        result.run_id.unwrap()
    }

    fn balance(db: &LedgerDb, id: UserId) -> Cents {
        db.with_conn(|conn| Ok(conn.user_balance(id)?.unwrap())).unwrap()
    }

    #[test]
    fn test_restores_and_negates_total() {
        let db = LedgerDb::in_memory().unwrap();
        let user = db.create_user("u", None, 1_000_700).unwrap();
        let fix_id = fix_everything(&db);
        assert_eq!(balance(&db, user.id), 1_000_000);

        let result = rollback(&db, fix_id, "tester").unwrap();
        assert_eq!(result.rollback_of, fix_id);
        assert_eq!(result.total_adjustment_cents, 700);
        assert_eq!(result.restored.len(), 1);
        assert!(!result.restored[0].drifted);
        assert_eq!(balance(&db, user.id), 1_000_700);

        let entry = db
            .with_conn(|conn| history::get_run(conn, result.run_id))
            .unwrap()
            .unwrap();
        assert_eq!(entry.audit_type, AuditType::Rollback);
        assert_eq!(entry.rollback_of, Some(fix_id));
        assert_eq!(entry.fixes_applied, 1);
    }

    #[test]
    fn test_preconditions() {
        let db = LedgerDb::in_memory().unwrap();
        db.create_user("u", None, 5).unwrap();
        let audit = run_audit(&db, AuditScope::All, "tester", &ReconcileConfig::default()).unwrap();

        assert!(matches!(
            rollback(&db, 9_999, "tester").unwrap_err(),
            ReconcileError::NotFound(_)
        ));
        assert!(matches!(
            rollback(&db, audit.run_id, "tester").unwrap_err(),
            ReconcileError::WrongLogType { .. }
        ));

        let fix_id = fix_everything(&db);
        rollback(&db, fix_id, "tester").unwrap();
        assert!(matches!(
            rollback(&db, fix_id, "tester").unwrap_err(),
            ReconcileError::AlreadyRolledBack(id) if id == fix_id
        ));
        assert_eq!(balance(&db, 1), 5);
    }

    #[test]
    fn test_drift_is_flagged_but_restored() {
        let db = LedgerDb::in_memory().unwrap();
        let user = db.create_user("u", None, 400).unwrap();
        let fix_id = fix_everything(&db);
        db.adjust_balance(user.id, -250).unwrap();

        let result = rollback(&db, fix_id, "tester").unwrap();
        assert!(result.restored[0].drifted);
        assert_eq!(result.restored[0].balance_before_cents, 999_750);
        assert_eq!(balance(&db, user.id), 400);
    }

    #[test]
    fn test_rollback_of_rollback_is_wrong_type() {
        let db = LedgerDb::in_memory().unwrap();
        db.create_user("u", None, 1).unwrap();
        let fix_id = fix_everything(&db);
        let rb = rollback(&db, fix_id, "tester").unwrap();

        let err = rollback(&db, rb.run_id, "tester").unwrap_err();
        assert!(matches!(err, ReconcileError::WrongLogType { ref actual, .. } if actual == "rollback"));
    }

    #[test]
    fn test_deleted_user_does_not_block_others() {
        let db = LedgerDb::in_memory().unwrap();
        let a = db.create_user("a", None, 1_000_300).unwrap();
        let b = db.create_user("b", None, 999_000).unwrap();
        let fix_id = fix_everything(&db);
        db.delete_user(b.id).unwrap();

        let result = rollback(&db, fix_id, "tester").unwrap();
        assert_eq!(result.restored.len(), 1);
        assert_eq!(result.restored[0].user_id, a.id);
        assert_eq!(
            result.failed,
            vec![FailedItem { user_id: b.id, reason: ItemFailure::NotFound }]
        );
        assert_eq!(result.total_adjustment_cents, 300);
        assert_eq!(balance(&db, a.id), 1_000_300);

        let (fix_entry, rb_entry) = db
            .with_conn(|conn| {
                Ok((
                    history::get_run(conn, fix_id)?.unwrap(),
                    history::get_run(conn, result.run_id)?.unwrap(),
                ))
            })
            .unwrap();
        assert!(fix_entry.rolled_back_at.is_some());
        assert_eq!(rb_entry.fixes_applied, 1);
        assert_eq!(rb_entry.notes, Some(format!("rollback of run {} failed=1", fix_id)));

        assert!(matches!(
            rollback(&db, fix_id, "tester").unwrap_err(),
            ReconcileError::AlreadyRolledBack(_)
        ));
    }
}
