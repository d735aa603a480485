//! Auditor
//!
//! Compares each user's stored balance with the formula's expected balance
//! and classifies the difference. Never writes a balance; always appends one
//! `full` entry to the history so audit frequency is itself visible.

use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::ledger::{LedgerDb, LedgerSource};
use crate::models::{
    AuditType, Cents, ClaimRecord, ExpectedBalanceBreakdown, MissionRewardRecord, NewAuditRun,
    ReferralRecord, TradeSide, User, UserId,
};
use crate::reconcile::formula::{compute_expected_balance, unrealized_pnl};
use crate::reconcile::history;
use crate::reconcile::resolver::{resolve_user, UserIdentifier};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Correct,
    /// Wrong, and no open trades: safe to auto-correct
    Fixable,
    /// Wrong, with open trades: expected would go stale immediately
    NeedsManualReview,
}

impl Classification {
    pub fn classify(discrepancy_cents: Cents, open_trades_count: i64) -> Self {
        if discrepancy_cents == 0 {
            Classification::Correct
        } else if open_trades_count == 0 {
            Classification::Fixable
        } else {
            Classification::NeedsManualReview
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum AuditScope {
    All,
    User(UserId),
}

/// One audited user. `discrepancy = balance - expected`.
#[derive(Debug, Clone, Serialize)]
pub struct UserDiscrepancy {
    pub user_id: UserId,
    pub username: String,
    pub wallet_address: Option<String>,
    pub balance_cents: Cents,
    pub expected_cents: Cents,
    pub discrepancy_cents: Cents,
    pub open_trades_count: i64,
    pub classification: Classification,
    pub breakdown: ExpectedBalanceBreakdown,
}

impl UserDiscrepancy {
    pub fn is_correct(&self) -> bool {
        self.classification == Classification::Correct
    }

    pub fn is_fixable(&self) -> bool {
        self.classification == Classification::Fixable
    }

    pub fn needs_manual_review(&self) -> bool {
        self.classification == Classification::NeedsManualReview
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditError {
    pub user_id: UserId,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AuditSummary {
    pub total_users: i64,
    pub checked: i64,
    pub correct: i64,
    pub fixable: i64,
    pub needs_manual_review: i64,
    pub errors: i64,
    /// Users that vanished between listing and reading
    pub skipped: i64,
    pub total_excess_cents: Cents,
    pub total_deficit_cents: Cents,
    pub net_discrepancy_cents: Cents,
    pub users_with_open_positions: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub run_id: i64,
    pub run_at: DateTime<Utc>,
    pub scope: AuditScope,
    pub summary: AuditSummary,
    pub users: Vec<UserDiscrepancy>,
    pub errors: Vec<AuditError>,
}

/// Result of a scan, before anything is logged
#[derive(Debug, Clone, Default)]
pub struct AuditScan {
    pub summary: AuditSummary,
    pub users: Vec<UserDiscrepancy>,
    pub errors: Vec<AuditError>,
}

/// Audit a single user. `Ok(None)` if the user row no longer exists.
pub fn audit_one<S: LedgerSource + ?Sized>(
    src: &S,
    user_id: UserId,
    config: &ReconcileConfig,
) -> ReconcileResult<Option<UserDiscrepancy>> {
    let Some(user) = src.get_user(user_id)? else {
        return Ok(None);
    };
    Ok(Some(discrepancy_for(src, user, config)?))
}

fn discrepancy_for<S: LedgerSource + ?Sized>(
    src: &S,
    user: User,
    config: &ReconcileConfig,
) -> ReconcileResult<UserDiscrepancy> {
    let breakdown = compute_expected_balance(
        src,
        user.id,
        config.starting_grant_cents,
        config.pnl_rounding,
    )?;
    let discrepancy = user.balance_cents - breakdown.expected_cents;

    Ok(UserDiscrepancy {
        user_id: user.id,
        username: user.username,
        wallet_address: user.wallet_address,
        balance_cents: user.balance_cents,
        expected_cents: breakdown.expected_cents,
        discrepancy_cents: discrepancy,
        open_trades_count: breakdown.open_trades_count,
        classification: Classification::classify(discrepancy, breakdown.open_trades_count),
        breakdown,
    })
}

/// Audit every user in `user_ids`. A read failure on one user is recorded
/// and the scan moves on.
pub fn scan<S: LedgerSource + ?Sized>(
    src: &S,
    user_ids: &[UserId],
    config: &ReconcileConfig,
) -> AuditScan {
    let mut out = AuditScan::default();
    out.summary.total_users = user_ids.len() as i64;

    for &user_id in user_ids {
        match audit_one(src, user_id, config) {
            Ok(Some(row)) => out.users.push(row),
            Ok(None) => out.summary.skipped += 1,
            Err(e) => {
                warn!(user_id, error = %e, "Audit read failed, skipping user");
                out.errors.push(AuditError {
                    user_id,
                    error: e.to_string(),
                });
            }
        }
    }

    for row in &out.users {
        out.summary.checked += 1;
        match row.classification {
            Classification::Correct => out.summary.correct += 1,
            Classification::Fixable => out.summary.fixable += 1,
            Classification::NeedsManualReview => out.summary.needs_manual_review += 1,
        }
        if row.discrepancy_cents > 0 {
            out.summary.total_excess_cents += row.discrepancy_cents;
        } else {
            out.summary.total_deficit_cents += -row.discrepancy_cents;
        }
        if row.open_trades_count > 0 {
            out.summary.users_with_open_positions += 1;
        }
    }
    out.summary.errors = out.errors.len() as i64;
    out.summary.net_discrepancy_cents =
        out.summary.total_excess_cents - out.summary.total_deficit_cents;

    // Largest problems first
    out.users.sort_by(|a, b| {
        b.discrepancy_cents
            .abs()
            .cmp(&a.discrepancy_cents.abs())
            .then(a.user_id.cmp(&b.user_id))
    });

    out
}

/// Run an audit over `scope` and log it
pub fn run_audit(
    db: &LedgerDb,
    scope: AuditScope,
    triggered_by: &str,
    config: &ReconcileConfig,
) -> ReconcileResult<AuditReport> {
    // Every user is read from the same snapshot, then the run is logged
    let scan = db.with_snapshot(|conn| {
        let user_ids = match scope {
            AuditScope::All => conn.user_ids()?,
            AuditScope::User(id) => {
                if conn.get_user(id)?.is_none() {
                    return Err(ReconcileError::NotFound(format!("user {}", id)));
                }
                vec![id]
            }
        };
        Ok(scan(conn, &user_ids, config))
    })?;

    let entry = db.with_conn(|conn| {
        history::insert_run(
            conn,
            &NewAuditRun {
                audit_type: AuditType::Full,
                total_users_checked: scan.summary.checked,
                discrepancies_found: scan.summary.fixable + scan.summary.needs_manual_review,
                fixes_applied: 0,
                total_adjustment_cents: 0,
                triggered_by: triggered_by.to_string(),
                notes: audit_notes(scope, &scan.summary),
                rollback_of: None,
            },
        )
    })?;

    let report = AuditReport {
        run_id: entry.id,
        run_at: entry.run_at,
        scope,
        summary: scan.summary,
        users: scan.users,
        errors: scan.errors,
    };

    info!(
        run_id = report.run_id,
        triggered_by,
        checked = report.summary.checked,
        correct = report.summary.correct,
        fixable = report.summary.fixable,
        needs_manual_review = report.summary.needs_manual_review,
        errors = report.summary.errors,
        excess_cents = report.summary.total_excess_cents,
        deficit_cents = report.summary.total_deficit_cents,
        "🔎 Balance audit complete"
    );

    Ok(report)
}

fn audit_notes(scope: AuditScope, summary: &AuditSummary) -> Option<String> {
    let mut parts = Vec::new();
    if let AuditScope::User(id) = scope {
        parts.push(format!("scope=user:{}", id));
    }
    if summary.errors > 0 {
        parts.push(format!("read_errors={}", summary.errors));
    }
    if summary.skipped > 0 {
        parts.push(format!("skipped={}", summary.skipped));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Open position with an optional mark-to-market, for display only
#[derive(Debug, Clone, Serialize)]
pub struct OpenTradeView {
    pub trade_id: i64,
    pub side: TradeSide,
    pub position_size_cents: Cents,
    pub leverage: Decimal,
    pub entry_price: Option<Decimal>,
    pub unrealized_pnl_cents: Option<Cents>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserAuditResult {
    pub run_id: i64,
    pub user: User,
    pub breakdown: ExpectedBalanceBreakdown,
    pub discrepancy_cents: Cents,
    pub classification: Classification,
    pub open_trades: Vec<OpenTradeView>,
    pub current_price: Option<Decimal>,
    /// Sum over open trades. Never part of `expected`.
    pub unrealized_pnl_cents: Option<Cents>,
    pub claims: Vec<ClaimRecord>,
    pub mission_rewards: Vec<MissionRewardRecord>,
    pub referrals: Vec<ReferralRecord>,
}

/// Single-user audit by id, username or wallet. Fails loudly.
pub fn audit_user(
    db: &LedgerDb,
    ident: &UserIdentifier,
    current_price: Option<Decimal>,
    triggered_by: &str,
    config: &ReconcileConfig,
) -> ReconcileResult<UserAuditResult> {
    let mut result = db.with_snapshot(|conn| {
        let user = resolve_user(conn, ident)?;
        let row = discrepancy_for(conn, user.clone(), config)?;

        let open_trades: Vec<OpenTradeView> = conn
            .open_trades(user.id)?
            .iter()
            .map(|t| OpenTradeView {
                trade_id: t.id,
                side: t.side,
                position_size_cents: t.position_size_cents,
                leverage: t.leverage,
                entry_price: t.entry_price,
                unrealized_pnl_cents: current_price.and_then(|p| unrealized_pnl(t, p)),
            })
            .collect();
        let unrealized_pnl_cents = current_price.and_then(|_| {
            open_trades
                .iter()
                .filter_map(|t| t.unrealized_pnl_cents)
                .try_fold(0 as Cents, |acc, c| acc.checked_add(c))
        });

        Ok(UserAuditResult {
            run_id: 0,
            user,
            discrepancy_cents: row.discrepancy_cents,
            classification: row.classification,
            breakdown: row.breakdown,
            open_trades,
            current_price,
            unrealized_pnl_cents,
            claims: conn.claims(row.user_id)?,
            mission_rewards: conn.mission_rewards(row.user_id)?,
            referrals: conn.referrals(row.user_id)?,
        })
    })?;

    let entry = db.with_conn(|conn| {
        history::insert_run(
            conn,
            &NewAuditRun {
                audit_type: AuditType::Full,
                total_users_checked: 1,
                discrepancies_found: (result.classification != Classification::Correct) as i64,
                fixes_applied: 0,
                total_adjustment_cents: 0,
                triggered_by: triggered_by.to_string(),
                notes: Some(format!("scope=user:{}", result.user.id)),
                rollback_of: None,
            },
        )
    })?;
    result.run_id = entry.id;

    info!(
        run_id = result.run_id,
        user_id = result.user.id,
        discrepancy_cents = result.discrepancy_cents,
        "🔎 Single-user audit complete"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(Classification::classify(0, 0), Classification::Correct);
        assert_eq!(Classification::classify(0, 3), Classification::Correct);
        assert_eq!(Classification::classify(-5, 0), Classification::Fixable);
        assert_eq!(
            Classification::classify(5, 1),
            Classification::NeedsManualReview
        );
    }

    #[test]
    fn test_scan_aggregates_and_orders() {
        let db = LedgerDb::in_memory().unwrap();
        let config = ReconcileConfig::default();
        let ok = db.create_user("ok", None, 1_000_000).unwrap();
        let rich = db.create_user("rich", None, 1_000_500).unwrap();
        let poor = db.create_user("poor", None, 998_000).unwrap();

        let scan = db
            .with_conn(|conn| Ok(scan(conn, &[ok.id, rich.id, poor.id, 999], &config)))
            .unwrap();

        assert_eq!(scan.summary.total_users, 4);
        assert_eq!(scan.summary.checked, 3);
        assert_eq!(scan.summary.skipped, 1);
        assert_eq!(scan.summary.correct, 1);
        assert_eq!(scan.summary.fixable, 2);
        assert_eq!(scan.summary.total_excess_cents, 500);
        assert_eq!(scan.summary.total_deficit_cents, 2_000);
        assert_eq!(scan.summary.net_discrepancy_cents, -1_500);

        let order: Vec<UserId> = scan.users.iter().map(|u| u.user_id).collect();
        assert_eq!(order, vec![poor.id, rich.id, ok.id]);
    }

    #[test]
    fn test_single_scope_missing_user_fails() {
        let db = LedgerDb::in_memory().unwrap();
        let err = run_audit(&db, AuditScope::User(7), "test", &ReconcileConfig::default())
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound(_)));
    }
}
