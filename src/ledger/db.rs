//! SQLite-backed ledger storage
//!
//! Holds user balances, the reward/trade rows written by the owning
//! subsystems, and the reconciliation history tables.
//!
//! - WAL mode so audits can read while the trade engine writes
//! - One connection behind a mutex; reconciliation runs inside
//!   `BEGIN IMMEDIATE` transactions so no other writer interleaves
//! - The only absolute balance write is the conditional [`set_balance_if`]

use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{Cents, TradeSide, TradeStatus, User, UserId};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    wallet_address TEXT UNIQUE,
    balance_cents INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS claims (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    amount_cents INTEGER NOT NULL,
    claimed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_claims_user ON claims(user_id);

CREATE TABLE IF NOT EXISTS mission_rewards (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    mission_id TEXT NOT NULL,
    reward_paid_cents INTEGER NOT NULL,
    claimed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_mission_rewards_user ON mission_rewards(user_id);

CREATE TABLE IF NOT EXISTS referrals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    referrer_id INTEGER NOT NULL REFERENCES users(id),
    referred_id INTEGER NOT NULL REFERENCES users(id),
    referrer_reward_cents INTEGER NOT NULL,
    referred_reward_cents INTEGER NOT NULL,
    referrer_claimed INTEGER NOT NULL DEFAULT 0,
    referred_claimed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_referrals_referrer ON referrals(referrer_id);
CREATE INDEX IF NOT EXISTS idx_referrals_referred ON referrals(referred_id);

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    side TEXT NOT NULL,
    position_size_cents INTEGER NOT NULL,
    leverage TEXT NOT NULL,
    entry_price TEXT,
    status TEXT NOT NULL,
    pnl_cents INTEGER,
    opened_at TEXT NOT NULL,
    closed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_trades_user_status ON trades(user_id, status);

CREATE TABLE IF NOT EXISTS audit_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_type TEXT NOT NULL,
    run_at TEXT NOT NULL,
    total_users_checked INTEGER NOT NULL,
    discrepancies_found INTEGER NOT NULL,
    fixes_applied INTEGER NOT NULL,
    total_adjustment_cents INTEGER NOT NULL,
    triggered_by TEXT NOT NULL,
    notes TEXT,
    rollback_of INTEGER REFERENCES audit_runs(id),
    rolled_back_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_runs_recent ON audit_runs(id DESC);

CREATE TABLE IF NOT EXISTS fix_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_run_id INTEGER NOT NULL REFERENCES audit_runs(id),
    user_id INTEGER NOT NULL,
    username TEXT NOT NULL,
    previous_balance_cents INTEGER NOT NULL,
    new_balance_cents INTEGER NOT NULL,
    adjustment_cents INTEGER NOT NULL,
    had_open_positions INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_fix_records_run ON fix_records(audit_run_id);
"#;

/// Ledger database handle
#[derive(Clone)]
pub struct LedgerDb {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerDb {
    /// Open (or create) the ledger database and apply the schema
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open ledger database at {}", db_path))?;
        let db = Self::from_connection(conn)?;

        let users: i64 = db
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📒 Ledger database ready at {} ({} users)", db_path, users);

        Ok(db)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory ledger")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize ledger schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" && journal_mode.to_lowercase() != "memory" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run read-only work against the connection
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> ReconcileResult<T>,
    ) -> ReconcileResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run reads against one consistent snapshot. The DEFERRED transaction
    /// pins the WAL read mark at its first SELECT, so commits from other
    /// connections stay invisible until `f` returns.
    pub fn with_snapshot<T>(
        &self,
        f: impl FnOnce(&Connection) -> ReconcileResult<T>,
    ) -> ReconcileResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` inside an IMMEDIATE transaction; commit on `Ok`, roll back on `Err`
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> ReconcileResult<T>,
    ) -> ReconcileResult<T> {
        let mut conn = self.conn.lock();
        let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&mut tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Writes owned by the surrounding subsystems (accounts, claims,
    // missions, referrals, trade engine). Reconciliation never calls these.
    // ------------------------------------------------------------------

    /// Register a new account funded with `balance_cents`
    pub fn create_user(
        &self,
        username: &str,
        wallet_address: Option<&str>,
        balance_cents: Cents,
    ) -> Result<User> {
        let conn = self.conn.lock();
        let created_at = Utc::now().to_rfc3339();
        let wallet = wallet_address.map(|w| w.trim().to_lowercase());

        conn.execute(
            "INSERT INTO users (username, wallet_address, balance_cents, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, wallet, balance_cents, created_at],
        )
        .with_context(|| format!("Failed to insert user {}", username))?;

        Ok(User {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            wallet_address: wallet,
            balance_cents,
            created_at,
        })
    }

    /// Remove an account and every row attributed to it
    pub fn delete_user(&self, user_id: UserId) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM claims WHERE user_id = ?1", [user_id])?;
        tx.execute("DELETE FROM mission_rewards WHERE user_id = ?1", [user_id])?;
        tx.execute(
            "DELETE FROM referrals WHERE referrer_id = ?1 OR referred_id = ?1",
            [user_id],
        )?;
        tx.execute("DELETE FROM trades WHERE user_id = ?1", [user_id])?;
        let rows = tx.execute("DELETE FROM users WHERE id = ?1", [user_id])?;
        if rows == 0 {
            anyhow::bail!("User not found");
        }
        tx.commit()?;
        Ok(())
    }

    /// Signed delta applied atomically in SQL (no read-modify-write)
    pub fn adjust_balance(&self, user_id: UserId, delta_cents: Cents) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE users SET balance_cents = balance_cents + ?1 WHERE id = ?2",
            params![delta_cents, user_id],
        )?;
        if rows == 0 {
            anyhow::bail!("User not found");
        }
        Ok(())
    }

    /// Claim credits the balance and records the claim in one transaction
    pub fn record_claim(&self, user_id: UserId, amount_cents: Cents) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO claims (user_id, amount_cents, claimed_at) VALUES (?1, ?2, ?3)",
            params![user_id, amount_cents, Utc::now().to_rfc3339()],
        )
        .context("Failed to insert claim")?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE users SET balance_cents = balance_cents + ?1 WHERE id = ?2",
            params![amount_cents, user_id],
        )?;
        tx.commit()?;
        Ok(id)
    }

    pub fn insert_mission_reward(
        &self,
        user_id: UserId,
        mission_id: &str,
        reward_paid_cents: Cents,
        claimed: bool,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mission_rewards (user_id, mission_id, reward_paid_cents, claimed)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, mission_id, reward_paid_cents, claimed as i64],
        )
        .context("Failed to insert mission reward")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_referral(
        &self,
        referrer_id: UserId,
        referred_id: UserId,
        referrer_reward_cents: Cents,
        referred_reward_cents: Cents,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO referrals
             (referrer_id, referred_id, referrer_reward_cents, referred_reward_cents)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                referrer_id,
                referred_id,
                referrer_reward_cents,
                referred_reward_cents
            ],
        )
        .context("Failed to insert referral")?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark one side of a referral as claimed
    pub fn claim_referral(&self, referral_id: i64, referrer_side: bool) -> Result<()> {
        let sql = if referrer_side {
            "UPDATE referrals SET referrer_claimed = 1 WHERE id = ?1"
        } else {
            "UPDATE referrals SET referred_claimed = 1 WHERE id = ?1"
        };
        let conn = self.conn.lock();
        let rows = conn.execute(sql, [referral_id])?;
        if rows == 0 {
            anyhow::bail!("Referral not found");
        }
        Ok(())
    }

    /// Open a position; the collateral is debited from the balance
    pub fn open_trade(
        &self,
        user_id: UserId,
        side: TradeSide,
        position_size_cents: Cents,
        leverage: Decimal,
        entry_price: Option<Decimal>,
    ) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO trades
             (user_id, side, position_size_cents, leverage, entry_price, status, opened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6)",
            params![
                user_id,
                side.as_str(),
                position_size_cents,
                leverage.to_string(),
                entry_price.map(|p| p.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert trade")?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE users SET balance_cents = balance_cents - ?1 WHERE id = ?2",
            params![position_size_cents, user_id],
        )?;
        tx.commit()?;
        Ok(id)
    }

    /// Settle a trade as closed or liquidated with its raw P&L.
    /// Returns `credit_cents` (collateral + whatever the trade engine pays out)
    /// to the balance.
    pub fn settle_trade(
        &self,
        trade_id: i64,
        status: TradeStatus,
        pnl_cents: Cents,
        credit_cents: Cents,
    ) -> Result<()> {
        if !status.is_realized() {
            anyhow::bail!("settle_trade requires closed or liquidated status");
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let user_id: Option<UserId> = tx
            .query_row(
                "SELECT user_id FROM trades WHERE id = ?1 AND status = 'open'",
                [trade_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(user_id) = user_id else {
            anyhow::bail!("Open trade {} not found", trade_id);
        };
        tx.execute(
            "UPDATE trades SET status = ?1, pnl_cents = ?2, closed_at = ?3 WHERE id = ?4",
            params![
                status.as_str(),
                pnl_cents,
                Utc::now().to_rfc3339(),
                trade_id
            ],
        )?;
        tx.execute(
            "UPDATE users SET balance_cents = balance_cents + ?1 WHERE id = ?2",
            params![credit_cents, user_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Void a trade. Voided trades never count toward the expected balance.
    pub fn void_trade(&self, trade_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE trades SET status = 'voided' WHERE id = ?1",
            [trade_id],
        )?;
        if rows == 0 {
            anyhow::bail!("Trade {} not found", trade_id);
        }
        Ok(())
    }
}

/// Compare-and-swap balance write: `UPDATE .. WHERE balance_cents = expected_current`.
///
/// `Ok(false)` means the precondition no longer held (or the row is gone).
pub fn set_balance_if(
    conn: &Connection,
    user_id: UserId,
    expected_current: Cents,
    new_balance: Cents,
) -> ReconcileResult<bool> {
    let rows = conn.execute(
        "UPDATE users SET balance_cents = ?1 WHERE id = ?2 AND balance_cents = ?3",
        params![new_balance, user_id, expected_current],
    )?;
    Ok(rows == 1)
}

/// Unconditional absolute write, used only for a literal rollback restore
pub fn set_balance(conn: &Connection, user_id: UserId, new_balance: Cents) -> ReconcileResult<()> {
    let rows = conn.execute(
        "UPDATE users SET balance_cents = ?1 WHERE id = ?2",
        params![new_balance, user_id],
    )?;
    if rows == 0 {
        return Err(ReconcileError::NotFound(format!("user {}", user_id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerSource;
    use rust_decimal_macros::dec;
    use tempfile::NamedTempFile;

    fn balance_of(db: &LedgerDb, user_id: UserId) -> Cents {
        db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT balance_cents FROM users WHERE id = ?1",
                [user_id],
                |row| row.get(0),
            )?)
        })
        .unwrap()
    }

    #[test]
    fn test_open_on_disk() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = LedgerDb::new(temp_file.path().to_str().unwrap()).unwrap();
        let user = db.create_user("alice", Some("0xABC"), 1_000_000).unwrap();
        assert_eq!(user.wallet_address.as_deref(), Some("0xabc"));

        // Reopen: schema creation is idempotent and data persists
        drop(db);
        let db = LedgerDb::new(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(balance_of(&db, user.id), 1_000_000);
    }

    #[test]
    fn test_conditional_write() {
        let db = LedgerDb::in_memory().unwrap();
        let user = db.create_user("bob", None, 500).unwrap();

        let applied = db
            .with_conn(|conn| set_balance_if(conn, user.id, 400, 900))
            .unwrap();
        assert!(!applied);
        assert_eq!(balance_of(&db, user.id), 500);

        let applied = db
            .with_conn(|conn| set_balance_if(conn, user.id, 500, 900))
            .unwrap();
        assert!(applied);
        assert_eq!(balance_of(&db, user.id), 900);
    }

    #[test]
    fn test_trade_lifecycle_moves_balance() {
        let db = LedgerDb::in_memory().unwrap();
        let user = db.create_user("carol", None, 1_000_000).unwrap();

        let trade = db
            .open_trade(user.id, TradeSide::Long, 50_000, dec!(10), Some(dec!(100)))
            .unwrap();
        assert_eq!(balance_of(&db, user.id), 950_000);

        db.settle_trade(trade, TradeStatus::Closed, 20_000, 52_000)
            .unwrap();
        assert_eq!(balance_of(&db, user.id), 1_002_000);

        // Already settled
        assert!(db
            .settle_trade(trade, TradeStatus::Closed, 0, 0)
            .is_err());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = LedgerDb::in_memory().unwrap();
        let user = db.create_user("dave", None, 100).unwrap();

        let result: ReconcileResult<()> = db.with_transaction(|tx| {
            set_balance(tx, user.id, 999)?;
            Err(ReconcileError::InvalidRequest("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(balance_of(&db, user.id), 100);
    }

    #[test]
    fn test_set_balance_missing_user() {
        let db = LedgerDb::in_memory().unwrap();
        let err = db.with_conn(|conn| set_balance(conn, 42, 1)).unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound(_)));
    }

    #[test]
    fn test_snapshot_hides_concurrent_commits() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();
        let db = LedgerDb::new(&path).unwrap();
        let user = db.create_user("erin", None, 1_000_000).unwrap();
        db.open_trade(user.id, TradeSide::Long, 50_000, dec!(10), Some(dec!(100)))
            .unwrap();

        // Trade engine settling through its own connection mid-audit
        let engine = Connection::open(&path).unwrap();

        let (open_before, open_after, closed_after) = db
            .with_snapshot(|conn| {
                let open_before = conn.open_trades(user.id)?.len();
                engine.execute(
                    "UPDATE trades SET status = 'closed', pnl_cents = 0 WHERE user_id = ?1",
                    [user.id],
                )?;
                engine.execute(
                    "UPDATE users SET balance_cents = balance_cents + 50000 WHERE id = ?1",
                    [user.id],
                )?;
                let open_after = conn.open_trades(user.id)?.len();
                let closed_after = conn.closed_trades(user.id)?.len();
                Ok((open_before, open_after, closed_after))
            })
            .unwrap();

        assert_eq!(open_before, 1);
        assert_eq!(open_after, 1);
        assert_eq!(closed_after, 0);

        // Visible once the snapshot ends
        let closed = db.with_conn(|conn| conn.closed_trades(user.id)).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(balance_of(&db, user.id), 1_000_000);
    }
}
