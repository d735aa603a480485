//! Ledger source readers
//!
//! The read-only collaborator interface the reconciler consumes. Implemented
//! for [`rusqlite::Connection`], so the same readers work on a plain
//! connection, inside a transaction, or inside a savepoint (both deref to
//! `Connection`).

use crate::error::ReconcileResult;
use crate::models::{
    Cents, ClaimRecord, MissionRewardRecord, ReferralRecord, ReferralTotals, Trade, TradeSide,
    TradeStatus, User, UserId,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::str::FromStr;

pub trait LedgerSource {
    /// Every user id, ascending
    fn user_ids(&self) -> ReconcileResult<Vec<UserId>>;

    fn get_user(&self, user_id: UserId) -> ReconcileResult<Option<User>>;

    fn find_user_by_username(&self, username: &str) -> ReconcileResult<Option<User>>;

    fn find_user_by_wallet(&self, wallet_address: &str) -> ReconcileResult<Option<User>>;

    fn user_balance(&self, user_id: UserId) -> ReconcileResult<Option<Cents>>;

    fn claims_total(&self, user_id: UserId) -> ReconcileResult<Cents>;

    /// Only rows with `claimed = true`
    fn claimed_mission_rewards_total(&self, user_id: UserId) -> ReconcileResult<Cents>;

    /// Each side counts only once that side has claimed
    fn claimed_referral_rewards(&self, user_id: UserId) -> ReconcileResult<ReferralTotals>;

    /// Closed and liquidated trades
    fn closed_trades(&self, user_id: UserId) -> ReconcileResult<Vec<Trade>>;

    fn open_trades(&self, user_id: UserId) -> ReconcileResult<Vec<Trade>>;

    /// Row-level detail behind the totals, for single-user drill-down
    fn claims(&self, user_id: UserId) -> ReconcileResult<Vec<ClaimRecord>>;

    fn mission_rewards(&self, user_id: UserId) -> ReconcileResult<Vec<MissionRewardRecord>>;

    /// Referrals on either side, claimed or not
    fn referrals(&self, user_id: UserId) -> ReconcileResult<Vec<ReferralRecord>>;
}

const USER_COLUMNS: &str = "id, username, wallet_address, balance_cents, created_at";
const TRADE_COLUMNS: &str =
    "id, user_id, side, position_size_cents, leverage, entry_price, status, pnl_cents";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        wallet_address: row.get(2)?,
        balance_cents: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(raw.trim())
        .map_err(|e| conversion_error(idx, format!("bad decimal '{}': {}", raw, e)))
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<Trade> {
    let side_str: String = row.get(2)?;
    let side = TradeSide::from_str(&side_str)
        .ok_or_else(|| conversion_error(2, format!("unknown trade side '{}'", side_str)))?;
    let status_str: String = row.get(6)?;
    let status = TradeStatus::from_str(&status_str)
        .ok_or_else(|| conversion_error(6, format!("unknown trade status '{}'", status_str)))?;
    let entry_price = match row.get::<_, Option<String>>(5)? {
        Some(_) => Some(decimal_column(row, 5)?),
        None => None,
    };

    Ok(Trade {
        id: row.get(0)?,
        user_id: row.get(1)?,
        side,
        position_size_cents: row.get(3)?,
        leverage: decimal_column(row, 4)?,
        entry_price,
        status,
        pnl_cents: row.get(7)?,
    })
}

impl LedgerSource for Connection {
    fn user_ids(&self) -> ReconcileResult<Vec<UserId>> {
        let mut stmt = self.prepare_cached("SELECT id FROM users ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn get_user(&self, user_id: UserId) -> ReconcileResult<Option<User>> {
        let mut stmt =
            self.prepare_cached(&format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS))?;
        Ok(stmt.query_row([user_id], user_from_row).optional()?)
    }

    fn find_user_by_username(&self, username: &str) -> ReconcileResult<Option<User>> {
        let mut stmt = self.prepare_cached(&format!(
            "SELECT {} FROM users WHERE username = ?1",
            USER_COLUMNS
        ))?;
        Ok(stmt.query_row([username], user_from_row).optional()?)
    }

    fn find_user_by_wallet(&self, wallet_address: &str) -> ReconcileResult<Option<User>> {
        let wallet = wallet_address.trim().to_lowercase();
        let mut stmt = self.prepare_cached(&format!(
            "SELECT {} FROM users WHERE wallet_address = ?1",
            USER_COLUMNS
        ))?;
        Ok(stmt.query_row([wallet], user_from_row).optional()?)
    }

    fn user_balance(&self, user_id: UserId) -> ReconcileResult<Option<Cents>> {
        let mut stmt = self.prepare_cached("SELECT balance_cents FROM users WHERE id = ?1")?;
        Ok(stmt.query_row([user_id], |row| row.get(0)).optional()?)
    }

    fn claims_total(&self, user_id: UserId) -> ReconcileResult<Cents> {
        let mut stmt = self.prepare_cached(
            "SELECT COALESCE(SUM(amount_cents), 0) FROM claims WHERE user_id = ?1",
        )?;
        Ok(stmt.query_row([user_id], |row| row.get(0))?)
    }

    fn claimed_mission_rewards_total(&self, user_id: UserId) -> ReconcileResult<Cents> {
        let mut stmt = self.prepare_cached(
            "SELECT COALESCE(SUM(reward_paid_cents), 0) FROM mission_rewards
             WHERE user_id = ?1 AND claimed = 1",
        )?;
        Ok(stmt.query_row([user_id], |row| row.get(0))?)
    }

    fn claimed_referral_rewards(&self, user_id: UserId) -> ReconcileResult<ReferralTotals> {
        let mut stmt = self.prepare_cached(
            "SELECT
                COALESCE((SELECT SUM(referrer_reward_cents) FROM referrals
                          WHERE referrer_id = ?1 AND referrer_claimed = 1), 0),
                COALESCE((SELECT SUM(referred_reward_cents) FROM referrals
                          WHERE referred_id = ?1 AND referred_claimed = 1), 0)",
        )?;
        let totals = stmt.query_row(params![user_id], |row| {
            Ok(ReferralTotals {
                given: row.get(0)?,
                received: row.get(1)?,
            })
        })?;
        Ok(totals)
    }

    fn closed_trades(&self, user_id: UserId) -> ReconcileResult<Vec<Trade>> {
        let mut stmt = self.prepare_cached(&format!(
            "SELECT {} FROM trades
             WHERE user_id = ?1 AND status IN ('closed', 'liquidated')
             ORDER BY id ASC",
            TRADE_COLUMNS
        ))?;
        let trades = stmt
            .query_map([user_id], trade_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    fn open_trades(&self, user_id: UserId) -> ReconcileResult<Vec<Trade>> {
        let mut stmt = self.prepare_cached(&format!(
            "SELECT {} FROM trades WHERE user_id = ?1 AND status = 'open' ORDER BY id ASC",
            TRADE_COLUMNS
        ))?;
        let trades = stmt
            .query_map([user_id], trade_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    fn claims(&self, user_id: UserId) -> ReconcileResult<Vec<ClaimRecord>> {
        let mut stmt = self.prepare_cached(
            "SELECT id, user_id, amount_cents, claimed_at FROM claims
             WHERE user_id = ?1 ORDER BY id ASC",
        )?;
        let claims = stmt
            .query_map([user_id], |row| {
                Ok(ClaimRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    amount_cents: row.get(2)?,
                    claimed_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(claims)
    }

    fn mission_rewards(&self, user_id: UserId) -> ReconcileResult<Vec<MissionRewardRecord>> {
        let mut stmt = self.prepare_cached(
            "SELECT id, user_id, mission_id, reward_paid_cents, claimed FROM mission_rewards
             WHERE user_id = ?1 ORDER BY id ASC",
        )?;
        let rewards = stmt
            .query_map([user_id], |row| {
                Ok(MissionRewardRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    mission_id: row.get(2)?,
                    reward_paid_cents: row.get(3)?,
                    claimed: row.get::<_, i64>(4)? == 1,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rewards)
    }

    fn referrals(&self, user_id: UserId) -> ReconcileResult<Vec<ReferralRecord>> {
        let mut stmt = self.prepare_cached(
            "SELECT id, referrer_id, referred_id, referrer_reward_cents, referred_reward_cents,
                    referrer_claimed, referred_claimed
             FROM referrals WHERE referrer_id = ?1 OR referred_id = ?1 ORDER BY id ASC",
        )?;
        let referrals = stmt
            .query_map([user_id], |row| {
                Ok(ReferralRecord {
                    id: row.get(0)?,
                    referrer_id: row.get(1)?,
                    referred_id: row.get(2)?,
                    referrer_reward_cents: row.get(3)?,
                    referred_reward_cents: row.get(4)?,
                    referrer_claimed: row.get::<_, i64>(5)? == 1,
                    referred_claimed: row.get::<_, i64>(6)? == 1,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(referrals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerDb;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reward_totals_respect_claimed_flags() {
        let db = LedgerDb::in_memory().unwrap();
        let alice = db.create_user("alice", None, 0).unwrap();
        let bob = db.create_user("bob", None, 0).unwrap();

        db.insert_mission_reward(alice.id, "m1", 5_000, true).unwrap();
        db.insert_mission_reward(alice.id, "m2", 7_000, false).unwrap();

        let referral = db.insert_referral(alice.id, bob.id, 2_500, 1_000).unwrap();
        // Only the referred side has claimed so far
        db.claim_referral(referral, false).unwrap();

        db.with_conn(|conn| {
            assert_eq!(conn.claimed_mission_rewards_total(alice.id)?, 5_000);
            assert_eq!(
                conn.claimed_referral_rewards(alice.id)?,
                ReferralTotals { given: 0, received: 0 }
            );
            assert_eq!(
                conn.claimed_referral_rewards(bob.id)?,
                ReferralTotals { given: 0, received: 1_000 }
            );
            Ok(())
        })
        .unwrap();

        db.claim_referral(referral, true).unwrap();
        let totals = db
            .with_conn(|conn| conn.claimed_referral_rewards(alice.id))
            .unwrap();
        assert_eq!(totals.given, 2_500);
    }

    #[test]
    fn test_trade_partitions() {
        let db = LedgerDb::in_memory().unwrap();
        let user = db.create_user("trader", None, 1_000_000).unwrap();

        let t1 = db
            .open_trade(user.id, TradeSide::Long, 10_000, dec!(5), None)
            .unwrap();
        let t2 = db
            .open_trade(user.id, TradeSide::Short, 20_000, dec!(2.5), Some(dec!(64000.5)))
            .unwrap();
        let t3 = db
            .open_trade(user.id, TradeSide::Long, 30_000, dec!(1), None)
            .unwrap();
        db.settle_trade(t1, TradeStatus::Liquidated, -10_000, 0).unwrap();
        db.void_trade(t3).unwrap();

        db.with_conn(|conn| {
            let closed = conn.closed_trades(user.id)?;
            assert_eq!(closed.len(), 1);
            assert_eq!(closed[0].status, TradeStatus::Liquidated);
            assert_eq!(closed[0].pnl_cents, Some(-10_000));

            let open = conn.open_trades(user.id)?;
            assert_eq!(open.len(), 1);
            assert_eq!(open[0].id, t2);
            assert_eq!(open[0].leverage, dec!(2.5));
            assert_eq!(open[0].entry_price, Some(dec!(64000.5)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_malformed_trade_row_is_read_error() {
        let db = LedgerDb::in_memory().unwrap();
        let user = db.create_user("broken", None, 0).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trades (user_id, side, position_size_cents, leverage, status, pnl_cents, opened_at)
                 VALUES (?1, 'long', 100, 'ten', 'closed', 5, '2025-01-01T00:00:00Z')",
                [user.id],
            )?;
            Ok(())
        })
        .unwrap();

        let result = db.with_conn(|conn| conn.closed_trades(user.id));
        assert!(result.is_err());
    }

    #[test]
    fn test_lookup_by_wallet_is_case_insensitive() {
        let db = LedgerDb::in_memory().unwrap();
        let user = db
            .create_user("walleted", Some("0xAbCdEf0000000000000000000000000000000001"), 0)
            .unwrap();
        let found = db
            .with_conn(|conn| {
                conn.find_user_by_wallet("0xABCDEF0000000000000000000000000000000001")
            })
            .unwrap();
        assert_eq!(found.map(|u| u.id), Some(user.id));
    }
}
