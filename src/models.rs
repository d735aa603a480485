//! Ledger rows and reconciliation records
//!
//! All money is integer cents. Leverage and entry price are exact decimals.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Money in the minor currency unit
pub type Cents = i64;

/// Canonical user identifier
pub type UserId = i64;

/// Player account. `balance_cents` is the single mutable scalar under audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub wallet_address: Option<String>,
    pub balance_cents: Cents,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub id: i64,
    pub user_id: UserId,
    pub amount_cents: Cents,
    pub claimed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionRewardRecord {
    pub id: i64,
    pub user_id: UserId,
    pub mission_id: String,
    pub reward_paid_cents: Cents,
    pub claimed: bool,
}

/// Both sides of a referral pay out independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralRecord {
    pub id: i64,
    pub referrer_id: UserId,
    pub referred_id: UserId,
    pub referrer_reward_cents: Cents,
    pub referred_reward_cents: Cents,
    pub referrer_claimed: bool,
    pub referred_claimed: bool,
}

/// Claimed referral rewards attributed to one user
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralTotals {
    pub given: Cents,
    pub received: Cents,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "liquidated")]
    Liquidated,
    #[serde(rename = "voided")]
    Voided,
}

impl TradeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
            TradeStatus::Liquidated => "liquidated",
            TradeStatus::Voided => "voided",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "open" => Some(TradeStatus::Open),
            "closed" => Some(TradeStatus::Closed),
            "liquidated" => Some(TradeStatus::Liquidated),
            "voided" => Some(TradeStatus::Voided),
            _ => None,
        }
    }

    /// Closed and liquidated trades carry realized P&L
    pub fn is_realized(&self) -> bool {
        matches!(self, TradeStatus::Closed | TradeStatus::Liquidated)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeSide {
    #[serde(rename = "long")]
    Long,
    #[serde(rename = "short")]
    Short,
}

impl TradeSide {
    pub fn as_str(&self) -> &str {
        match self {
            TradeSide::Long => "long",
            TradeSide::Short => "short",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "long" => Some(TradeSide::Long),
            "short" => Some(TradeSide::Short),
            _ => None,
        }
    }
}

/// Trade row as written by the trade engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub user_id: UserId,
    pub side: TradeSide,
    /// Collateral locked while the trade is open
    pub position_size_cents: Cents,
    pub leverage: Decimal,
    pub entry_price: Option<Decimal>,
    pub status: TradeStatus,
    /// Raw realized P&L, set at close
    pub pnl_cents: Option<Cents>,
}

/// Derived, never stored.
/// `expected = starting + claims + missions + ref_given + ref_received + pnl_corrected - collateral`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpectedBalanceBreakdown {
    pub starting_cents: Cents,
    pub claims_cents: Cents,
    pub missions_cents: Cents,
    pub ref_given_cents: Cents,
    pub ref_received_cents: Cents,
    pub pnl_corrected_cents: Cents,
    pub pnl_raw_cents: Cents,
    pub collateral_cents: Cents,
    pub open_trades_count: i64,
    pub expected_cents: Cents,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditType {
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "fix")]
    Fix,
    #[serde(rename = "rollback")]
    Rollback,
}

impl AuditType {
    pub fn as_str(&self) -> &str {
        match self {
            AuditType::Full => "full",
            AuditType::Fix => "fix",
            AuditType::Rollback => "rollback",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "full" => Some(AuditType::Full),
            "fix" => Some(AuditType::Fix),
            "rollback" => Some(AuditType::Rollback),
            _ => None,
        }
    }
}

/// Append-only history row. Only `rolled_back_at` ever changes, once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRunLogEntry {
    pub id: i64,
    pub audit_type: AuditType,
    pub run_at: DateTime<Utc>,
    pub total_users_checked: i64,
    pub discrepancies_found: i64,
    pub fixes_applied: i64,
    pub total_adjustment_cents: Cents,
    pub triggered_by: String,
    pub notes: Option<String>,
    pub rollback_of: Option<i64>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

/// Insert payload for [`AuditRunLogEntry`]
#[derive(Debug, Clone)]
pub struct NewAuditRun {
    pub audit_type: AuditType,
    pub total_users_checked: i64,
    pub discrepancies_found: i64,
    pub fixes_applied: i64,
    pub total_adjustment_cents: Cents,
    pub triggered_by: String,
    pub notes: Option<String>,
    pub rollback_of: Option<i64>,
}

/// Per-user undo data for one fix. The only source of truth for a rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixRecord {
    pub user_id: UserId,
    pub username: String,
    pub previous_balance_cents: Cents,
    pub new_balance_cents: Cents,
    pub adjustment_cents: Cents,
    pub had_open_positions: bool,
}
