//! Balance formula evaluator
//!
//! `expected = starting + claims + missions + ref_given + ref_received
//!             + corrected_pnl - open_collateral`
//!
//! Components are gathered in a fixed order and combined by a pure function,
//! so the same rows always produce the same breakdown.

use crate::config::PnlRounding;
use crate::error::{ReconcileError, ReconcileResult};
use crate::ledger::LedgerSource;
use crate::models::{Cents, ExpectedBalanceBreakdown, ReferralTotals, Trade, TradeSide, UserId};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Realized P&L of one trade as the audit counts it.
///
/// Stored `pnl_cents` is measured against the leveraged notional; dividing by
/// leverage brings it back to collateral terms. Exact decimal division.
pub fn corrected_pnl(trade: &Trade) -> Decimal {
    let pnl = Decimal::from(trade.pnl_cents.unwrap_or(0));
    if trade.leverage > Decimal::ONE {
        pnl / trade.leverage
    } else {
        pnl
    }
}

/// Nearest cent, halves away from zero
pub fn round_cents(value: Decimal) -> ReconcileResult<Cents> {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ReconcileError::InvalidRequest(format!("{} cents out of range", value)))
}

/// Display-only mark-to-market of an open trade at `current_price`.
/// `None` when the trade has no usable entry price or the price is so far
/// out that the result does not fit.
pub fn unrealized_pnl(trade: &Trade, current_price: Decimal) -> Option<Cents> {
    let entry = trade.entry_price.filter(|p| *p > Decimal::ZERO)?;
    let notional = Decimal::from(trade.position_size_cents).checked_mul(trade.leverage)?;
    let mut pnl = notional
        .checked_mul(current_price.checked_sub(entry)?)?
        .checked_div(entry)?;
    if trade.side == TradeSide::Short {
        pnl = -pnl;
    }
    round_cents(pnl).ok()
}

/// Raw rows feeding one user's formula
#[derive(Debug, Clone, Default)]
pub struct LedgerInputs {
    pub starting_cents: Cents,
    pub claims_cents: Cents,
    pub missions_cents: Cents,
    pub referrals: ReferralTotals,
    pub closed_trades: Vec<Trade>,
    pub open_trades: Vec<Trade>,
}

impl LedgerInputs {
    /// Read every component for `user_id`, in formula order
    pub fn gather<S: LedgerSource + ?Sized>(
        src: &S,
        user_id: UserId,
        starting_grant_cents: Cents,
    ) -> ReconcileResult<Self> {
        Ok(Self {
            starting_cents: starting_grant_cents,
            claims_cents: src.claims_total(user_id)?,
            missions_cents: src.claimed_mission_rewards_total(user_id)?,
            referrals: src.claimed_referral_rewards(user_id)?,
            closed_trades: src.closed_trades(user_id)?,
            open_trades: src.open_trades(user_id)?,
        })
    }
}

/// Combine gathered inputs into the breakdown. No I/O.
pub fn evaluate(
    inputs: &LedgerInputs,
    rounding: PnlRounding,
) -> ReconcileResult<ExpectedBalanceBreakdown> {
    let mut pnl_raw: Cents = 0;
    let mut pnl_exact = Decimal::ZERO;
    let mut pnl_rounded_each: Cents = 0;

    for trade in inputs.closed_trades.iter().filter(|t| t.status.is_realized()) {
        pnl_raw += trade.pnl_cents.unwrap_or(0);
        let corrected = corrected_pnl(trade);
        pnl_exact += corrected;
        pnl_rounded_each += round_cents(corrected)?;
    }

    let pnl_corrected = match rounding {
        PnlRounding::Aggregate => round_cents(pnl_exact)?,
        PnlRounding::PerTrade => pnl_rounded_each,
    };

    let collateral: Cents = inputs
        .open_trades
        .iter()
        .map(|t| t.position_size_cents)
        .sum();

    let expected = inputs.starting_cents
        + inputs.claims_cents
        + inputs.missions_cents
        + inputs.referrals.given
        + inputs.referrals.received
        + pnl_corrected
        - collateral;

    Ok(ExpectedBalanceBreakdown {
        starting_cents: inputs.starting_cents,
        claims_cents: inputs.claims_cents,
        missions_cents: inputs.missions_cents,
        ref_given_cents: inputs.referrals.given,
        ref_received_cents: inputs.referrals.received,
        pnl_corrected_cents: pnl_corrected,
        pnl_raw_cents: pnl_raw,
        collateral_cents: collateral,
        open_trades_count: inputs.open_trades.len() as i64,
        expected_cents: expected,
    })
}

/// Read and evaluate the expected balance of one user
pub fn compute_expected_balance<S: LedgerSource + ?Sized>(
    src: &S,
    user_id: UserId,
    starting_grant_cents: Cents,
    rounding: PnlRounding,
) -> ReconcileResult<ExpectedBalanceBreakdown> {
    let inputs = LedgerInputs::gather(src, user_id, starting_grant_cents)?;
    evaluate(&inputs, rounding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeStatus;
    use rust_decimal_macros::dec;

    fn closed(pnl: Cents, leverage: Decimal) -> Trade {
        Trade {
            id: 0,
            user_id: 1,
            side: TradeSide::Long,
            position_size_cents: 50_000,
            leverage,
            entry_price: None,
            status: TradeStatus::Closed,
            pnl_cents: Some(pnl),
        }
    }

    fn open(size: Cents) -> Trade {
        Trade {
            id: 0,
            user_id: 1,
            side: TradeSide::Long,
            position_size_cents: size,
            leverage: dec!(1),
            entry_price: Some(dec!(100)),
            status: TradeStatus::Open,
            pnl_cents: None,
        }
    }

    fn base() -> LedgerInputs {
        LedgerInputs {
            starting_cents: 1_000_000,
            claims_cents: 100_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_corrected_pnl_rule() {
        assert_eq!(corrected_pnl(&closed(20_000, dec!(10))), dec!(2000));
        assert_eq!(corrected_pnl(&closed(20_000, dec!(1))), dec!(20000));
        // Leverage below 1 is left alone
        assert_eq!(corrected_pnl(&closed(-300, dec!(0.5))), dec!(-300));
        assert_eq!(corrected_pnl(&closed(100, dec!(3))), dec!(100) / dec!(3));
    }

    #[test]
    fn test_claims_only() {
        let b = evaluate(&base(), PnlRounding::Aggregate).unwrap();
        assert_eq!(b.expected_cents, 1_100_000);
        assert_eq!(b.open_trades_count, 0);
    }

    #[test]
    fn test_closed_and_open_trades() {
        let mut inputs = base();
        inputs.closed_trades.push(closed(20_000, dec!(10)));
        let b = evaluate(&inputs, PnlRounding::Aggregate).unwrap();
        assert_eq!(b.pnl_raw_cents, 20_000);
        assert_eq!(b.pnl_corrected_cents, 2_000);
        assert_eq!(b.expected_cents, 1_102_000);

        inputs.open_trades.push(open(30_000));
        let b = evaluate(&inputs, PnlRounding::Aggregate).unwrap();
        assert_eq!(b.collateral_cents, 30_000);
        assert_eq!(b.open_trades_count, 1);
        assert_eq!(b.expected_cents, 1_072_000);
    }

    #[test]
    fn test_aggregate_vs_per_trade_rounding() {
        // 1/3 + 1/3 + 1/3: exact sum is 1 cent, per-trade rounding gives 0
        let mut inputs = LedgerInputs::default();
        for _ in 0..3 {
            inputs.closed_trades.push(closed(1, dec!(3)));
        }
        let agg = evaluate(&inputs, PnlRounding::Aggregate).unwrap();
        let per = evaluate(&inputs, PnlRounding::PerTrade).unwrap();
        assert_eq!(agg.pnl_corrected_cents, 1);
        assert_eq!(per.pnl_corrected_cents, 0);
    }

    #[test]
    fn test_rounding_half_away_from_zero() {
        assert_eq!(round_cents(dec!(2.5)).unwrap(), 3);
        assert_eq!(round_cents(dec!(-2.5)).unwrap(), -3);
        assert_eq!(round_cents(dec!(2.49)).unwrap(), 2);
    }

    #[test]
    fn test_collateral_only_moves_expected() {
        let mut inputs = base();
        inputs.missions_cents = 4_000;
        let before = evaluate(&inputs, PnlRounding::Aggregate).unwrap();
        inputs.open_trades.push(open(12_345));
        let after = evaluate(&inputs, PnlRounding::Aggregate).unwrap();

        assert_eq!(before.expected_cents - after.expected_cents, 12_345);
        assert_eq!(before.claims_cents, after.claims_cents);
        assert_eq!(before.missions_cents, after.missions_cents);
        assert_eq!(before.ref_given_cents, after.ref_given_cents);
        assert_eq!(before.ref_received_cents, after.ref_received_cents);
    }

    #[test]
    fn test_unrealized_display() {
        let mut trade = open(10_000);
        trade.leverage = dec!(5);
        // +10% move on 50,000 notional
        assert_eq!(unrealized_pnl(&trade, dec!(110)), Some(5_000));
        trade.side = TradeSide::Short;
        assert_eq!(unrealized_pnl(&trade, dec!(110)), Some(-5_000));
        trade.entry_price = None;
        assert_eq!(unrealized_pnl(&trade, dec!(110)), None);
    }

    #[test]
    fn test_unrealized_extreme_price_is_none() {
        let mut trade = open(10_000);
        trade.leverage = dec!(5);
        assert_eq!(unrealized_pnl(&trade, Decimal::MAX), None);
        assert_eq!(unrealized_pnl(&trade, Decimal::MIN), None);
        trade.side = TradeSide::Short;
        assert_eq!(unrealized_pnl(&trade, Decimal::MAX), None);
    }
}
