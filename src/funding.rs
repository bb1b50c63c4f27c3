// 5.0: funding. every 8hrs the paying side is charged a fixed fraction of entry notional.
// 5.0 has the params, 5.1 the per-interval charge, 5.2 the checkpointed accrual.
// accrual is idempotent by checkpoint: replaying a tick at the same timestamp charges nothing.

use crate::position::{calculate_margin_ratio, Overflow, Position};
use crate::types::{Bps, Price, Quote, Side, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FUNDING_INTERVAL_MS: i64 = 8 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingDirection {
    LongsPay,
    ShortsPay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FundingParams {
    pub interval_ms: i64,
    /// Signed rate per interval. positive = longs pay shorts, negative = shorts pay longs.
    pub rate_bps: Bps,
}

impl Default for FundingParams {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_FUNDING_INTERVAL_MS,
            rate_bps: Bps::new(1), // 0.01% per 8h
        }
    }
}

impl FundingParams {
    pub fn direction(&self) -> Option<FundingDirection> {
        match self.rate_bps.value() {
            0 => None,
            r if r > 0 => Some(FundingDirection::LongsPay),
            _ => Some(FundingDirection::ShortsPay),
        }
    }
}

// 5.1: size * entry_price * |rate_bps| / 10_000, signed from this side's point of view.
// positive = this position pays, negative = it receives.
pub fn funding_per_interval(side: Side, size: Decimal, entry_price: Price, rate_bps: Bps) -> Result<Quote, Overflow> {
    let pays = match (side, rate_bps.value()) {
        (_, 0) => return Ok(Quote::zero()),
        (Side::Long, r) => r > 0,
        (Side::Short, r) => r < 0,
    };
    let magnitude = size
        .checked_mul(entry_price.value())
        .and_then(|notional| notional.checked_mul(Decimal::from(rate_bps.value().unsigned_abs())))
        .map(|scaled| scaled / dec!(10_000))
        .ok_or(Overflow("funding charge"))?;
    if pays {
        Ok(Quote::new(magnitude))
    } else {
        Ok(Quote::new(-magnitude))
    }
}

/// Whole intervals between the checkpoint and `now`. never negative.
pub fn elapsed_intervals(checkpoint: Timestamp, now: Timestamp, interval_ms: i64) -> i64 {
    if interval_ms <= 0 {
        return 0;
    }
    let elapsed = checkpoint.elapsed_millis(&now);
    if elapsed <= 0 {
        0
    } else {
        elapsed / interval_ms
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FundingAccrual {
    pub intervals: i64,
    pub amount: Quote,
    pub new_checkpoint: Timestamp,
}

// 5.2: what the position owes for the intervals completed since its checkpoint.
// the checkpoint advances by whole intervals only, so partial time carries forward.
pub fn compute_accrual(
    position: &Position,
    now: Timestamp,
    params: &FundingParams,
) -> Result<Option<FundingAccrual>, Overflow> {
    let intervals = elapsed_intervals(position.funding_checkpoint, now, params.interval_ms);
    if intervals == 0 {
        return Ok(None);
    }
    let per_interval = funding_per_interval(position.side, position.size, position.entry_price, params.rate_bps)?;
    let amount = per_interval
        .value()
        .checked_mul(Decimal::from(intervals))
        .ok_or(Overflow("funding accrual"))?;
    Ok(Some(FundingAccrual {
        intervals,
        amount: Quote::new(amount),
        new_checkpoint: position.funding_checkpoint.plus_millis(intervals * params.interval_ms),
    }))
}

// commits only when the charged position still has a representable margin ratio
pub fn apply_accrual(position: &mut Position, accrual: &FundingAccrual) -> Result<(), Overflow> {
    debug_assert!(accrual.new_checkpoint > position.funding_checkpoint);
    let accumulated = position
        .accumulated_funding
        .value()
        .checked_add(accrual.amount.value())
        .map(Quote::new)
        .ok_or(Overflow("accumulated funding"))?;
    calculate_margin_ratio(position.margin, position.unrealized_pnl, accumulated)?;
    position.accumulated_funding = accumulated;
    position.funding_checkpoint = accrual.new_checkpoint;
    Ok(())
}

pub fn annualized_funding_rate(rate_bps: Bps, interval_ms: i64) -> Decimal {
    if interval_ms <= 0 {
        return Decimal::ZERO;
    }
    let periods_per_year = Decimal::from(365 * 24 * 60 * 60 * 1000_i64) / Decimal::from(interval_ms);
    rate_bps.as_fraction() * periods_per_year
}
