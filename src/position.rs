// 4.0: leveraged position state. pnl = size * (price - entry) for longs, mirrored for shorts.
// 4.1 pnl math, 4.2 margin ratio, 4.3 terminal transitions, 4.4 partial reduction.

use crate::types::{Leverage, Pair, PositionId, Price, Quote, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Open)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Open => f.write_str("open"),
            PositionStatus::Closed => f.write_str("closed"),
            PositionStatus::Liquidated => f.write_str("liquidated"),
        }
    }
}

/// Position arithmetic fell outside the range `Decimal` can represent.
/// The position is left exactly as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("arithmetic overflow computing {0}")]
pub struct Overflow(pub &'static str);

/// Why a position left the open state (or lost part of its size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    UserRequested,
    StopLoss,
    TakeProfit,
    TrailingStop,
    Liquidation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub user_id: UserId,
    pub pair: Pair,
    pub side: Side,
    pub entry_price: Price,
    /// Base-asset quantity, always positive. Direction lives in `side`.
    pub size: Decimal,
    pub leverage: Leverage,
    pub margin: Quote,
    pub current_price: Price,
    pub unrealized_pnl: Quote,
    /// Net funding paid by this position. Negative when it has been receiving.
    pub accumulated_funding: Quote,
    pub realized_pnl: Quote,
    pub status: PositionStatus,
    pub opened_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub funding_checkpoint: Timestamp,
    /// Set once the store has acknowledged the open. Orders stay pending until then.
    pub confirmed: bool,
    pub close_reason: Option<CloseReason>,
    pub exit_price: Option<Price>,
}

impl Position {
    pub fn open(
        id: PositionId,
        user_id: UserId,
        pair: Pair,
        side: Side,
        size: Decimal,
        entry_price: Price,
        leverage: Leverage,
        margin: Quote,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            user_id,
            pair,
            side,
            entry_price,
            size,
            leverage,
            margin,
            current_price: entry_price,
            unrealized_pnl: Quote::zero(),
            accumulated_funding: Quote::zero(),
            realized_pnl: Quote::zero(),
            status: PositionStatus::Open,
            opened_at: timestamp,
            closed_at: None,
            funding_checkpoint: timestamp,
            confirmed: false,
            close_reason: None,
            exit_price: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    // 4.1: records the new price and recomputes pnl. nothing else is touched.
    // commits only when the resulting margin ratio is representable.
    pub fn apply_price(&mut self, price: Price) -> Result<(), Overflow> {
        let pnl = calculate_unrealized_pnl(self.side, self.size, self.entry_price, price)?;
        calculate_margin_ratio(self.margin, pnl, self.accumulated_funding)?;
        self.current_price = price;
        self.unrealized_pnl = pnl;
        Ok(())
    }

    // 4.2: margin + pnl - funding paid
    pub fn equity(&self) -> Quote {
        Quote::new(
            self.margin
                .value()
                .saturating_add(self.unrealized_pnl.value())
                .saturating_sub(self.accumulated_funding.value()),
        )
    }

    pub fn margin_ratio(&self) -> Decimal {
        match calculate_margin_ratio(self.margin, self.unrealized_pnl, self.accumulated_funding) {
            Ok(ratio) => ratio,
            // only reachable through direct field writes
            Err(_) if self.equity().is_negative() => Decimal::MIN,
            Err(_) => Decimal::MAX,
        }
    }

    /// Price at which the margin ratio reaches `1 - threshold`, holding funding fixed.
    pub fn liquidation_price(&self, threshold: Decimal) -> Option<Price> {
        if self.size.is_zero() {
            return None;
        }
        let floor_ratio = Decimal::ONE - threshold;
        // loss that may be absorbed before the floor is hit
        let tolerable = (self.margin.value() - floor_ratio * self.margin.value())
            .checked_sub(self.accumulated_funding.value())?;
        let move_per_unit = tolerable.checked_div(self.size)?;
        let liq = match self.side {
            Side::Long => self.entry_price.value().checked_sub(move_per_unit)?,
            Side::Short => self.entry_price.value().checked_add(move_per_unit)?,
        };
        Price::new(liq)
    }

    // 4.3: the only two ways out of open. closed_at is written here and nowhere else.
    // callers apply the exit price first.
    pub(crate) fn finalize(
        &mut self,
        status: PositionStatus,
        reason: CloseReason,
        exit_price: Price,
        timestamp: Timestamp,
    ) {
        debug_assert!(self.is_open(), "finalize on terminal position");
        debug_assert!(status.is_terminal());
        debug_assert_eq!(self.current_price, exit_price, "exit price not applied");
        self.status = status;
        self.close_reason = Some(reason);
        self.exit_price = Some(exit_price);
        self.closed_at = Some(timestamp);
    }
}

// 4.1: the pnl formula. pure function of its inputs.
pub fn calculate_unrealized_pnl(side: Side, size: Decimal, entry_price: Price, price: Price) -> Result<Quote, Overflow> {
    let (from, to) = match side {
        Side::Long => (entry_price.value(), price.value()),
        Side::Short => (price.value(), entry_price.value()),
    };
    to.checked_sub(from)
        .and_then(|moved| size.checked_mul(moved))
        .map(Quote::new)
        .ok_or(Overflow("unrealized pnl"))
}

// 4.2: (margin + pnl - funding) / margin
pub fn calculate_margin_ratio(
    margin: Quote,
    unrealized_pnl: Quote,
    accumulated_funding: Quote,
) -> Result<Decimal, Overflow> {
    if margin.value() <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    margin
        .value()
        .checked_add(unrealized_pnl.value())
        .and_then(|v| v.checked_sub(accumulated_funding.value()))
        .and_then(|equity| equity.checked_div(margin.value()))
        .ok_or(Overflow("margin ratio"))
}

/// Quote amounts released by a (partial) reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub closed_size: Decimal,
    pub realized_pnl: Quote,
    pub funding_share: Quote,
    pub margin_released: Quote,
}

impl Reduction {
    // margin back plus pnl minus the funding owed on the closed slice
    pub fn payout(&self) -> Quote {
        self.margin_released.add(self.realized_pnl).sub(self.funding_share)
    }
}

// 4.4: carves `fraction` of the position off at `exit_price`. entry price is unchanged.
// fraction is clamped to (0, 1]; a fraction of 1 leaves a zero-size shell for the caller
// to finalize. everything is computed before anything is written.
pub fn reduce_position(position: &mut Position, fraction: Decimal, exit_price: Price) -> Result<Reduction, Overflow> {
    let fraction = fraction.min(Decimal::ONE).max(Decimal::ZERO);
    // scaling by a fraction in [0, 1] cannot grow a value
    let closed_size = position.size * fraction;
    let funding_share = position.accumulated_funding.mul(fraction);
    let margin_released = position.margin.mul(fraction);
    let realized = calculate_unrealized_pnl(position.side, closed_size, position.entry_price, exit_price)?;
    let realized_total = position
        .realized_pnl
        .value()
        .checked_add(realized.value())
        .and_then(|v| v.checked_sub(funding_share.value()))
        .ok_or(Overflow("realized pnl"))?;

    let mut reduced = position.clone();
    reduced.size -= closed_size;
    reduced.margin = reduced.margin.sub(margin_released);
    reduced.accumulated_funding = reduced.accumulated_funding.sub(funding_share);
    reduced.realized_pnl = Quote::new(realized_total);
    reduced.apply_price(exit_price)?;
    *position = reduced;

    Ok(Reduction {
        closed_size,
        realized_pnl: realized,
        funding_share,
        margin_released,
    })
}

pub fn percent_to_fraction(percentage: Decimal) -> Decimal {
    percentage / dec!(100)
}
