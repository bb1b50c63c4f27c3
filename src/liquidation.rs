//! Liquidation threshold and insurance fund.
//!
//! A position is liquidatable once unrealized loss plus accrued funding has eaten
//! `threshold` of its margin, i.e. when
//! `(margin + unrealized_pnl - accumulated_funding) / margin <= 1 - threshold`.
//! Whatever equity is left at that point goes to the insurance fund; negative
//! equity is bad debt the fund covers as far as it can.

use crate::position::Position;
use crate::types::Quote;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidationParams {
    /// Fraction of margin that may be consumed before liquidation (0.90 = 90%).
    pub threshold: Decimal,
}

impl Default for LiquidationParams {
    fn default() -> Self {
        Self { threshold: dec!(0.90) }
    }
}

impl LiquidationParams {
    pub fn ratio_floor(&self) -> Decimal {
        Decimal::ONE - self.threshold
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiquidationStatus {
    Safe { margin_ratio: Decimal },
    Liquidatable { margin_ratio: Decimal, equity: Quote },
}

impl LiquidationStatus {
    pub fn is_liquidatable(&self) -> bool {
        matches!(self, LiquidationStatus::Liquidatable { .. })
    }
}

/// Pure check on the position's current figures. Callers accrue funding first.
pub fn evaluate_liquidation(position: &Position, params: &LiquidationParams) -> LiquidationStatus {
    let margin_ratio = position.margin_ratio();
    if margin_ratio <= params.ratio_floor() {
        LiquidationStatus::Liquidatable {
            margin_ratio,
            equity: position.equity(),
        }
    } else {
        LiquidationStatus::Safe { margin_ratio }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuranceFund {
    pub balance: Quote,
    pub total_deposits: Quote,
    pub total_payouts: Quote,
    pub uncovered_bad_debt: Quote,
}

impl InsuranceFund {
    pub fn new(initial_balance: Quote) -> Self {
        Self {
            balance: initial_balance,
            total_deposits: initial_balance,
            total_payouts: Quote::zero(),
            uncovered_bad_debt: Quote::zero(),
        }
    }

    pub fn deposit(&mut self, amount: Quote) {
        self.balance = self.balance.add(amount);
        self.total_deposits = self.total_deposits.add(amount);
    }

    pub fn cover_bad_debt(&mut self, amount: Quote) -> Quote {
        let covered = if self.balance.value() >= amount.value() {
            amount
        } else {
            self.balance
        };
        self.balance = self.balance.sub(covered);
        self.total_payouts = self.total_payouts.add(covered);
        self.uncovered_bad_debt = self.uncovered_bad_debt.add(amount.sub(covered));
        covered
    }

    /// Books a liquidated position's residual equity: positive goes in, negative is covered.
    pub fn absorb(&mut self, equity: Quote) -> Quote {
        if equity.is_positive() {
            self.deposit(equity);
            Quote::zero()
        } else if equity.is_negative() {
            let debt = equity.abs();
            self.cover_bad_debt(debt);
            debt
        } else {
            Quote::zero()
        }
    }
}

impl Default for InsuranceFund {
    fn default() -> Self {
        Self::new(Quote::zero())
    }
}
