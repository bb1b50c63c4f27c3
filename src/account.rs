//! User collateral accounts.
//!
//! Each position is isolated: opening reserves its margin out of the user's free
//! balance, and closing hands back whatever the position is still worth. The
//! account never sees unrealized PnL.

use crate::types::{Quote, Timestamp, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: UserId,
    /// Free collateral, available for new margin or withdrawal.
    pub balance: Quote,
    /// Margin currently locked in open positions.
    pub reserved: Quote,
    pub total_deposited: Quote,
    pub total_withdrawn: Quote,
    pub realized_pnl: Quote,
    pub created_at: Timestamp,
}

impl Account {
    pub fn new(id: UserId, timestamp: Timestamp) -> Self {
        Self {
            id,
            balance: Quote::zero(),
            reserved: Quote::zero(),
            total_deposited: Quote::zero(),
            total_withdrawn: Quote::zero(),
            realized_pnl: Quote::zero(),
            created_at: timestamp,
        }
    }

    pub fn deposit(&mut self, amount: Quote) {
        self.balance = self.balance.add(amount);
        self.total_deposited = self.total_deposited.add(amount);
    }

    pub fn withdraw(&mut self, amount: Quote) -> Result<(), AccountError> {
        if amount.value() > self.balance.value() {
            return Err(AccountError::InsufficientBalance {
                requested: amount,
                available: self.balance,
            });
        }
        self.balance = self.balance.sub(amount);
        self.total_withdrawn = self.total_withdrawn.add(amount);
        Ok(())
    }

    pub fn reserve_margin(&mut self, amount: Quote) -> Result<(), AccountError> {
        if amount.value() > self.balance.value() {
            return Err(AccountError::InsufficientBalance {
                requested: amount,
                available: self.balance,
            });
        }
        self.balance = self.balance.sub(amount);
        self.reserved = self.reserved.add(amount);
        Ok(())
    }

    /// Releases `margin` from the reservation and credits `payout` (margin +/- results).
    pub fn settle_release(&mut self, margin: Quote, payout: Quote, realized: Quote) {
        self.reserved = self.reserved.sub(margin).floor_zero();
        self.balance = self.balance.add(payout.floor_zero());
        self.realized_pnl = self.realized_pnl.add(realized);
    }

    /// Margin is lost to the insurance fund; nothing comes back.
    pub fn forfeit_margin(&mut self, margin: Quote, realized: Quote) {
        self.reserved = self.reserved.sub(margin).floor_zero();
        self.realized_pnl = self.realized_pnl.add(realized);
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccountError {
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("Unknown account {0}")]
    UnknownAccount(UserId),
}
