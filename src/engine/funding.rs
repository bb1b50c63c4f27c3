//! Funding accrual.

use super::core::Engine;
use crate::funding::annualized_funding_rate;
use crate::ledger::{LedgerError, PositionSlot};
use crate::types::Timestamp;
use rust_decimal::Decimal;

impl Engine {
    /// Charges every whole interval elapsed since the position's checkpoint.
    /// Returns true when anything was charged.
    pub(super) fn accrue_funding(&self, slot: &mut PositionSlot, now: Timestamp) -> Result<bool, LedgerError> {
        match self.ledger.accrue_funding_locked(slot, now, &self.config.funding)? {
            Some(_) => {
                self.sink.record_position(&slot.position);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn annualized_funding_rate(&self) -> Decimal {
        annualized_funding_rate(self.config.funding.rate_bps, self.config.funding.interval_ms)
    }
}
