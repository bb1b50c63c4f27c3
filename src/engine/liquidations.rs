//! Liquidation detection and execution.

use super::core::Engine;
use super::results::{EngineError, TickReport};
use crate::execution::{Applied, ExecutionIntent};
use crate::ledger::{LedgerError, PositionSlot};
use crate::liquidation::evaluate_liquidation;
use crate::types::{PositionId, Price, Timestamp};
use tracing::warn;

impl Engine {
    /// Liquidates the position when it is under the floor. True when it was.
    pub(super) fn check_liquidation(
        &self,
        slot: &mut PositionSlot,
        mark: Price,
        now: Timestamp,
        report: &mut TickReport,
    ) -> bool {
        if !evaluate_liquidation(&slot.position, &self.config.liquidation).is_liquidatable() {
            return false;
        }

        let position_id = slot.position.id;
        let intent = ExecutionIntent::Liquidate {
            position_id,
            mark_price: mark,
        };
        match self.sink.apply_locked(slot, intent, now) {
            Ok(Applied::Liquidated(_)) => {
                report.liquidated.push(position_id);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(position_id = %position_id, error = %e, "Liquidation not applied");
                false
            }
        }
    }

    /// Out-of-band liquidation request at the current mark. Funding is brought
    /// up to date first. Re-requesting on a liquidated position changes nothing.
    pub fn liquidate_position(&self, position_id: PositionId, now: Timestamp) -> Result<Applied, EngineError> {
        let position = self
            .ledger
            .get_position(position_id)
            .ok_or(LedgerError::PositionNotFound(position_id))?;
        // market before slot, same order as tick processing
        let mark = match self.market_prices(&position.pair) {
            Some(prices) => prices.mark,
            None => position.current_price,
        };
        let slot = self
            .ledger
            .slot(position_id)
            .ok_or(LedgerError::PositionNotFound(position_id))?;
        let mut slot = slot.lock();
        if slot.position.is_open() {
            self.accrue_funding(&mut slot, now)?;
        }
        let intent = ExecutionIntent::Liquidate {
            position_id,
            mark_price: mark,
        };
        Ok(self.sink.apply_locked(&mut slot, intent, now)?)
    }

    /// Estimated mark price at which the position would be liquidated.
    pub fn liquidation_price(&self, position_id: PositionId) -> Result<Option<Price>, EngineError> {
        let position = self
            .ledger
            .get_position(position_id)
            .ok_or(LedgerError::PositionNotFound(position_id))?;
        Ok(position.liquidation_price(self.config.liquidation.threshold))
    }
}
