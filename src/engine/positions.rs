//! Position and collateral operations.

use super::core::Engine;
use super::results::EngineError;
use crate::account::Account;
use crate::ledger::{Closure, LedgerError, OpenedPosition, PositionSpec};
use crate::position::Position;
use crate::types::{Pair, PositionId, Quote, Timestamp, UserId};

impl Engine {
    pub fn deposit(&self, user_id: UserId, amount: Quote, now: Timestamp) -> Quote {
        self.ledger.deposit(user_id, amount, now)
    }

    pub fn withdraw(&self, user_id: UserId, amount: Quote, now: Timestamp) -> Result<Quote, EngineError> {
        Ok(self.ledger.withdraw(user_id, amount, now)?)
    }

    pub fn account(&self, user_id: UserId) -> Option<Account> {
        self.ledger.account(user_id)
    }

    /// Opens at the pair's current mark. Fails when the pair has no price yet.
    pub fn open_position(&self, spec: &PositionSpec, now: Timestamp) -> Result<OpenedPosition, EngineError> {
        let prices = self.require_prices(&spec.pair)?;
        Ok(self.sink.open_position(spec, prices.mark, &prices.trigger_prices(), now)?)
    }

    /// User close at the current mark.
    pub fn close_position(&self, position_id: PositionId, now: Timestamp) -> Result<Closure, EngineError> {
        let position = self
            .ledger
            .get_position(position_id)
            .ok_or(LedgerError::PositionNotFound(position_id))?;
        let prices = self.require_prices(&position.pair)?;
        Ok(self.sink.close_position(position_id, prices.mark, now)?)
    }

    pub fn get_position(&self, position_id: PositionId) -> Option<Position> {
        self.ledger.get_position(position_id)
    }

    pub fn open_positions(&self, pair: &Pair) -> Vec<Position> {
        self.ledger
            .open_positions_for_pair(pair)
            .into_iter()
            .filter_map(|id| self.ledger.get_position(id))
            .collect()
    }
}
