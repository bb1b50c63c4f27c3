// 8.0.2: result types and errors for engine operations.

use crate::account::AccountError;
use crate::conditional::OrderError;
use crate::config::ConfigError;
use crate::ledger::LedgerError;
use crate::price_feed::FeedError;
use crate::settlement::SettlementError;
use crate::store::StoreError;
use crate::types::{OrderId, Pair, PositionId, Price, Timestamp};
use serde::Serialize;

/// What one tick did to its pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub pair: Option<Pair>,
    pub observed_at: Option<Timestamp>,
    pub mark: Option<Price>,
    pub last: Option<Price>,
    pub degraded: bool,
    /// Older than the last tick seen for the pair. Nothing was evaluated.
    pub rejected: bool,
    pub positions_evaluated: usize,
    pub funding_charges: usize,
    pub liquidated: Vec<PositionId>,
    pub triggered: Vec<OrderId>,
    pub closed: Vec<PositionId>,
    pub reduced: Vec<PositionId>,
    pub liquidations_skipped: usize,
    pub triggers_skipped: usize,
    /// Left untouched this tick: their figures fell outside `Decimal`'s range.
    pub positions_skipped: Vec<PositionId>,
}

impl TickReport {
    pub fn had_effect(&self) -> bool {
        self.funding_charges > 0 || !self.liquidated.is_empty() || !self.triggered.is_empty()
    }
}

/// Coarse error classes callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Bad input, rejected before anything changed.
    Validation,
    /// Acting on a terminal position or order. Nothing changed.
    StateConflict,
    NotFound,
    Persistence,
    Settlement,
    Upstream,
    /// The engine cannot take the request right now (no price yet, pipeline down).
    Unavailable,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error("No price for {0} yet")]
    NoPrice(Pair),

    #[error("Pipeline for {0} is not running")]
    PipelineClosed(Pair),
}

impl From<OrderError> for EngineError {
    fn from(e: OrderError) -> Self {
        EngineError::Ledger(LedgerError::Order(e))
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Ledger(e) => match e {
                LedgerError::InvalidLeverage { .. }
                | LedgerError::InvalidSize(_)
                | LedgerError::ExceedsLimit { .. }
                | LedgerError::Overflow(_)
                | LedgerError::InsufficientMargin { .. }
                | LedgerError::Account(AccountError::InsufficientBalance { .. })
                | LedgerError::Order(OrderError::InvalidOrder(_)) => ErrorKind::Validation,
                LedgerError::PositionNotOpen { .. } | LedgerError::Order(OrderError::OrderNotActive { .. }) => {
                    ErrorKind::StateConflict
                }
                LedgerError::PositionNotFound(_)
                | LedgerError::OrderNotFound(_)
                | LedgerError::Account(AccountError::UnknownAccount(_)) => ErrorKind::NotFound,
                LedgerError::NoPrice(_) => ErrorKind::Unavailable,
            },
            EngineError::Config(_) => ErrorKind::Validation,
            EngineError::Feed(_) => ErrorKind::Upstream,
            EngineError::Store(_) => ErrorKind::Persistence,
            EngineError::Settlement(_) => ErrorKind::Settlement,
            EngineError::NoPrice(_) | EngineError::PipelineClosed(_) => ErrorKind::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditional::OrderStatus;
    use crate::position::PositionStatus;
    use rust_decimal_macros::dec;

    #[test]
    fn kinds_follow_taxonomy() {
        let e: EngineError = LedgerError::InvalidSize(dec!(0)).into();
        assert_eq!(e.kind(), ErrorKind::Validation);

        let e: EngineError = LedgerError::PositionNotOpen {
            id: PositionId(1),
            status: PositionStatus::Closed,
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::StateConflict);

        let e: EngineError = OrderError::OrderNotActive {
            id: OrderId(1),
            status: OrderStatus::Triggered,
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::StateConflict);

        let e: EngineError = StoreError::Unavailable("down".into()).into();
        assert_eq!(e.kind(), ErrorKind::Persistence);

        assert_eq!(EngineError::NoPrice(Pair::wld_numa()).kind(), ErrorKind::Unavailable);
    }
}
