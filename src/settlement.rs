// 9.1 settlement.rs: the on-chain side. MOCKED in-memory here, a contract call in prod.
// the contract only ever sees finalized outcomes: (position, exit price, reason).
// it is never queried while ticks are being evaluated.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::position::CloseReason;
use crate::types::{OrderId, PositionId, Price};

// 6 decimal fixed point, same as the NUMA token
pub const CHAIN_DECIMALS: u32 = 6;

pub fn to_chain_units(price: Price) -> Result<u64, SettlementError> {
    price
        .value()
        .checked_mul(Decimal::from(10u64.pow(CHAIN_DECIMALS)))
        .map(|scaled| scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven))
        .and_then(|scaled| scaled.to_u64())
        .ok_or(SettlementError::PriceOutOfRange(price.value()))
}

pub fn from_chain_units(units: u64) -> Decimal {
    Decimal::new(units as i64, CHAIN_DECIMALS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReasonCode {
    UserClose = 0,
    StopLoss = 1,
    TakeProfit = 2,
    TrailingStop = 3,
    Liquidation = 4,
}

impl From<CloseReason> for ReasonCode {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::UserRequested => ReasonCode::UserClose,
            CloseReason::StopLoss => ReasonCode::StopLoss,
            CloseReason::TakeProfit => ReasonCode::TakeProfit,
            CloseReason::TrailingStop => ReasonCode::TrailingStop,
            CloseReason::Liquidation => ReasonCode::Liquidation,
        }
    }
}

/// A finalized close handed to the contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettlementInstruction {
    pub position_id: PositionId,
    /// Exit price in chain units (6 dp).
    pub exit_price: u64,
    pub reason_code: ReasonCode,
    /// Closed base size, 6 dp. Less than the position size for partial closes.
    pub closed_size: u64,
    /// Set when a conditional order caused the close.
    pub order_id: Option<OrderId>,
}

impl SettlementInstruction {
    pub fn new(
        position_id: PositionId,
        exit_price: Price,
        reason: CloseReason,
        closed_size: Decimal,
        order_id: Option<OrderId>,
    ) -> Result<Self, SettlementError> {
        let closed_size = closed_size
            .checked_mul(Decimal::from(10u64.pow(CHAIN_DECIMALS)))
            .map(|scaled| scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven))
            .and_then(|scaled| scaled.to_u64())
            .ok_or(SettlementError::SizeOutOfRange(closed_size))?;
        Ok(Self {
            position_id,
            exit_price: to_chain_units(exit_price)?,
            reason_code: reason.into(),
            closed_size,
            order_id,
        })
    }

    /// Identity for de-duplication on the contract side.
    pub fn key(&self) -> (PositionId, Option<OrderId>, u64) {
        (self.position_id, self.order_id, self.closed_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub position_id: PositionId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementError {
    #[error("Price {0} does not fit chain units")]
    PriceOutOfRange(Decimal),

    #[error("Size {0} does not fit chain units")]
    SizeOutOfRange(Decimal),

    #[error("Contract call failed: {0}")]
    CallFailed(String),
}

#[async_trait]
pub trait SettlementContract: Send + Sync {
    async fn submit(&self, instruction: &SettlementInstruction) -> Result<TxReceipt, SettlementError>;
}

// In-memory contract. remembers what it accepted, can be told to fail.
#[derive(Debug, Default)]
pub struct InMemorySettlement {
    accepted: Mutex<Vec<SettlementInstruction>>,
    seen: Mutex<HashSet<(PositionId, Option<OrderId>, u64)>>,
    failures_left: AtomicU32,
}

impl InMemorySettlement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn accepted(&self) -> Vec<SettlementInstruction> {
        self.accepted.lock().clone()
    }
}

#[async_trait]
impl SettlementContract for InMemorySettlement {
    async fn submit(&self, instruction: &SettlementInstruction) -> Result<TxReceipt, SettlementError> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SettlementError::CallFailed("injected failure".into()));
        }

        // a resubmitted instruction is accepted without a second effect
        if self.seen.lock().insert(instruction.key()) {
            self.accepted.lock().push(instruction.clone());
        }
        Ok(TxReceipt {
            tx_hash: format!(
                "0x{:016x}{:016x}",
                instruction.position_id.0,
                instruction.order_id.map(|o| o.0).unwrap_or(0)
            ),
            position_id: instruction.position_id,
        })
    }
}
