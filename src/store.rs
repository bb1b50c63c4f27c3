//! Persistence boundary.
//!
//! The engine never talks SQL. It hands fully-decided records to a [`Repository`]
//! and the repository decides how they land in the `positions` and
//! `advanced_orders` tables. Saves are upserts keyed by id, so a retried save is
//! harmless. Prices, amounts and percentages are rounded to 6 decimal places on
//! the way in.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::conditional::{ConditionalOrder, OrderStatus, OrderType, TriggerSource};
use crate::position::{Position, PositionStatus};
use crate::types::{OrderId, PositionId, Side};

pub const STORED_DECIMALS: u32 = 6;

pub fn to_stored(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(STORED_DECIMALS, RoundingStrategy::MidpointNearestEven)
}

/// One row of `positions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: u64,
    pub user_id: u64,
    pub pair: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub leverage: Decimal,
    pub margin_amount: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub accumulated_funding: Decimal,
    pub realized_pnl: Decimal,
    pub status: PositionStatus,
    pub opened_at: String,
    pub closed_at: Option<String>,
}

impl From<&Position> for PositionRecord {
    fn from(p: &Position) -> Self {
        Self {
            id: p.id.0,
            user_id: p.user_id.0,
            pair: p.pair.as_str().to_string(),
            side: p.side,
            entry_price: to_stored(p.entry_price.value()),
            size: to_stored(p.size),
            leverage: to_stored(p.leverage.value()),
            margin_amount: to_stored(p.margin.value()),
            current_price: to_stored(p.current_price.value()),
            unrealized_pnl: to_stored(p.unrealized_pnl.value()),
            accumulated_funding: to_stored(p.accumulated_funding.value()),
            realized_pnl: to_stored(p.realized_pnl.value()),
            status: p.status,
            opened_at: p.opened_at.to_rfc3339(),
            closed_at: p.closed_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// One row of `advanced_orders`. Trailing columns are null for SL/TP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: u64,
    pub position_id: u64,
    pub user_id: u64,
    pub order_type: OrderType,
    pub trigger_type: TriggerSource,
    pub trigger_price: Option<Decimal>,
    pub percentage: Option<Decimal>,
    pub trailing_percentage: Option<Decimal>,
    pub highest_price: Option<Decimal>,
    pub lowest_price: Option<Decimal>,
    pub current_trigger_price: Option<Decimal>,
    pub status: OrderStatus,
    pub created_at: String,
    pub triggered_at: Option<String>,
    pub cancelled_at: Option<String>,
}

impl From<&ConditionalOrder> for OrderRecord {
    fn from(o: &ConditionalOrder) -> Self {
        Self {
            id: o.id.0,
            position_id: o.position_id.0,
            user_id: o.user_id.0,
            order_type: o.order_type,
            trigger_type: o.trigger_source,
            trigger_price: o.trigger_price.map(|p| to_stored(p.value())),
            percentage: o.percentage.map(to_stored),
            trailing_percentage: o.trailing_percentage.map(to_stored),
            highest_price: o.highest_price.map(|p| to_stored(p.value())),
            lowest_price: o.lowest_price.map(|p| to_stored(p.value())),
            current_trigger_price: o.current_trigger_price.map(|p| to_stored(p.value())),
            status: o.status,
            created_at: o.created_at.to_rfc3339(),
            triggered_at: o.triggered_at.map(|t| t.to_rfc3339()),
            cancelled_at: o.cancelled_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn save_position(&self, record: &PositionRecord) -> Result<(), StoreError>;

    async fn save_order(&self, record: &OrderRecord) -> Result<(), StoreError>;

    async fn load_position(&self, id: PositionId) -> Result<Option<PositionRecord>, StoreError>;

    async fn load_orders(&self, position_id: PositionId) -> Result<Vec<OrderRecord>, StoreError>;
}

/// HashMap-backed repository. `fail_next` makes the next N writes fail, for retry tests.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    positions: Mutex<HashMap<u64, PositionRecord>>,
    orders: Mutex<HashMap<u64, OrderRecord>>,
    failures_left: AtomicU32,
    writes: AtomicU32,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn order(&self, id: OrderId) -> Option<OrderRecord> {
        self.orders.lock().get(&id.0).cloned()
    }

    pub fn position(&self, id: PositionId) -> Option<PositionRecord> {
        self.positions.lock().get(&id.0).cloned()
    }

    fn take_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save_position(&self, record: &PositionRecord) -> Result<(), StoreError> {
        self.take_failure()?;
        self.positions.lock().insert(record.id, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_order(&self, record: &OrderRecord) -> Result<(), StoreError> {
        self.take_failure()?;
        self.orders.lock().insert(record.id, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_position(&self, id: PositionId) -> Result<Option<PositionRecord>, StoreError> {
        Ok(self.positions.lock().get(&id.0).cloned())
    }

    async fn load_orders(&self, position_id: PositionId) -> Result<Vec<OrderRecord>, StoreError> {
        let mut orders: Vec<OrderRecord> = self
            .orders
            .lock()
            .values()
            .filter(|o| o.position_id == position_id.0)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }
}
