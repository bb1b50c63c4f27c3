//! Conditional orders: stop-loss, take-profit, and trailing stops.
//!
//! Every order hangs off exactly one position and closes it (fully, or by
//! `percentage`) when its trigger condition is met. Orders move through
//! `pending → active → triggered | cancelled`; the two terminal states are final,
//! and reaching `triggered` is the only way an execution intent gets emitted.
//!
//! Trailing stops keep the best price seen since creation in the position's
//! favorable direction. [`ratchet_extremum`] is the single place that moves it,
//! and it only ever tightens.

use crate::position::{percent_to_fraction, CloseReason};
use crate::types::{OrderId, Pair, PositionId, Price, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of conditional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Triggers when price falls to the threshold (longs) or rises to it (shorts).
    StopLoss,
    /// Triggers when price rises to the threshold (longs) or falls to it (shorts).
    TakeProfit,
    /// Stop that trails the best price by a fixed percentage.
    TrailingStop,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::StopLoss => f.write_str("stop_loss"),
            OrderType::TakeProfit => f.write_str("take_profit"),
            OrderType::TrailingStop => f.write_str("trailing_stop"),
        }
    }
}

/// Which price stream an order compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Mark,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Active,
    Pending,
    Triggered,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Triggered | OrderStatus::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Active => f.write_str("active"),
            OrderStatus::Pending => f.write_str("pending"),
            OrderStatus::Triggered => f.write_str("triggered"),
            OrderStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequested,
    PositionClosed,
    PositionLiquidated,
}

/// How the trigger price should be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    /// Triggers when price reaches or crosses above the trigger.
    Above,
    /// Triggers when price reaches or crosses below the trigger.
    Below,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderError {
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Order {id} is already {status}")]
    OrderNotActive { id: OrderId, status: OrderStatus },
}

/// What a caller asks for when attaching an order. Validated into a [`ConditionalOrder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub order_type: OrderType,
    #[serde(default)]
    pub trigger_source: TriggerSource,
    pub trigger_price: Option<Decimal>,
    /// Share of the position to close, in percent. None closes everything.
    pub percentage: Option<Decimal>,
    pub trailing_percentage: Option<Decimal>,
}

impl OrderSpec {
    pub fn stop_loss(trigger_price: Decimal) -> Self {
        Self {
            order_type: OrderType::StopLoss,
            trigger_source: TriggerSource::Mark,
            trigger_price: Some(trigger_price),
            percentage: None,
            trailing_percentage: None,
        }
    }

    pub fn take_profit(trigger_price: Decimal) -> Self {
        Self {
            order_type: OrderType::TakeProfit,
            trigger_source: TriggerSource::Mark,
            trigger_price: Some(trigger_price),
            percentage: None,
            trailing_percentage: None,
        }
    }

    pub fn trailing_stop(trailing_percentage: Decimal) -> Self {
        Self {
            order_type: OrderType::TrailingStop,
            trigger_source: TriggerSource::Mark,
            trigger_price: None,
            percentage: None,
            trailing_percentage: Some(trailing_percentage),
        }
    }

    pub fn with_percentage(mut self, percentage: Decimal) -> Self {
        self.percentage = Some(percentage);
        self
    }

    pub fn with_trigger_source(mut self, source: TriggerSource) -> Self {
        self.trigger_source = source;
        self
    }

    pub fn validate(&self) -> Result<(), OrderError> {
        if let Some(pct) = self.percentage {
            if pct <= Decimal::ZERO || pct > dec!(100) {
                return Err(OrderError::InvalidOrder(format!(
                    "percentage must be in (0, 100], got {pct}"
                )));
            }
        }

        match self.order_type {
            OrderType::StopLoss | OrderType::TakeProfit => {
                if self.trailing_percentage.is_some() {
                    return Err(OrderError::InvalidOrder(format!(
                        "{} does not take a trailing percentage",
                        self.order_type
                    )));
                }
                match self.trigger_price {
                    None => Err(OrderError::InvalidOrder(format!(
                        "{} requires a trigger price",
                        self.order_type
                    ))),
                    Some(p) if p <= Decimal::ZERO => Err(OrderError::InvalidOrder(format!(
                        "trigger price must be positive, got {p}"
                    ))),
                    Some(_) => Ok(()),
                }
            }
            OrderType::TrailingStop => {
                if self.trigger_price.is_some() {
                    return Err(OrderError::InvalidOrder(
                        "trailing_stop derives its trigger price, do not set one".to_string(),
                    ));
                }
                match self.trailing_percentage {
                    None => Err(OrderError::InvalidOrder(
                        "trailing_stop requires a trailing percentage".to_string(),
                    )),
                    Some(p) if p <= Decimal::ZERO || p >= dec!(100) => Err(OrderError::InvalidOrder(
                        format!("trailing percentage must be in (0, 100), got {p}"),
                    )),
                    Some(_) => Ok(()),
                }
            }
        }
    }
}

/// Both price streams for one tick; each order picks one by its [`TriggerSource`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerPrices {
    pub mark: Price,
    pub last: Price,
}

impl TriggerPrices {
    pub fn same(price: Price) -> Self {
        Self { mark: price, last: price }
    }

    pub fn for_source(&self, source: TriggerSource) -> Price {
        match source {
            TriggerSource::Mark => self.mark,
            TriggerSource::Last => self.last,
        }
    }
}

/// Moves the favorable extremum if `observed` improves on it. Returns the new
/// extremum, or None when it did not move. Longs ratchet up, shorts down.
pub fn ratchet_extremum(side: Side, current: Option<Price>, observed: Price) -> Option<Price> {
    match (side, current) {
        (_, None) => Some(observed),
        (Side::Long, Some(high)) if observed > high => Some(observed),
        (Side::Short, Some(low)) if observed < low => Some(observed),
        _ => None,
    }
}

/// high * (1 - pct/100) for longs, low * (1 + pct/100) for shorts.
pub fn trailing_trigger_price(side: Side, extremum: Price, trailing_percentage: Decimal) -> Price {
    let offset = percent_to_fraction(trailing_percentage);
    // a short's trigger past Decimal::MAX is unreachable; clamp it there
    let value = match side {
        Side::Long => extremum.value().saturating_mul(Decimal::ONE - offset),
        Side::Short => extremum.value().saturating_mul(Decimal::ONE + offset),
    };
    Price::new_unchecked(value)
}

/// A conditional order attached to a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalOrder {
    pub id: OrderId,
    pub position_id: PositionId,
    pub user_id: UserId,
    pub pair: Pair,
    /// Side of the position being protected, not of the closing trade.
    pub position_side: Side,
    pub order_type: OrderType,
    pub trigger_source: TriggerSource,
    pub trigger_price: Option<Price>,
    pub percentage: Option<Decimal>,
    pub trailing_percentage: Option<Decimal>,
    pub highest_price: Option<Price>,
    pub lowest_price: Option<Price>,
    pub current_trigger_price: Option<Price>,
    pub status: OrderStatus,
    pub created_at: Timestamp,
    pub triggered_at: Option<Timestamp>,
    pub cancelled_at: Option<Timestamp>,
    pub cancel_reason: Option<CancelReason>,
    /// Observed price the order fired at.
    pub fill_price: Option<Price>,
}

impl ConditionalOrder {
    /// Builds an order from a validated spec. Trailing stops seed their extremum
    /// from `reference_price`, the current price on the order's trigger source.
    pub fn new(
        id: OrderId,
        position_id: PositionId,
        user_id: UserId,
        pair: Pair,
        position_side: Side,
        spec: &OrderSpec,
        reference_price: Price,
        status: OrderStatus,
        timestamp: Timestamp,
    ) -> Result<Self, OrderError> {
        spec.validate()?;

        let trigger_price = spec.trigger_price.and_then(Price::new);
        let mut order = Self {
            id,
            position_id,
            user_id,
            pair,
            position_side,
            order_type: spec.order_type,
            trigger_source: spec.trigger_source,
            trigger_price,
            percentage: spec.percentage,
            trailing_percentage: spec.trailing_percentage,
            highest_price: None,
            lowest_price: None,
            current_trigger_price: None,
            status,
            created_at: timestamp,
            triggered_at: None,
            cancelled_at: None,
            cancel_reason: None,
            fill_price: None,
        };

        if order.order_type == OrderType::TrailingStop {
            order.observe(reference_price);
        }

        Ok(order)
    }

    pub fn is_active(&self) -> bool {
        self.status == OrderStatus::Active
    }

    pub fn trigger_condition(&self) -> TriggerCondition {
        match (self.order_type, self.position_side) {
            (OrderType::StopLoss | OrderType::TrailingStop, Side::Long) => TriggerCondition::Below,
            (OrderType::StopLoss | OrderType::TrailingStop, Side::Short) => TriggerCondition::Above,
            (OrderType::TakeProfit, Side::Long) => TriggerCondition::Above,
            (OrderType::TakeProfit, Side::Short) => TriggerCondition::Below,
        }
    }

    /// The price the crossing test uses: fixed for SL/TP, live for trailing stops.
    pub fn effective_trigger_price(&self) -> Option<Price> {
        match self.order_type {
            OrderType::TrailingStop => self.current_trigger_price,
            _ => self.trigger_price,
        }
    }

    pub fn extremum(&self) -> Option<Price> {
        match self.position_side {
            Side::Long => self.highest_price,
            Side::Short => self.lowest_price,
        }
    }

    /// Trailing stops only: ratchet the extremum and, when it moved, recompute
    /// the live trigger. Returns true when anything changed.
    pub fn observe(&mut self, price: Price) -> bool {
        if self.order_type != OrderType::TrailingStop {
            return false;
        }
        let Some(pct) = self.trailing_percentage else {
            return false;
        };
        let Some(extremum) = ratchet_extremum(self.position_side, self.extremum(), price) else {
            return false;
        };

        match self.position_side {
            Side::Long => self.highest_price = Some(extremum),
            Side::Short => self.lowest_price = Some(extremum),
        }
        self.current_trigger_price = Some(trailing_trigger_price(self.position_side, extremum, pct));
        true
    }

    /// Check if this order should trigger at the given price.
    pub fn should_trigger(&self, price: Price) -> bool {
        let Some(trigger) = self.effective_trigger_price() else {
            return false;
        };
        match self.trigger_condition() {
            TriggerCondition::Above => price >= trigger,
            TriggerCondition::Below => price <= trigger,
        }
    }

    /// One tick of evaluation: trailing update first, then the crossing test on the
    /// same price. Returns the fire price. Does not change status.
    pub fn evaluate(&mut self, prices: &TriggerPrices) -> Option<Price> {
        if !self.is_active() {
            return None;
        }
        let price = prices.for_source(self.trigger_source);
        self.observe(price);
        self.should_trigger(price).then_some(price)
    }

    pub fn activate(&mut self) -> bool {
        if self.status == OrderStatus::Pending {
            self.status = OrderStatus::Active;
            true
        } else {
            false
        }
    }

    pub fn mark_triggered(&mut self, fill_price: Price, timestamp: Timestamp) -> Result<(), OrderError> {
        if self.status != OrderStatus::Active {
            return Err(OrderError::OrderNotActive {
                id: self.id,
                status: self.status,
            });
        }
        self.status = OrderStatus::Triggered;
        self.triggered_at = Some(timestamp);
        self.fill_price = Some(fill_price);
        Ok(())
    }

    pub fn cancel(&mut self, reason: CancelReason, timestamp: Timestamp) -> Result<(), OrderError> {
        if self.status.is_terminal() {
            return Err(OrderError::OrderNotActive {
                id: self.id,
                status: self.status,
            });
        }
        self.status = OrderStatus::Cancelled;
        self.cancelled_at = Some(timestamp);
        self.cancel_reason = Some(reason);
        Ok(())
    }

    /// Fraction of the position this order closes, in (0, 1].
    pub fn close_fraction(&self) -> Decimal {
        self.percentage.map(percent_to_fraction).unwrap_or(Decimal::ONE)
    }

    pub fn close_reason(&self) -> CloseReason {
        match self.order_type {
            OrderType::StopLoss => CloseReason::StopLoss,
            OrderType::TakeProfit => CloseReason::TakeProfit,
            OrderType::TrailingStop => CloseReason::TrailingStop,
        }
    }
}

/// The orders of one position, in attach order.
#[derive(Debug, Clone, Default)]
pub struct PositionOrders {
    orders: Vec<ConditionalOrder>,
}

impl PositionOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, order: ConditionalOrder) {
        self.orders.push(order);
    }

    pub fn get(&self, id: OrderId) -> Option<&ConditionalOrder> {
        self.orders.iter().find(|o| o.id == id)
    }

    pub fn get_mut(&mut self, id: OrderId) -> Option<&mut ConditionalOrder> {
        self.orders.iter_mut().find(|o| o.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConditionalOrder> {
        self.orders.iter()
    }

    pub fn active_ids(&self) -> Vec<OrderId> {
        self.orders.iter().filter(|o| o.is_active()).map(|o| o.id).collect()
    }

    /// Pending → active for every pending order. Returns the activated orders.
    pub fn activate_pending(&mut self) -> Vec<ConditionalOrder> {
        self.orders
            .iter_mut()
            .filter_map(|o| o.activate().then(|| o.clone()))
            .collect()
    }

    /// Cancel every non-terminal order. Returns the orders that were cancelled.
    pub fn cancel_all_open(&mut self, reason: CancelReason, timestamp: Timestamp) -> Vec<ConditionalOrder> {
        self.orders
            .iter_mut()
            .filter_map(|o| o.cancel(reason, timestamp).ok().map(|_| o.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ConditionalOrder> {
        self.orders.clone()
    }

    pub fn open_count(&self) -> usize {
        self.orders.iter().filter(|o| !o.status.is_terminal()).count()
    }

    /// Total number of orders, terminal ones included.
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
