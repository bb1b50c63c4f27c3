//! Conditional order evaluation and the order half of the public API.

use super::core::Engine;
use super::results::{EngineError, TickReport};
use crate::conditional::{ConditionalOrder, OrderSpec, TriggerPrices};
use crate::events::{EventPayload, OrderTriggeredEvent};
use crate::execution::{Applied, ExecutionIntent};
use crate::ledger::{LedgerError, PositionSlot};
use crate::types::{OrderId, PositionId, Timestamp};
use tracing::{info, warn};

impl Engine {
    /// Every active order of an open position, in attach order. The first order
    /// that fully closes the position ends the walk; its siblings are cancelled
    /// by the close.
    pub(super) fn evaluate_orders(
        &self,
        slot: &mut PositionSlot,
        prices: &TriggerPrices,
        now: Timestamp,
        report: &mut TickReport,
    ) {
        for order_id in slot.orders.active_ids() {
            if !slot.position.is_open() {
                break;
            }
            let Some(order) = slot.orders.get_mut(order_id) else {
                continue;
            };

            let extremum_before = order.extremum();
            let fired = order.evaluate(prices);
            let Some(fill_price) = fired else {
                if order.extremum() != extremum_before {
                    self.sink.record_order(order);
                }
                continue;
            };

            // the terminal transition is the gate: no second intent for this order
            if order.mark_triggered(fill_price, now).is_err() {
                continue;
            }
            let fraction = order.close_fraction();
            let reason = order.close_reason();
            let order_type = order.order_type;
            let position_id = order.position_id;

            info!(
                order_id = %order_id,
                position_id = %position_id,
                order_type = %order_type,
                price = %fill_price,
                "Order triggered"
            );
            self.ledger.emit(
                now,
                EventPayload::OrderTriggered(OrderTriggeredEvent {
                    order_id,
                    position_id,
                    order_type,
                    fill_price,
                    close_fraction: fraction,
                }),
            );
            report.triggered.push(order_id);

            let intent = ExecutionIntent::Close {
                position_id,
                reason,
                exit_price: fill_price,
                fraction,
                order_id: Some(order_id),
            };
            match self.sink.apply_locked(slot, intent, now) {
                Ok(Applied::Closed(_)) => report.closed.push(position_id),
                Ok(Applied::Reduced(_)) => report.reduced.push(position_id),
                Ok(_) => {}
                Err(e) => warn!(order_id = %order_id, error = %e, "Triggered order not applied"),
            }
        }
    }

    /// Attach an order. Trailing stops start from the current price on the
    /// order's trigger source.
    pub fn attach_order(
        &self,
        position_id: PositionId,
        spec: &OrderSpec,
        now: Timestamp,
    ) -> Result<ConditionalOrder, EngineError> {
        let position = self
            .ledger
            .get_position(position_id)
            .ok_or(LedgerError::PositionNotFound(position_id))?;
        let reference = match self.market_prices(&position.pair) {
            Some(prices) => prices.trigger_prices(),
            None => TriggerPrices::same(position.current_price),
        };
        Ok(self.sink.attach_order(position_id, spec, &reference, now)?)
    }

    /// User cancel. If a trigger on the same position got there first this
    /// fails with a state conflict and the order stays triggered.
    pub fn cancel_order(&self, order_id: OrderId, now: Timestamp) -> Result<ConditionalOrder, EngineError> {
        Ok(self.sink.cancel_order(order_id, now)?)
    }

    pub fn list_orders(&self, position_id: PositionId) -> Result<Vec<ConditionalOrder>, EngineError> {
        Ok(self.ledger.list_orders(position_id)?)
    }

    pub fn get_order(&self, order_id: OrderId) -> Option<ConditionalOrder> {
        self.ledger.get_order(order_id)
    }
}
