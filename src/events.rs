// 11.0: every state transition produces an event. used for audit trails and for
// tests that want to see what the engine decided. the EventPayload enum lists all
// event types. the log is bounded, oldest events drop first.

use crate::conditional::{CancelReason, OrderType};
use crate::position::CloseReason;
use crate::types::{OrderId, Pair, PositionId, Price, Quote, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Position events
    PositionOpened(PositionOpenedEvent),
    PositionConfirmed { position_id: PositionId, activated_orders: usize },
    PositionReduced(PositionReducedEvent),
    PositionClosed(PositionClosedEvent),
    PositionLiquidated(PositionLiquidatedEvent),

    // Account events
    Deposit { user_id: UserId, amount: Quote, new_balance: Quote },
    Withdrawal { user_id: UserId, amount: Quote, new_balance: Quote },
    FundingCharged(FundingChargedEvent),

    // Order events
    OrderAttached(OrderAttachedEvent),
    OrderTriggered(OrderTriggeredEvent),
    OrderCancelled { order_id: OrderId, position_id: PositionId, reason: CancelReason },

    // Feed events
    EvaluationSkipped { pair: Pair, observed_at: Timestamp, reason: String },
    TickRejected { pair: Pair, observed_at: Timestamp, last_seen: Timestamp },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionOpenedEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub pair: Pair,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Price,
    pub margin: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionReducedEvent {
    pub position_id: PositionId,
    pub closed_size: Decimal,
    pub remaining_size: Decimal,
    pub exit_price: Price,
    pub realized_pnl: Quote,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    pub position_id: PositionId,
    pub exit_price: Price,
    pub realized_pnl: Quote,
    pub payout: Quote,
    pub reason: CloseReason,
    pub cancelled_orders: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionLiquidatedEvent {
    pub position_id: PositionId,
    pub mark_price: Price,
    pub margin_ratio: Decimal,
    pub equity: Quote,
    pub bad_debt: Quote,
    pub cancelled_orders: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingChargedEvent {
    pub position_id: PositionId,
    pub intervals: i64,
    /// Positive when the position paid.
    pub amount: Quote,
    pub accumulated: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAttachedEvent {
    pub order_id: OrderId,
    pub position_id: PositionId,
    pub order_type: OrderType,
    pub pending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTriggeredEvent {
    pub order_id: OrderId,
    pub position_id: PositionId,
    pub order_type: OrderType,
    pub fill_price: Price,
    pub close_fraction: Decimal,
}

/// Bounded, append-only audit log.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<Event>,
    next_id: u64,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            capacity: capacity.max(1),
        }
    }

    pub fn emit(&mut self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        tracing::trace!(event_id = id.0, ?payload, "event");
        self.events.push_back(Event::new(id, timestamp, payload));

        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        id
    }

    pub fn recent(&self, count: usize) -> Vec<Event> {
        let start = self.events.len().saturating_sub(count);
        self.events.iter().skip(start).cloned().collect()
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total emitted, including the ones that fell off the front.
    pub fn total_emitted(&self) -> u64 {
        self.next_id - 1
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skipped(ts: i64) -> EventPayload {
        EventPayload::EvaluationSkipped {
            pair: Pair::wld_numa(),
            observed_at: Timestamp::from_millis(ts),
            reason: "degraded".into(),
        }
    }

    #[test]
    fn ids_are_sequential() {
        let mut log = EventLog::new(10);
        let a = log.emit(Timestamp::from_millis(1), skipped(1));
        let b = log.emit(Timestamp::from_millis(2), skipped(2));
        assert_eq!(a, EventId(1));
        assert_eq!(b, EventId(2));
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut log = EventLog::new(2);
        for ts in 0..5 {
            log.emit(Timestamp::from_millis(ts), skipped(ts));
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.total_emitted(), 5);
        assert_eq!(log.all()[0].id, EventId(4));
        assert_eq!(log.recent(1)[0].id, EventId(5));
    }

    #[test]
    fn events_serialize() {
        let mut log = EventLog::default();
        log.emit(Timestamp::from_millis(0), skipped(0));
        let json = serde_json::to_string(&log.all()).unwrap();
        assert!(json.contains("EvaluationSkipped"));
    }
}
