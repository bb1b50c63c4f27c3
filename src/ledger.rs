//! Position ledger: the single source of truth for positions, their orders,
//! collateral accounts, and the insurance fund.
//!
//! Every position lives in its own [`PositionSlot`] behind a `parking_lot::Mutex`,
//! so work on one position never blocks another. The slot holds the position
//! together with its conditional orders; anything that decides a position's
//! fate (tick evaluation, user cancel, close) does it while holding that one lock.
//!
//! Lock order is slot, then accounts, then insurance, then events. The index maps
//! are only held long enough to clone an `Arc` or a `Vec` of ids.

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountError};
use crate::conditional::{
    CancelReason, ConditionalOrder, OrderError, OrderSpec, OrderStatus, PositionOrders, TriggerPrices,
};
use crate::events::{
    Event, EventLog, EventPayload, FundingChargedEvent, OrderAttachedEvent, PositionClosedEvent,
    PositionLiquidatedEvent, PositionOpenedEvent, PositionReducedEvent,
};
use crate::funding::{apply_accrual, compute_accrual, FundingAccrual, FundingParams};
use crate::liquidation::{evaluate_liquidation, InsuranceFund, LiquidationParams, LiquidationStatus};
use crate::position::{reduce_position, CloseReason, Overflow, Position, PositionStatus, Reduction};
use crate::types::{Leverage, OrderId, Pair, PositionId, Price, Quote, Side, Timestamp, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerParams {
    pub min_leverage: Decimal,
    pub max_leverage: Decimal,
    /// Allowed shortfall of `margin * leverage` against entry notional (0.01 = 1%).
    pub margin_tolerance: Decimal,
    /// Largest size, in base units, a single position may open with.
    pub max_size: Decimal,
    /// Largest entry notional (size * entry price) a single position may open with.
    pub max_notional: Decimal,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self {
            min_leverage: Decimal::ONE,
            max_leverage: dec!(500),
            margin_tolerance: dec!(0.01),
            max_size: dec!(1_000_000_000_000),
            max_notional: dec!(1_000_000_000_000),
        }
    }
}

/// What a user asks for when opening a position. Entry price comes from the market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSpec {
    pub user_id: UserId,
    pub pair: Pair,
    pub side: Side,
    pub size: Decimal,
    pub leverage: Decimal,
    pub margin: Decimal,
    /// Orders attached at open. They stay pending until the open is confirmed.
    #[serde(default)]
    pub brackets: Vec<OrderSpec>,
}

impl PositionSpec {
    pub fn new(user_id: UserId, pair: Pair, side: Side, size: Decimal, leverage: Decimal, margin: Decimal) -> Self {
        Self {
            user_id,
            pair,
            side,
            size,
            leverage,
            margin,
            brackets: Vec::new(),
        }
    }

    pub fn with_bracket(mut self, order: OrderSpec) -> Self {
        self.brackets.push(order);
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Leverage {leverage} outside [{min}, {max}]")]
    InvalidLeverage { leverage: Decimal, min: Decimal, max: Decimal },

    #[error("Size must be positive, got {0}")]
    InvalidSize(Decimal),

    #[error("{what} {value} exceeds the limit of {limit}")]
    ExceedsLimit {
        what: &'static str,
        value: Decimal,
        limit: Decimal,
    },

    #[error("Margin {margin} at {leverage}x does not cover notional {notional}")]
    InsufficientMargin { margin: Decimal, leverage: Decimal, notional: Decimal },

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error("Position {0} not found")]
    PositionNotFound(PositionId),

    #[error("Position {id} is {status}")]
    PositionNotOpen { id: PositionId, status: PositionStatus },

    #[error("Order {0} not found")]
    OrderNotFound(OrderId),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("Pair {0} has no price yet")]
    NoPrice(Pair),

    #[error(transparent)]
    Overflow(#[from] Overflow),
}

/// A position and its orders, guarded together.
#[derive(Debug, Clone)]
pub struct PositionSlot {
    pub position: Position,
    pub orders: PositionOrders,
}

/// A full close, by user or by a triggered order.
#[derive(Debug, Clone)]
pub struct Closure {
    pub position: Position,
    pub reduction: Reduction,
    pub payout: Quote,
    pub cancelled_orders: Vec<ConditionalOrder>,
}

/// A partial close. The position stays open.
#[derive(Debug, Clone)]
pub struct PartialClosure {
    pub position: Position,
    pub reduction: Reduction,
    pub payout: Quote,
}

#[derive(Debug, Clone)]
pub struct Liquidation {
    pub position: Position,
    pub margin_ratio: Decimal,
    pub equity: Quote,
    pub bad_debt: Quote,
    pub cancelled_orders: Vec<ConditionalOrder>,
}

#[derive(Debug, Clone)]
pub enum LiquidationOutcome {
    Liquidated(Liquidation),
    /// Already liquidated earlier. Nothing changed.
    AlreadyLiquidated,
    /// Margin ratio still above the floor. Nothing changed.
    Healthy { margin_ratio: Decimal },
}

/// What the user gets back at open.
#[derive(Debug, Clone)]
pub struct OpenedPosition {
    pub position: Position,
    pub orders: Vec<ConditionalOrder>,
}

#[derive(Debug)]
pub struct Ledger {
    params: LedgerParams,
    slots: RwLock<HashMap<PositionId, Arc<Mutex<PositionSlot>>>>,
    open_by_pair: RwLock<HashMap<Pair, Vec<PositionId>>>,
    order_index: RwLock<HashMap<OrderId, PositionId>>,
    accounts: Mutex<HashMap<UserId, Account>>,
    insurance: Mutex<InsuranceFund>,
    events: Mutex<EventLog>,
    next_position_id: AtomicU64,
    next_order_id: AtomicU64,
}

impl Ledger {
    pub fn new(params: LedgerParams, event_capacity: usize) -> Self {
        Self {
            params,
            slots: RwLock::new(HashMap::new()),
            open_by_pair: RwLock::new(HashMap::new()),
            order_index: RwLock::new(HashMap::new()),
            accounts: Mutex::new(HashMap::new()),
            insurance: Mutex::new(InsuranceFund::default()),
            events: Mutex::new(EventLog::new(event_capacity)),
            next_position_id: AtomicU64::new(1),
            next_order_id: AtomicU64::new(1),
        }
    }

    pub fn params(&self) -> &LedgerParams {
        &self.params
    }

    // ---- accounts ----

    pub fn deposit(&self, user_id: UserId, amount: Quote, now: Timestamp) -> Quote {
        let new_balance = {
            let mut accounts = self.accounts.lock();
            let account = accounts.entry(user_id).or_insert_with(|| Account::new(user_id, now));
            account.deposit(amount);
            account.balance
        };
        self.emit(now, EventPayload::Deposit { user_id, amount, new_balance });
        new_balance
    }

    pub fn withdraw(&self, user_id: UserId, amount: Quote, now: Timestamp) -> Result<Quote, LedgerError> {
        let new_balance = {
            let mut accounts = self.accounts.lock();
            let account = accounts.get_mut(&user_id).ok_or(AccountError::UnknownAccount(user_id))?;
            account.withdraw(amount)?;
            account.balance
        };
        self.emit(now, EventPayload::Withdrawal { user_id, amount, new_balance });
        Ok(new_balance)
    }

    pub fn account(&self, user_id: UserId) -> Option<Account> {
        self.accounts.lock().get(&user_id).cloned()
    }

    pub fn insurance_fund(&self) -> InsuranceFund {
        self.insurance.lock().clone()
    }

    pub fn fund_insurance(&self, amount: Quote) {
        self.insurance.lock().deposit(amount);
    }

    // ---- lookups ----

    pub fn slot(&self, id: PositionId) -> Option<Arc<Mutex<PositionSlot>>> {
        self.slots.read().get(&id).cloned()
    }

    pub fn get_position(&self, id: PositionId) -> Option<Position> {
        self.slot(id).map(|slot| slot.lock().position.clone())
    }

    pub fn list_orders(&self, id: PositionId) -> Result<Vec<ConditionalOrder>, LedgerError> {
        let slot = self.slot(id).ok_or(LedgerError::PositionNotFound(id))?;
        let orders = slot.lock().orders.snapshot();
        Ok(orders)
    }

    pub fn get_order(&self, order_id: OrderId) -> Option<ConditionalOrder> {
        let position_id = self.order_index.read().get(&order_id).copied()?;
        let slot = self.slot(position_id)?;
        let order = slot.lock().orders.get(order_id).cloned();
        order
    }

    /// Ids of open positions on `pair`, in open order.
    pub fn open_positions_for_pair(&self, pair: &Pair) -> Vec<PositionId> {
        self.open_by_pair.read().get(pair).cloned().unwrap_or_default()
    }

    pub fn position_count(&self) -> usize {
        self.slots.read().len()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().all()
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        self.events.lock().recent(count)
    }

    pub(crate) fn emit(&self, timestamp: Timestamp, payload: EventPayload) {
        self.events.lock().emit(timestamp, payload);
    }

    // ---- open ----

    fn validate_spec(&self, spec: &PositionSpec, entry_price: Price) -> Result<Leverage, LedgerError> {
        let invalid_leverage = || LedgerError::InvalidLeverage {
            leverage: spec.leverage,
            min: self.params.min_leverage,
            max: self.params.max_leverage,
        };
        if spec.leverage < self.params.min_leverage || spec.leverage > self.params.max_leverage {
            return Err(invalid_leverage());
        }
        let leverage = Leverage::new(spec.leverage).ok_or_else(invalid_leverage)?;

        if spec.size <= Decimal::ZERO {
            return Err(LedgerError::InvalidSize(spec.size));
        }
        if spec.size > self.params.max_size {
            return Err(LedgerError::ExceedsLimit {
                what: "size",
                value: spec.size,
                limit: self.params.max_size,
            });
        }

        // past Decimal's range is past any cap
        let notional = spec.size.checked_mul(entry_price.value()).unwrap_or(Decimal::MAX);
        if notional > self.params.max_notional {
            return Err(LedgerError::ExceedsLimit {
                what: "notional",
                value: notional,
                limit: self.params.max_notional,
            });
        }
        let covered = spec.margin.checked_mul(spec.leverage).unwrap_or(Decimal::MAX);
        if spec.margin <= Decimal::ZERO || covered < notional * (Decimal::ONE - self.params.margin_tolerance) {
            return Err(LedgerError::InsufficientMargin {
                margin: spec.margin,
                leverage: spec.leverage,
                notional,
            });
        }

        for bracket in &spec.brackets {
            bracket.validate()?;
        }
        Ok(leverage)
    }

    /// Validates, reserves margin, and creates the position (unconfirmed) in one step.
    /// Brackets are created pending.
    pub fn open_position(
        &self,
        spec: &PositionSpec,
        entry_price: Price,
        reference: &TriggerPrices,
        now: Timestamp,
    ) -> Result<OpenedPosition, LedgerError> {
        let leverage = self.validate_spec(spec, entry_price)?;
        let margin = Quote::new(spec.margin);

        {
            let mut accounts = self.accounts.lock();
            match accounts.get_mut(&spec.user_id) {
                Some(account) => account.reserve_margin(margin)?,
                None => {
                    return Err(AccountError::InsufficientBalance {
                        requested: margin,
                        available: Quote::zero(),
                    }
                    .into())
                }
            }
        }

        let id = PositionId(self.next_position_id.fetch_add(1, Ordering::SeqCst));
        let position = Position::open(
            id,
            spec.user_id,
            spec.pair.clone(),
            spec.side,
            spec.size,
            entry_price,
            leverage,
            margin,
            now,
        );

        let mut orders = PositionOrders::new();
        for bracket in &spec.brackets {
            let order = self.new_order(&position, bracket, reference, OrderStatus::Pending, now)?;
            orders.insert(order);
        }
        let created = orders.snapshot();

        self.slots
            .write()
            .insert(id, Arc::new(Mutex::new(PositionSlot { position: position.clone(), orders })));
        self.open_by_pair.write().entry(spec.pair.clone()).or_default().push(id);
        {
            let mut index = self.order_index.write();
            for order in &created {
                index.insert(order.id, id);
            }
        }

        info!(
            position_id = %id,
            user_id = %spec.user_id,
            pair = %spec.pair,
            side = %spec.side,
            size = %spec.size,
            entry = %entry_price,
            leverage = %leverage,
            "Position opened"
        );
        self.emit(
            now,
            EventPayload::PositionOpened(PositionOpenedEvent {
                position_id: id,
                user_id: spec.user_id,
                pair: spec.pair.clone(),
                side: spec.side,
                size: spec.size,
                entry_price,
                margin,
            }),
        );
        for order in &created {
            self.emit_attached(order, now);
        }

        Ok(OpenedPosition { position, orders: created })
    }

    /// The store acknowledged the open: mark confirmed and activate pending orders.
    /// Returns the orders that were activated. Calling again is a no-op.
    pub fn confirm_open(&self, id: PositionId, now: Timestamp) -> Result<Vec<ConditionalOrder>, LedgerError> {
        let slot = self.slot(id).ok_or(LedgerError::PositionNotFound(id))?;
        let mut slot = slot.lock();
        if slot.position.confirmed {
            return Ok(Vec::new());
        }
        slot.position.confirmed = true;
        if !slot.position.is_open() {
            // closed before the store caught up; its orders are already cancelled
            return Ok(Vec::new());
        }
        let activated = slot.orders.activate_pending();
        debug!(position_id = %id, activated = activated.len(), "Position confirmed");
        self.emit(
            now,
            EventPayload::PositionConfirmed {
                position_id: id,
                activated_orders: activated.len(),
            },
        );
        Ok(activated)
    }

    // ---- orders ----

    fn new_order(
        &self,
        position: &Position,
        spec: &OrderSpec,
        reference: &TriggerPrices,
        status: OrderStatus,
        now: Timestamp,
    ) -> Result<ConditionalOrder, LedgerError> {
        let id = OrderId(self.next_order_id.fetch_add(1, Ordering::SeqCst));
        let order = ConditionalOrder::new(
            id,
            position.id,
            position.user_id,
            position.pair.clone(),
            position.side,
            spec,
            reference.for_source(spec.trigger_source),
            status,
            now,
        )?;
        Ok(order)
    }

    fn emit_attached(&self, order: &ConditionalOrder, now: Timestamp) {
        self.emit(
            now,
            EventPayload::OrderAttached(OrderAttachedEvent {
                order_id: order.id,
                position_id: order.position_id,
                order_type: order.order_type,
                pending: order.status == OrderStatus::Pending,
            }),
        );
    }

    /// Attach an order to an open position. Pending until the position is confirmed.
    pub fn attach_order(
        &self,
        position_id: PositionId,
        spec: &OrderSpec,
        reference: &TriggerPrices,
        now: Timestamp,
    ) -> Result<ConditionalOrder, LedgerError> {
        spec.validate()?;
        let slot = self.slot(position_id).ok_or(LedgerError::PositionNotFound(position_id))?;
        let order = {
            let mut slot = slot.lock();
            ensure_open(&slot.position)?;
            let status = if slot.position.confirmed {
                OrderStatus::Active
            } else {
                OrderStatus::Pending
            };
            let order = self.new_order(&slot.position, spec, reference, status, now)?;
            slot.orders.insert(order.clone());
            order
        };
        self.order_index.write().insert(order.id, position_id);

        info!(order_id = %order.id, position_id = %position_id, order_type = %order.order_type, status = %order.status, "Order attached");
        self.emit_attached(&order, now);
        Ok(order)
    }

    /// User cancel. Loses cleanly to a trigger that got the slot lock first.
    pub fn cancel_order(&self, order_id: OrderId, now: Timestamp) -> Result<ConditionalOrder, LedgerError> {
        let position_id = self
            .order_index
            .read()
            .get(&order_id)
            .copied()
            .ok_or(LedgerError::OrderNotFound(order_id))?;
        let slot = self.slot(position_id).ok_or(LedgerError::PositionNotFound(position_id))?;
        let mut slot = slot.lock();
        let order = slot.orders.get_mut(order_id).ok_or(LedgerError::OrderNotFound(order_id))?;
        order.cancel(CancelReason::UserRequested, now)?;
        let cancelled = order.clone();

        info!(order_id = %order_id, position_id = %position_id, "Order cancelled");
        self.emit(
            now,
            EventPayload::OrderCancelled {
                order_id,
                position_id,
                reason: CancelReason::UserRequested,
            },
        );
        Ok(cancelled)
    }

    // ---- price and funding, on a locked slot ----

    /// Records the new price on an open position and recomputes its PnL.
    pub fn apply_price_update(&self, id: PositionId, price: Price) -> Result<Position, LedgerError> {
        let slot = self.slot(id).ok_or(LedgerError::PositionNotFound(id))?;
        let mut slot = slot.lock();
        ensure_open(&slot.position)?;
        slot.position.apply_price(price)?;
        Ok(slot.position.clone())
    }

    /// Charges the whole intervals since the checkpoint. `Ok(None)` when nothing was due.
    pub fn accrue_funding_locked(
        &self,
        slot: &mut PositionSlot,
        now: Timestamp,
        params: &FundingParams,
    ) -> Result<Option<FundingAccrual>, LedgerError> {
        if !slot.position.is_open() {
            return Ok(None);
        }
        let Some(accrual) = compute_accrual(&slot.position, now, params)? else {
            return Ok(None);
        };
        apply_accrual(&mut slot.position, &accrual)?;

        debug!(
            position_id = %slot.position.id,
            intervals = accrual.intervals,
            amount = %accrual.amount,
            "Funding accrued"
        );
        self.emit(
            now,
            EventPayload::FundingCharged(FundingChargedEvent {
                position_id: slot.position.id,
                intervals: accrual.intervals,
                amount: accrual.amount,
                accumulated: slot.position.accumulated_funding,
            }),
        );
        Ok(Some(accrual))
    }

    // ---- terminal transitions, on a locked slot ----

    /// Full close: realize everything, release margin plus results, cancel every
    /// non-terminal order.
    pub fn close_locked(
        &self,
        slot: &mut PositionSlot,
        reason: CloseReason,
        exit_price: Price,
        now: Timestamp,
    ) -> Result<Closure, LedgerError> {
        ensure_open(&slot.position)?;
        let mut closed = slot.position.clone();
        let reduction = reduce_position(&mut closed, Decimal::ONE, exit_price)?;
        // reduce_position empties the size; restore it so the record shows what was closed
        closed.size = reduction.closed_size;
        closed.margin = slot.position.margin;
        closed.accumulated_funding = reduction.funding_share;
        closed.apply_price(exit_price)?;
        slot.position = closed;
        slot.position.finalize(PositionStatus::Closed, reason, exit_price, now);

        let payout = reduction.payout();
        let realized = reduction.realized_pnl.sub(reduction.funding_share);
        if let Some(account) = self.accounts.lock().get_mut(&slot.position.user_id) {
            account.settle_release(reduction.margin_released, payout, realized);
        }

        let cancelled = slot.orders.cancel_all_open(CancelReason::PositionClosed, now);
        self.retire(&slot.position, &cancelled, CancelReason::PositionClosed, now);

        info!(
            position_id = %slot.position.id,
            exit = %exit_price,
            pnl = %realized,
            reason = ?reason,
            "Position closed"
        );
        self.emit(
            now,
            EventPayload::PositionClosed(PositionClosedEvent {
                position_id: slot.position.id,
                exit_price,
                realized_pnl: realized,
                payout: payout.floor_zero(),
                reason,
                cancelled_orders: cancelled.len(),
            }),
        );

        Ok(Closure {
            position: slot.position.clone(),
            reduction,
            payout,
            cancelled_orders: cancelled,
        })
    }

    /// Partial close by `fraction` in (0, 1). The position and its other orders stay live.
    pub fn reduce_locked(
        &self,
        slot: &mut PositionSlot,
        fraction: Decimal,
        reason: CloseReason,
        exit_price: Price,
        now: Timestamp,
    ) -> Result<PartialClosure, LedgerError> {
        ensure_open(&slot.position)?;
        let reduction = reduce_position(&mut slot.position, fraction, exit_price)?;
        let payout = reduction.payout();
        let realized = reduction.realized_pnl.sub(reduction.funding_share);
        if let Some(account) = self.accounts.lock().get_mut(&slot.position.user_id) {
            account.settle_release(reduction.margin_released, payout, realized);
        }

        info!(
            position_id = %slot.position.id,
            closed = %reduction.closed_size,
            remaining = %slot.position.size,
            "Position reduced"
        );
        self.emit(
            now,
            EventPayload::PositionReduced(PositionReducedEvent {
                position_id: slot.position.id,
                closed_size: reduction.closed_size,
                remaining_size: slot.position.size,
                exit_price,
                realized_pnl: realized,
                reason,
            }),
        );

        Ok(PartialClosure {
            position: slot.position.clone(),
            reduction,
            payout,
        })
    }

    /// Liquidates when the margin ratio is at or under the floor. Idempotent: a
    /// liquidated position reports `AlreadyLiquidated` and nothing moves.
    pub fn liquidate_locked(
        &self,
        slot: &mut PositionSlot,
        mark_price: Price,
        params: &LiquidationParams,
        now: Timestamp,
    ) -> Result<LiquidationOutcome, LedgerError> {
        match slot.position.status {
            PositionStatus::Liquidated => return Ok(LiquidationOutcome::AlreadyLiquidated),
            PositionStatus::Closed => {
                return Err(LedgerError::PositionNotOpen {
                    id: slot.position.id,
                    status: slot.position.status,
                })
            }
            PositionStatus::Open => {}
        }

        slot.position.apply_price(mark_price)?;
        let (margin_ratio, equity) = match evaluate_liquidation(&slot.position, params) {
            LiquidationStatus::Safe { margin_ratio } => return Ok(LiquidationOutcome::Healthy { margin_ratio }),
            LiquidationStatus::Liquidatable { margin_ratio, equity } => (margin_ratio, equity),
        };

        let position = &slot.position;
        let realized = position
            .unrealized_pnl
            .value()
            .checked_sub(position.accumulated_funding.value())
            .map(Quote::new)
            .ok_or(Overflow("realized pnl"))?;
        let realized_total = position
            .realized_pnl
            .value()
            .checked_add(realized.value())
            .ok_or(Overflow("realized pnl"))?;
        slot.position.realized_pnl = Quote::new(realized_total);
        slot.position.finalize(PositionStatus::Liquidated, CloseReason::Liquidation, mark_price, now);

        if let Some(account) = self.accounts.lock().get_mut(&slot.position.user_id) {
            account.forfeit_margin(slot.position.margin, realized);
        }
        let bad_debt = self.insurance.lock().absorb(equity);

        let cancelled = slot.orders.cancel_all_open(CancelReason::PositionLiquidated, now);
        self.retire(&slot.position, &cancelled, CancelReason::PositionLiquidated, now);

        warn!(
            position_id = %slot.position.id,
            mark = %mark_price,
            margin_ratio = %margin_ratio,
            equity = %equity,
            bad_debt = %bad_debt,
            "Position liquidated"
        );
        self.emit(
            now,
            EventPayload::PositionLiquidated(PositionLiquidatedEvent {
                position_id: slot.position.id,
                mark_price,
                margin_ratio,
                equity,
                bad_debt,
                cancelled_orders: cancelled.len(),
            }),
        );

        Ok(LiquidationOutcome::Liquidated(Liquidation {
            position: slot.position.clone(),
            margin_ratio,
            equity,
            bad_debt,
            cancelled_orders: cancelled,
        }))
    }

    // drop a terminal position from the pair index and log its cascaded cancels
    fn retire(&self, position: &Position, cancelled: &[ConditionalOrder], reason: CancelReason, now: Timestamp) {
        if let Some(ids) = self.open_by_pair.write().get_mut(&position.pair) {
            ids.retain(|id| *id != position.id);
        }
        for order in cancelled {
            self.emit(
                now,
                EventPayload::OrderCancelled {
                    order_id: order.id,
                    position_id: position.id,
                    reason,
                },
            );
        }
    }

    // ---- locking convenience wrappers ----

    pub fn close_position(
        &self,
        id: PositionId,
        reason: CloseReason,
        exit_price: Price,
        now: Timestamp,
    ) -> Result<Closure, LedgerError> {
        let slot = self.slot(id).ok_or(LedgerError::PositionNotFound(id))?;
        let mut slot = slot.lock();
        self.close_locked(&mut slot, reason, exit_price, now)
    }

    pub fn liquidate_position(
        &self,
        id: PositionId,
        mark_price: Price,
        params: &LiquidationParams,
        now: Timestamp,
    ) -> Result<LiquidationOutcome, LedgerError> {
        let slot = self.slot(id).ok_or(LedgerError::PositionNotFound(id))?;
        let mut slot = slot.lock();
        self.liquidate_locked(&mut slot, mark_price, params, now)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(LedgerParams::default(), 10_000)
    }
}

fn ensure_open(position: &Position) -> Result<(), LedgerError> {
    if position.is_open() {
        Ok(())
    } else {
        Err(LedgerError::PositionNotOpen {
            id: position.id,
            status: position.status,
        })
    }
}
