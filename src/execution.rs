//! Execution sink: where decisions become ledger transitions, and ledger
//! transitions become persistence and settlement work.
//!
//! The sink applies an intent to a position slot the caller already holds, then
//! queues the resulting records on an [`Outbox`]. Queuing never blocks, so tick
//! processing never waits on the store or the chain. The dispatcher tasks drain
//! the queues in FIFO order and retry with backoff; a failed write is retried as
//! the same record, the decision behind it is never re-derived.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::conditional::{ConditionalOrder, OrderSpec, TriggerPrices};
use crate::config::RetryPolicy;
use crate::ledger::{
    Closure, Ledger, LedgerError, Liquidation, LiquidationOutcome, OpenedPosition, PartialClosure, PositionSlot,
    PositionSpec,
};
use crate::liquidation::LiquidationParams;
use crate::position::{CloseReason, Position};
use crate::settlement::{SettlementContract, SettlementInstruction};
use crate::store::{OrderRecord, PositionRecord, Repository};
use crate::types::{OrderId, PositionId, Price, Timestamp};

/// A decided transition, ready to apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExecutionIntent {
    /// Close `fraction` of the position (1 = full close) at `exit_price`.
    Close {
        position_id: PositionId,
        reason: CloseReason,
        exit_price: Price,
        fraction: Decimal,
        order_id: Option<OrderId>,
    },
    Liquidate {
        position_id: PositionId,
        mark_price: Price,
    },
}

impl ExecutionIntent {
    pub fn position_id(&self) -> PositionId {
        match self {
            ExecutionIntent::Close { position_id, .. } | ExecutionIntent::Liquidate { position_id, .. } => *position_id,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Applied {
    Closed(Closure),
    Reduced(PartialClosure),
    Liquidated(Liquidation),
    /// Liquidation re-requested on an already-liquidated or healthy position.
    Unchanged,
}

impl Applied {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Applied::Closed(_) | Applied::Liquidated(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PersistJob {
    /// A new position with its brackets. Success confirms the position.
    OpenPosition {
        position: PositionRecord,
        orders: Vec<OrderRecord>,
    },
    SavePosition(PositionRecord),
    SaveOrder(OrderRecord),
}

impl PersistJob {
    fn describe(&self) -> String {
        match self {
            PersistJob::OpenPosition { position, .. } => format!("open pos-{}", position.id),
            PersistJob::SavePosition(p) => format!("position pos-{}", p.id),
            PersistJob::SaveOrder(o) => format!("order ord-{}", o.id),
        }
    }
}

/// Where the sink queues work. Must not block.
pub trait Outbox: Send + Sync {
    fn persist(&self, job: PersistJob);

    fn settle(&self, instruction: SettlementInstruction);
}

/// Outbox that only records. For synchronous tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingOutbox {
    persisted: Mutex<Vec<PersistJob>>,
    settled: Mutex<Vec<SettlementInstruction>>,
}

impl RecordingOutbox {
    pub fn persisted(&self) -> Vec<PersistJob> {
        self.persisted.lock().clone()
    }

    pub fn settled(&self) -> Vec<SettlementInstruction> {
        self.settled.lock().clone()
    }
}

impl Outbox for RecordingOutbox {
    fn persist(&self, job: PersistJob) {
        self.persisted.lock().push(job);
    }

    fn settle(&self, instruction: SettlementInstruction) {
        self.settled.lock().push(instruction);
    }
}

pub struct ExecutionSink {
    ledger: Arc<Ledger>,
    outbox: Arc<dyn Outbox>,
    liquidation: LiquidationParams,
}

impl ExecutionSink {
    pub fn new(ledger: Arc<Ledger>, outbox: Arc<dyn Outbox>, liquidation: LiquidationParams) -> Self {
        Self {
            ledger,
            outbox,
            liquidation,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn open_position(
        &self,
        spec: &PositionSpec,
        entry_price: Price,
        reference: &TriggerPrices,
        now: Timestamp,
    ) -> Result<OpenedPosition, LedgerError> {
        let opened = self.ledger.open_position(spec, entry_price, reference, now)?;
        self.outbox.persist(PersistJob::OpenPosition {
            position: PositionRecord::from(&opened.position),
            orders: opened.orders.iter().map(OrderRecord::from).collect(),
        });
        Ok(opened)
    }

    pub fn attach_order(
        &self,
        position_id: PositionId,
        spec: &OrderSpec,
        reference: &TriggerPrices,
        now: Timestamp,
    ) -> Result<ConditionalOrder, LedgerError> {
        let order = self.ledger.attach_order(position_id, spec, reference, now)?;
        self.record_order(&order);
        Ok(order)
    }

    pub fn cancel_order(&self, order_id: OrderId, now: Timestamp) -> Result<ConditionalOrder, LedgerError> {
        let order = self.ledger.cancel_order(order_id, now)?;
        self.record_order(&order);
        Ok(order)
    }

    pub fn close_position(
        &self,
        position_id: PositionId,
        exit_price: Price,
        now: Timestamp,
    ) -> Result<Closure, LedgerError> {
        let slot = self
            .ledger
            .slot(position_id)
            .ok_or(LedgerError::PositionNotFound(position_id))?;
        let mut slot = slot.lock();
        let intent = ExecutionIntent::Close {
            position_id,
            reason: CloseReason::UserRequested,
            exit_price,
            fraction: Decimal::ONE,
            order_id: None,
        };
        match self.apply_locked(&mut slot, intent, now)? {
            Applied::Closed(closure) => Ok(closure),
            _ => Err(LedgerError::PositionNotOpen {
                id: position_id,
                status: slot.position.status,
            }),
        }
    }

    pub fn record_order(&self, order: &ConditionalOrder) {
        self.outbox.persist(PersistJob::SaveOrder(OrderRecord::from(order)));
    }

    pub fn record_position(&self, position: &Position) {
        self.outbox.persist(PersistJob::SavePosition(PositionRecord::from(position)));
    }

    /// Apply `intent` to a slot the caller holds locked.
    pub fn apply_locked(
        &self,
        slot: &mut PositionSlot,
        intent: ExecutionIntent,
        now: Timestamp,
    ) -> Result<Applied, LedgerError> {
        let (applied, reason, order_id) = match intent {
            ExecutionIntent::Close {
                reason,
                exit_price,
                fraction,
                order_id,
                ..
            } => {
                let applied = if fraction >= Decimal::ONE {
                    Applied::Closed(self.ledger.close_locked(slot, reason, exit_price, now)?)
                } else {
                    Applied::Reduced(self.ledger.reduce_locked(slot, fraction, reason, exit_price, now)?)
                };
                if let Some(order) = order_id.and_then(|id| slot.orders.get(id)) {
                    self.record_order(order);
                }
                (applied, reason, order_id)
            }
            ExecutionIntent::Liquidate { mark_price, .. } => {
                let applied = match self.ledger.liquidate_locked(slot, mark_price, &self.liquidation, now)? {
                    LiquidationOutcome::Liquidated(liq) => Applied::Liquidated(liq),
                    LiquidationOutcome::AlreadyLiquidated | LiquidationOutcome::Healthy { .. } => Applied::Unchanged,
                };
                (applied, CloseReason::Liquidation, None)
            }
        };

        self.enqueue(&applied, reason, order_id);
        Ok(applied)
    }

    fn enqueue(&self, applied: &Applied, reason: CloseReason, order_id: Option<OrderId>) {
        let (position, cancelled, closed_size) = match applied {
            Applied::Closed(c) => (&c.position, c.cancelled_orders.as_slice(), c.reduction.closed_size),
            Applied::Reduced(r) => (&r.position, &[][..], r.reduction.closed_size),
            Applied::Liquidated(l) => (&l.position, l.cancelled_orders.as_slice(), l.position.size),
            Applied::Unchanged => return,
        };

        self.record_position(position);
        for order in cancelled {
            self.record_order(order);
        }

        match SettlementInstruction::new(position.id, position.current_price, reason, closed_size, order_id) {
            Ok(instruction) => self.outbox.settle(instruction),
            Err(e) => error!(position_id = %position.id, error = %e, "Cannot build settlement instruction"),
        }
    }
}

// ---- dispatchers ----

enum Message<T> {
    Job(T),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// A job that ran out of retries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub description: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Default)]
pub struct DispatchState {
    dead_letters: Mutex<Vec<DeadLetter>>,
    /// Latest snapshot of every order with a save still in the queue. At most one
    /// queued save per order: newer snapshots replace the queued one in place.
    queued_orders: Mutex<HashMap<u64, OrderRecord>>,
    persisted: AtomicU64,
    settled: AtomicU64,
    retries: AtomicU64,
    coalesced: AtomicU64,
}

impl DispatchState {
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().clone()
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::SeqCst)
    }

    pub fn settled(&self) -> u64 {
        self.settled.load(Ordering::SeqCst)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Order snapshots folded into an already queued save.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::SeqCst)
    }

    // newest snapshot for a queued save, taken as the dispatcher picks it up
    fn take_order(&self, record: OrderRecord) -> OrderRecord {
        self.queued_orders.lock().remove(&record.id).unwrap_or(record)
    }
}

/// Sending side of the dispatcher queues. Cheap to clone.
#[derive(Clone)]
pub struct DispatchHandle {
    persist_tx: mpsc::UnboundedSender<Message<PersistJob>>,
    settle_tx: mpsc::UnboundedSender<Message<SettlementInstruction>>,
    state: Arc<DispatchState>,
}

impl DispatchHandle {
    pub fn state(&self) -> &Arc<DispatchState> {
        &self.state
    }

    /// Resolves once everything queued before this call has been handled
    /// (written, or dead-lettered).
    pub async fn flush(&self) {
        let (ptx, prx) = oneshot::channel();
        let (stx, srx) = oneshot::channel();
        if self.persist_tx.send(Message::Flush(ptx)).is_ok() {
            let _ = prx.await;
        }
        if self.settle_tx.send(Message::Flush(stx)).is_ok() {
            let _ = srx.await;
        }
    }

    pub fn shutdown(&self) {
        let _ = self.persist_tx.send(Message::Shutdown);
        let _ = self.settle_tx.send(Message::Shutdown);
    }
}

impl Outbox for DispatchHandle {
    fn persist(&self, job: PersistJob) {
        if let PersistJob::SaveOrder(record) = &job {
            let mut queued = self.state.queued_orders.lock();
            if let Some(latest) = queued.get_mut(&record.id) {
                *latest = record.clone();
                self.state.coalesced.fetch_add(1, Ordering::SeqCst);
                return;
            }
            queued.insert(record.id, record.clone());
        }
        if let Err(mpsc::error::SendError(message)) = self.persist_tx.send(Message::Job(job)) {
            if let Message::Job(PersistJob::SaveOrder(record)) = message {
                self.state.queued_orders.lock().remove(&record.id);
            }
            warn!("Persistence dispatcher is gone, dropping job");
        }
    }

    fn settle(&self, instruction: SettlementInstruction) {
        if self.settle_tx.send(Message::Job(instruction)).is_err() {
            warn!("Settlement dispatcher is gone, dropping instruction");
        }
    }
}

pub struct Dispatchers {
    pub persistence: JoinHandle<()>,
    pub settlement: JoinHandle<()>,
}

/// Starts the persistence and settlement dispatcher tasks.
pub fn spawn_dispatchers(
    ledger: Arc<Ledger>,
    repository: Arc<dyn Repository>,
    contract: Arc<dyn SettlementContract>,
    retry: RetryPolicy,
) -> (DispatchHandle, Dispatchers) {
    let (persist_tx, persist_rx) = mpsc::unbounded_channel();
    let (settle_tx, settle_rx) = mpsc::unbounded_channel();
    let state = Arc::new(DispatchState::default());

    let persistence = tokio::spawn(run_persistence(ledger, repository, retry.clone(), state.clone(), persist_rx));
    let settlement = tokio::spawn(run_settlement(contract, retry, state.clone(), settle_rx));

    (
        DispatchHandle {
            persist_tx,
            settle_tx,
            state,
        },
        Dispatchers {
            persistence,
            settlement,
        },
    )
}

async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, state: &DispatchState, what: &str, mut op: F) -> Result<T, (E, u32)>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(job = what, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt < max => {
                let delay = policy.delay_for(attempt);
                warn!(
                    job = what,
                    attempt,
                    max_attempts = max,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                state.retries.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

fn dead_letter(state: &DispatchState, description: String, error: String, attempts: u32) {
    error!(job = %description, error = %error, attempts, "Giving up, moved to dead letters");
    state.dead_letters.lock().push(DeadLetter {
        description,
        error,
        attempts,
    });
}

async fn run_persistence(
    ledger: Arc<Ledger>,
    repository: Arc<dyn Repository>,
    retry: RetryPolicy,
    state: Arc<DispatchState>,
    mut rx: mpsc::UnboundedReceiver<Message<PersistJob>>,
) {
    while let Some(message) = rx.recv().await {
        let job = match message {
            Message::Job(job) => job,
            Message::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            Message::Shutdown => break,
        };
        let what = job.describe();
        let repo: &dyn Repository = repository.as_ref();

        let result = match &job {
            PersistJob::OpenPosition { position, orders } => {
                let saved = with_retry(&retry, &state, &what, || async move {
                    repo.save_position(position).await?;
                    for order in orders {
                        repo.save_order(order).await?;
                    }
                    Ok::<_, crate::store::StoreError>(())
                })
                .await;
                if saved.is_ok() {
                    confirm(&ledger, repo, &retry, &state, PositionId(position.id)).await;
                }
                saved
            }
            PersistJob::SavePosition(record) => with_retry(&retry, &state, &what, || repo.save_position(record)).await,
            PersistJob::SaveOrder(record) => {
                let latest = state.take_order(record.clone());
                with_retry(&retry, &state, &what, || repo.save_order(&latest)).await
            }
        };

        match result {
            Ok(()) => {
                state.persisted.fetch_add(1, Ordering::SeqCst);
                debug!(job = %what, "Persisted");
            }
            Err((e, attempts)) => dead_letter(&state, what, e.to_string(), attempts),
        }
    }
    debug!("Persistence dispatcher stopped");
}

// the open is durable: activate pending brackets and write their new status
async fn confirm(
    ledger: &Ledger,
    repository: &dyn Repository,
    retry: &RetryPolicy,
    state: &DispatchState,
    position_id: PositionId,
) {
    let activated = match ledger.confirm_open(position_id, Timestamp::now()) {
        Ok(orders) => orders,
        Err(e) => {
            warn!(position_id = %position_id, error = %e, "Confirmation failed");
            return;
        }
    };
    for order in activated {
        let record = OrderRecord::from(&order);
        let what = format!("order ord-{}", record.id);
        if let Err((e, attempts)) = with_retry(retry, state, &what, || repository.save_order(&record)).await {
            dead_letter(state, what, e.to_string(), attempts);
        }
    }
}

async fn run_settlement(
    contract: Arc<dyn SettlementContract>,
    retry: RetryPolicy,
    state: Arc<DispatchState>,
    mut rx: mpsc::UnboundedReceiver<Message<SettlementInstruction>>,
) {
    while let Some(message) = rx.recv().await {
        let instruction = match message {
            Message::Job(instruction) => instruction,
            Message::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            Message::Shutdown => break,
        };
        let what = format!("settle {}", instruction.position_id);
        let contract: &dyn SettlementContract = contract.as_ref();

        match with_retry(&retry, &state, &what, || contract.submit(&instruction)).await {
            Ok(receipt) => {
                state.settled.fetch_add(1, Ordering::SeqCst);
                info!(position_id = %instruction.position_id, tx = %receipt.tx_hash, "Settled");
            }
            Err((e, attempts)) => dead_letter(&state, what, e.to_string(), attempts),
        }
    }
    debug!("Settlement dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditional::{OrderStatus, TriggerPrices};
    use crate::position::PositionStatus;
    use crate::settlement::{InMemorySettlement, ReasonCode};
    use crate::store::InMemoryRepository;
    use crate::types::{Pair, Quote, Side, UserId};
    use rust_decimal_macros::dec;

    fn price(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn setup() -> (Arc<Ledger>, Arc<RecordingOutbox>, ExecutionSink) {
        let ledger = Arc::new(Ledger::default());
        ledger.deposit(UserId(1), Quote::new(dec!(100)), Timestamp::from_millis(0));
        let outbox = Arc::new(RecordingOutbox::default());
        let sink = ExecutionSink::new(ledger.clone(), outbox.clone(), LiquidationParams::default());
        (ledger, outbox, sink)
    }

    fn open(sink: &ExecutionSink) -> OpenedPosition {
        let spec = PositionSpec::new(UserId(1), Pair::wld_numa(), Side::Long, dec!(100), dec!(10), dec!(25))
            .with_bracket(OrderSpec::stop_loss(dec!(2.30)));
        sink.open_position(&spec, price(dec!(2.50)), &TriggerPrices::same(price(dec!(2.50))), Timestamp::from_millis(0))
            .unwrap()
    }

    #[test]
    fn open_queues_position_with_brackets() {
        let (_, outbox, sink) = setup();
        open(&sink);
        match &outbox.persisted()[0] {
            PersistJob::OpenPosition { position, orders } => {
                assert_eq!(position.entry_price, dec!(2.5));
                assert_eq!(orders.len(), 1);
                assert_eq!(orders[0].status, OrderStatus::Pending);
            }
            other => panic!("unexpected job {other:?}"),
        }
    }

    #[test]
    fn liquidation_queues_records_and_settlement() {
        let (ledger, outbox, sink) = setup();
        let opened = open(&sink);
        let slot = ledger.slot(opened.position.id).unwrap();

        let applied = sink
            .apply_locked(
                &mut slot.lock(),
                ExecutionIntent::Liquidate {
                    position_id: opened.position.id,
                    mark_price: price(dec!(2.27)),
                },
                Timestamp::from_millis(5),
            )
            .unwrap();
        assert!(applied.is_terminal());

        let settled = outbox.settled();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].reason_code, ReasonCode::Liquidation);
        assert_eq!(settled[0].exit_price, 2_270_000);

        // open + position + cascaded cancel of the bracket
        let jobs = outbox.persisted();
        assert_eq!(jobs.len(), 3);
        assert!(matches!(&jobs[1], PersistJob::SavePosition(p) if p.status == PositionStatus::Liquidated));
        assert!(matches!(&jobs[2], PersistJob::SaveOrder(o) if o.status == OrderStatus::Cancelled));

        // re-applying is a no-op and queues nothing
        let again = sink
            .apply_locked(
                &mut slot.lock(),
                ExecutionIntent::Liquidate {
                    position_id: opened.position.id,
                    mark_price: price(dec!(2.00)),
                },
                Timestamp::from_millis(6),
            )
            .unwrap();
        assert!(matches!(again, Applied::Unchanged));
        assert_eq!(outbox.settled().len(), 1);
    }

    #[test]
    fn user_close_settles_with_user_reason() {
        let (_, outbox, sink) = setup();
        let opened = open(&sink);
        let closure = sink
            .close_position(opened.position.id, price(dec!(2.60)), Timestamp::from_millis(1))
            .unwrap();
        assert_eq!(closure.payout.value(), dec!(35));
        assert_eq!(outbox.settled()[0].reason_code, ReasonCode::UserClose);
        assert!(sink.close_position(opened.position.id, price(dec!(2.60)), Timestamp::from_millis(2)).is_err());
    }

    #[tokio::test]
    async fn dispatcher_confirms_open_after_persist() {
        let ledger = Arc::new(Ledger::default());
        ledger.deposit(UserId(1), Quote::new(dec!(100)), Timestamp::from_millis(0));
        let repo = Arc::new(InMemoryRepository::new());
        let contract = Arc::new(InMemorySettlement::new());
        let retry = RetryPolicy {
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        };
        let (handle, _tasks) = spawn_dispatchers(ledger.clone(), repo.clone(), contract.clone(), retry);
        let sink = ExecutionSink::new(ledger.clone(), Arc::new(handle.clone()), LiquidationParams::default());

        repo.fail_next(2);
        let opened = open(&sink);
        handle.flush().await;

        let position = ledger.get_position(opened.position.id).unwrap();
        assert!(position.confirmed);
        let orders = ledger.list_orders(opened.position.id).unwrap();
        assert_eq!(orders[0].status, OrderStatus::Active);
        assert_eq!(repo.order(orders[0].id).unwrap().status, OrderStatus::Active);
        assert_eq!(handle.state().retries(), 2);
        assert!(handle.state().dead_letters().is_empty());
    }

    #[tokio::test]
    async fn queued_order_saves_collapse_to_latest_snapshot() {
        let ledger = Arc::new(Ledger::default());
        ledger.deposit(UserId(1), Quote::new(dec!(100)), Timestamp::from_millis(0));
        let repo = Arc::new(InMemoryRepository::new());
        let contract = Arc::new(InMemorySettlement::new());
        let retry = RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryPolicy::default()
        };
        let (handle, _tasks) = spawn_dispatchers(ledger.clone(), repo.clone(), contract, retry);
        let sink = ExecutionSink::new(ledger.clone(), Arc::new(handle.clone()), LiquidationParams::default());

        let opened = open(&sink);
        handle.flush().await;
        assert_eq!(repo.write_count(), 3);
        let order_id = opened.orders[0].id;

        // store outage: the head job keeps retrying while snapshots pile up behind it
        repo.fail_next(3);
        sink.record_position(&ledger.get_position(opened.position.id).unwrap());
        let active = ledger.get_order(order_id).unwrap();
        for _ in 0..50 {
            sink.record_order(&active);
        }
        sink.cancel_order(order_id, Timestamp::from_millis(1)).unwrap();
        handle.flush().await;

        assert_eq!(handle.state().coalesced(), 50);
        assert_eq!(repo.write_count(), 5);
        assert_eq!(repo.order(order_id).unwrap().status, OrderStatus::Cancelled);
        assert!(handle.state().dead_letters().is_empty());

        // once drained, the next snapshot queues normally
        sink.record_order(&ledger.get_order(order_id).unwrap());
        handle.flush().await;
        assert_eq!(handle.state().coalesced(), 50);
        assert_eq!(repo.write_count(), 6);
    }

    #[tokio::test]
    async fn settlement_gives_up_after_max_attempts() {
        let ledger = Arc::new(Ledger::default());
        ledger.deposit(UserId(1), Quote::new(dec!(100)), Timestamp::from_millis(0));
        let repo = Arc::new(InMemoryRepository::new());
        let contract = Arc::new(InMemorySettlement::new());
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        };
        let (handle, _tasks) = spawn_dispatchers(ledger.clone(), repo, contract.clone(), retry);
        let sink = ExecutionSink::new(ledger.clone(), Arc::new(handle.clone()), LiquidationParams::default());

        let opened = open(&sink);
        contract.fail_next(3);
        sink.close_position(opened.position.id, price(dec!(2.50)), Timestamp::from_millis(1))
            .unwrap();
        handle.flush().await;

        let dead = handle.state().dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert!(contract.accepted().is_empty());
        // the ledger keeps its decision
        assert_eq!(ledger.get_position(opened.position.id).unwrap().status, PositionStatus::Closed);
    }
}
