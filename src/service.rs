//! Async front door.
//!
//! One tokio task per trading pair drains a bounded tick queue and runs the
//! engine on each tick in arrival order, so a pair is strictly sequential while
//! pairs run in parallel. User operations go straight to the engine; they only
//! ever take one position lock, which is what makes a user cancel and a
//! same-tick trigger resolve to exactly one terminal state.
//!
//! Ledger time is feed time. Anything done to a position is stamped with its
//! pair's latest `observed_at`, the clock funding checkpoints are measured
//! against. Wall-clock time is only used before a pair has seen its first tick.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::conditional::{ConditionalOrder, OrderSpec};
use crate::config::EngineConfig;
use crate::engine::{Engine, EngineError, TickReport};
use crate::execution::{spawn_dispatchers, DispatchHandle, DispatchState, Dispatchers};
use crate::ledger::{Closure, Ledger, OpenedPosition, PositionSpec};
use crate::position::Position;
use crate::price_feed::{PriceTick, TickSink};
use crate::settlement::SettlementContract;
use crate::store::Repository;
use crate::types::{OrderId, Pair, PositionId, Price, Quote, Timestamp, UserId};

enum PipelineMessage {
    Tick(PriceTick),
    Flush(oneshot::Sender<()>),
}

struct Pipeline {
    tx: mpsc::Sender<PipelineMessage>,
    handle: JoinHandle<()>,
}

pub struct EngineService {
    engine: Arc<Engine>,
    dispatch: DispatchHandle,
    dispatchers: Mutex<Option<Dispatchers>>,
    pipelines: Mutex<HashMap<Pair, Pipeline>>,
    reports: Option<mpsc::UnboundedSender<TickReport>>,
}

impl EngineService {
    /// Validates `config` and starts the dispatcher tasks. Must run inside a tokio runtime.
    pub fn start(
        config: EngineConfig,
        repository: Arc<dyn Repository>,
        contract: Arc<dyn SettlementContract>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let ledger = Arc::new(Ledger::new(config.ledger.clone(), config.events.max_retained));
        let (dispatch, dispatchers) = spawn_dispatchers(ledger.clone(), repository, contract, config.retry.clone());
        let engine = Arc::new(Engine::new(config, ledger, Arc::new(dispatch.clone())));

        info!("Engine service started");
        Ok(Self {
            engine,
            dispatch,
            dispatchers: Mutex::new(Some(dispatchers)),
            pipelines: Mutex::new(HashMap::new()),
            reports: None,
        })
    }

    /// Every processed tick's report goes to the returned receiver.
    pub fn with_reports(mut self) -> (Self, mpsc::UnboundedReceiver<TickReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reports = Some(tx);
        (self, rx)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn dispatch_state(&self) -> &Arc<DispatchState> {
        self.dispatch.state()
    }

    fn pipeline_sender(&self, pair: &Pair) -> mpsc::Sender<PipelineMessage> {
        let mut pipelines = self.pipelines.lock();
        if let Some(pipeline) = pipelines.get(pair) {
            return pipeline.tx.clone();
        }

        let (tx, mut rx) = mpsc::channel(self.engine.config().pipeline.channel_capacity);
        let engine = self.engine.clone();
        let reports = self.reports.clone();
        let task_pair = pair.clone();
        let handle = tokio::spawn(async move {
            debug!(pair = %task_pair, "Pair pipeline started");
            while let Some(message) = rx.recv().await {
                match message {
                    PipelineMessage::Tick(tick) => {
                        let report = engine.process_tick(&tick);
                        if let Some(reports) = &reports {
                            let _ = reports.send(report);
                        }
                    }
                    PipelineMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(pair = %task_pair, "Pair pipeline stopped");
        });

        pipelines.insert(
            pair.clone(),
            Pipeline {
                tx: tx.clone(),
                handle,
            },
        );
        tx
    }

    /// Queue a tick on its pair's pipeline. Waits only when the queue is full.
    pub async fn ingest_tick(&self, tick: PriceTick) -> Result<(), EngineError> {
        let pair = tick.pair.clone();
        let tx = self.pipeline_sender(&pair);
        tx.send(PipelineMessage::Tick(tick))
            .await
            .map_err(|_| EngineError::PipelineClosed(pair))
    }

    /// Convenience form of [`ingest_tick`](Self::ingest_tick).
    pub async fn ingest(&self, pair: Pair, price: Price, observed_at: Timestamp, degraded: bool) -> Result<(), EngineError> {
        let mut tick = PriceTick::new(pair, price, observed_at);
        tick.degraded = degraded;
        self.ingest_tick(tick).await
    }

    /// Resolves once every tick queued so far has been processed and the
    /// resulting writes have been handled.
    pub async fn flush(&self) {
        let senders: Vec<mpsc::Sender<PipelineMessage>> =
            self.pipelines.lock().values().map(|p| p.tx.clone()).collect();
        for tx in senders {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(PipelineMessage::Flush(done_tx)).await.is_ok() {
                let _ = done_rx.await;
            }
        }
        self.dispatch.flush().await;
    }

    pub fn deposit(&self, user_id: UserId, amount: Quote) -> Quote {
        self.engine.deposit(user_id, amount, Timestamp::now())
    }

    pub fn open_position(&self, spec: &PositionSpec) -> Result<OpenedPosition, EngineError> {
        self.engine.open_position(spec, self.feed_time(&spec.pair))
    }

    pub fn attach_order(&self, position_id: PositionId, spec: &OrderSpec) -> Result<ConditionalOrder, EngineError> {
        self.engine.attach_order(position_id, spec, self.position_time(position_id))
    }

    pub fn cancel_order(&self, order_id: OrderId) -> Result<ConditionalOrder, EngineError> {
        let now = match self.engine.get_order(order_id) {
            Some(order) => self.feed_time(&order.pair),
            None => Timestamp::now(),
        };
        self.engine.cancel_order(order_id, now)
    }

    pub fn close_position(&self, position_id: PositionId) -> Result<Closure, EngineError> {
        self.engine.close_position(position_id, self.position_time(position_id))
    }

    /// Latest `observed_at` processed for `pair`.
    pub fn feed_time(&self, pair: &Pair) -> Timestamp {
        self.engine
            .market_prices(pair)
            .map(|prices| prices.observed_at)
            .unwrap_or_else(Timestamp::now)
    }

    fn position_time(&self, position_id: PositionId) -> Timestamp {
        match self.engine.get_position(position_id) {
            Some(position) => self.feed_time(&position.pair),
            None => Timestamp::now(),
        }
    }

    pub fn get_position(&self, position_id: PositionId) -> Option<Position> {
        self.engine.get_position(position_id)
    }

    pub fn list_orders(&self, position_id: PositionId) -> Result<Vec<ConditionalOrder>, EngineError> {
        self.engine.list_orders(position_id)
    }

    /// Drains every pipeline and dispatcher, then stops them.
    pub async fn shutdown(&self) {
        self.flush().await;

        let pipelines: Vec<(Pair, Pipeline)> = self.pipelines.lock().drain().collect();
        for (pair, pipeline) in pipelines {
            drop(pipeline.tx);
            if let Err(e) = pipeline.handle.await {
                warn!(pair = %pair, error = %e, "Pipeline task ended abnormally");
            }
        }

        self.dispatch.shutdown();
        let dispatchers = self.dispatchers.lock().take();
        if let Some(d) = dispatchers {
            if let Err(e) = d.persistence.await {
                warn!(error = %e, "Persistence dispatcher ended abnormally");
            }
            if let Err(e) = d.settlement.await {
                warn!(error = %e, "Settlement dispatcher ended abnormally");
            }
        }
        info!("Engine service stopped");
    }
}

#[async_trait]
impl TickSink for EngineService {
    async fn submit(&self, tick: PriceTick) {
        if let Err(e) = self.ingest_tick(tick).await {
            warn!(error = %e, "Dropping tick");
        }
    }
}
