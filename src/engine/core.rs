// 8.0 engine/core.rs: main engine. holds the ledger, the sink, and per-pair price state.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::results::EngineError;
use crate::conditional::TriggerPrices;
use crate::config::EngineConfig;
use crate::events::Event;
use crate::execution::{ExecutionSink, Outbox};
use crate::ledger::Ledger;
use crate::price_feed::TwapCalculator;
use crate::types::{Pair, Price, Timestamp};

/** 8.1: last and mark for one pair. mark is the TWAP of last over the configured window */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketPrices {
    pub last: Price,
    pub mark: Price,
    pub observed_at: Timestamp,
}

impl MarketPrices {
    pub fn trigger_prices(&self) -> TriggerPrices {
        TriggerPrices {
            mark: self.mark,
            last: self.last,
        }
    }
}

#[derive(Debug)]
pub(super) struct MarketState {
    pub(super) prices: Option<MarketPrices>,
    pub(super) twap: TwapCalculator,
}

impl MarketState {
    fn new(window_ms: i64) -> Self {
        Self {
            prices: None,
            twap: TwapCalculator::new(window_ms),
        }
    }
}

pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) ledger: Arc<Ledger>,
    pub(super) sink: ExecutionSink,
    pub(super) markets: RwLock<HashMap<Pair, Arc<Mutex<MarketState>>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, ledger: Arc<Ledger>, outbox: Arc<dyn Outbox>) -> Self {
        let sink = ExecutionSink::new(ledger.clone(), outbox, config.liquidation.clone());
        Self {
            config,
            ledger,
            sink,
            markets: RwLock::new(HashMap::new()),
        }
    }

    /// Engine with a fresh ledger sized from `config`.
    pub fn standalone(config: EngineConfig, outbox: Arc<dyn Outbox>) -> Self {
        let ledger = Arc::new(Ledger::new(config.ledger.clone(), config.events.max_retained));
        Self::new(config, ledger, outbox)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub(super) fn market(&self, pair: &Pair) -> Arc<Mutex<MarketState>> {
        if let Some(state) = self.markets.read().get(pair) {
            return state.clone();
        }
        self.markets
            .write()
            .entry(pair.clone())
            .or_insert_with(|| Arc::new(Mutex::new(MarketState::new(self.config.feed.mark_window_ms))))
            .clone()
    }

    pub fn market_prices(&self, pair: &Pair) -> Option<MarketPrices> {
        let state = self.markets.read().get(pair).cloned()?;
        let prices = state.lock().prices;
        prices
    }

    pub(super) fn require_prices(&self, pair: &Pair) -> Result<MarketPrices, EngineError> {
        self.market_prices(pair).ok_or_else(|| EngineError::NoPrice(pair.clone()))
    }

    pub fn events(&self) -> Vec<Event> {
        self.ledger.events()
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        self.ledger.recent_events(count)
    }
}
