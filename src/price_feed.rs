// Price Feed Adapter
//
// Turns whatever an upstream source produces (quotes, errors, stale data) into a
// per-pair stream of ticks with non-decreasing timestamps. When the source fails
// we keep the stream alive with the last known good price and flag the tick as
// degraded, so downstream can decide what not to act on.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::types::{Pair, Price, Timestamp};

/// A normalized tick, ready for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub pair: Pair,
    pub price: Price,
    pub observed_at: Timestamp,
    /// Last-known-good substitute or stale upstream data.
    pub degraded: bool,
}

impl PriceTick {
    pub fn new(pair: Pair, price: Price, observed_at: Timestamp) -> Self {
        Self {
            pair,
            price,
            observed_at,
            degraded: false,
        }
    }

    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }
}

/// Raw quote as an upstream source reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawQuote {
    pub price: Decimal,
    pub observed_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("No price available for {0}")]
    NoPriceAvailable(Pair),

    #[error("Invalid price {price} for {pair}")]
    InvalidPrice { pair: Pair, price: Decimal },

    #[error("Upstream source failed: {0}")]
    Upstream(String),

    #[error("Tick for {pair} at {observed_at} is older than {last_seen}")]
    OutOfOrder {
        pair: Pair,
        observed_at: Timestamp,
        last_seen: Timestamp,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// TWAP window for the mark price. 0 makes mark equal to the last price.
    pub mark_window_ms: i64,
    /// Upstream quotes older than this (relative to now) are passed on as degraded.
    pub max_staleness_ms: i64,
    pub poll_interval_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            mark_window_ms: 0,
            max_staleness_ms: 60_000,
            poll_interval_ms: 1_000,
        }
    }
}

/// Trait for upstream price sources. Implement this to plug in an exchange, an
/// oracle, or a replay file.
pub trait PriceSource: Send {
    fn name(&self) -> &str;

    fn fetch(&mut self, pair: &Pair) -> Result<RawQuote, FeedError>;
}

/// Source that replays a scripted sequence of results. Used by tests and the simulator.
pub struct ScriptedSource {
    name: String,
    script: VecDeque<Result<RawQuote, FeedError>>,
}

impl ScriptedSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: VecDeque::new(),
        }
    }

    pub fn push_quote(&mut self, price: Decimal, observed_at: Timestamp) {
        self.script.push_back(Ok(RawQuote { price, observed_at }));
    }

    pub fn push_failure(&mut self, message: &str) {
        self.script.push_back(Err(FeedError::Upstream(message.to_string())));
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl PriceSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&mut self, pair: &Pair) -> Result<RawQuote, FeedError> {
        self.script
            .pop_front()
            .unwrap_or_else(|| Err(FeedError::NoPriceAvailable(pair.clone())))
    }
}

#[derive(Debug, Clone, Copy)]
struct PairCursor {
    last_good: Price,
    last_emitted_at: Timestamp,
}

/// Per-pair normalization: ordering, validation, last-known-good substitution.
#[derive(Debug, Clone)]
pub struct FeedNormalizer {
    config: FeedConfig,
    cursors: HashMap<Pair, PairCursor>,
}

impl FeedNormalizer {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config,
            cursors: HashMap::new(),
        }
    }

    /// Normalize one upstream result. None means there is nothing to deliver:
    /// the quote went backwards, or the source failed before any good price.
    pub fn normalize(
        &mut self,
        pair: &Pair,
        upstream: Result<RawQuote, FeedError>,
        now: Timestamp,
    ) -> Option<PriceTick> {
        let cursor = self.cursors.get(pair).copied();

        let quote = upstream.and_then(|q| match Price::new(q.price) {
            Some(price) => Ok((price, q.observed_at)),
            None => Err(FeedError::InvalidPrice {
                pair: pair.clone(),
                price: q.price,
            }),
        });

        match (quote, cursor) {
            (Ok((_, observed_at)), Some(c)) if observed_at < c.last_emitted_at => {
                warn!(
                    pair = %pair,
                    observed_at = observed_at.as_millis(),
                    last_seen = c.last_emitted_at.as_millis(),
                    "Dropping out-of-order quote"
                );
                None
            }
            (Ok((price, observed_at)), _) => {
                let stale = now.as_millis() - observed_at.as_millis() > self.config.max_staleness_ms;
                self.cursors.insert(
                    pair.clone(),
                    PairCursor {
                        last_good: price,
                        last_emitted_at: observed_at,
                    },
                );
                let tick = PriceTick::new(pair.clone(), price, observed_at);
                if stale {
                    debug!(pair = %pair, "Upstream quote is stale, marking degraded");
                    Some(tick.degraded())
                } else {
                    Some(tick)
                }
            }
            (Err(e), Some(c)) => {
                warn!(pair = %pair, error = %e, last_good = %c.last_good, "Feed failed, substituting last good price");
                let observed_at = now.max(c.last_emitted_at);
                self.cursors.insert(
                    pair.clone(),
                    PairCursor {
                        last_good: c.last_good,
                        last_emitted_at: observed_at,
                    },
                );
                Some(PriceTick::new(pair.clone(), c.last_good, observed_at).degraded())
            }
            (Err(e), None) => {
                warn!(pair = %pair, error = %e, "Feed failed with no last good price");
                None
            }
        }
    }

    pub fn last_good(&self, pair: &Pair) -> Option<Price> {
        self.cursors.get(pair).map(|c| c.last_good)
    }
}

/// Where normalized ticks go. The engine service implements this.
#[async_trait]
pub trait TickSink: Send + Sync {
    async fn submit(&self, tick: PriceTick);
}

/// Polls `source` for `pair` every `poll_interval_ms` until `shutdown` flips to true.
pub fn spawn_poller<S, K>(
    mut source: S,
    pair: Pair,
    config: FeedConfig,
    sink: Arc<K>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()>
where
    S: PriceSource + 'static,
    K: TickSink + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut normalizer = FeedNormalizer::new(config.clone());
        let mut interval = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let upstream = source.fetch(&pair);
                    if let Some(tick) = normalizer.normalize(&pair, upstream, Timestamp::now()) {
                        sink.submit(tick).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(pair = %pair, source = source.name(), "Price poller stopping");
                        break;
                    }
                }
            }
        }
    })
}

/// TWAP (time weighted average price) over a sliding window. Drives the mark price.
#[derive(Debug, Clone)]
pub struct TwapCalculator {
    samples: VecDeque<(Timestamp, Price)>,
    window_ms: i64,
    max_samples: usize,
}

impl TwapCalculator {
    pub fn new(window_ms: i64) -> Self {
        Self {
            samples: VecDeque::new(),
            window_ms,
            max_samples: 1000,
        }
    }

    pub fn add_sample(&mut self, timestamp: Timestamp, price: Price) {
        self.samples.push_back((timestamp, price));

        // remove old samples outside the window
        while let Some((ts, _)) = self.samples.front() {
            if ts.elapsed_millis(&timestamp) > self.window_ms {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Each sample weighs by how long it stood; the newest sample weighs one
    /// millisecond so a fresh jump is never ignored entirely.
    pub fn get_twap(&self) -> Option<Price> {
        let (_, newest) = *self.samples.back()?;
        if self.samples.len() == 1 {
            return Some(newest);
        }

        let mut weighted_sum = Decimal::ZERO;
        let mut total_time = Decimal::ZERO;

        for i in 1..self.samples.len() {
            let (prev_ts, prev_price) = self.samples[i - 1];
            let (curr_ts, _) = self.samples[i];
            let duration = Decimal::from(curr_ts.as_millis() - prev_ts.as_millis());

            // prices too large to average fall back to the newest one
            let Some(sum) = prev_price
                .value()
                .checked_mul(duration)
                .and_then(|weighted| weighted_sum.checked_add(weighted))
            else {
                return Some(newest);
            };
            weighted_sum = sum;
            total_time += duration;
        }

        let Some(sum) = weighted_sum.checked_add(newest.value()) else {
            return Some(newest);
        };
        total_time += Decimal::ONE;

        Price::new(sum / total_time).or(Some(newest))
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// In-memory sink that just collects ticks, for tests and dry runs.
#[derive(Debug, Default)]
pub struct CollectingSink {
    ticks: Mutex<Vec<PriceTick>>,
}

impl CollectingSink {
    pub fn ticks(&self) -> Vec<PriceTick> {
        self.ticks.lock().clone()
    }
}

#[async_trait]
impl TickSink for CollectingSink {
    async fn submit(&self, tick: PriceTick) {
        self.ticks.lock().push(tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(price: Decimal, ts: i64) -> Result<RawQuote, FeedError> {
        Ok(RawQuote {
            price,
            observed_at: Timestamp::from_millis(ts),
        })
    }

    #[test]
    fn fresh_quote_passes_through() {
        let mut n = FeedNormalizer::new(FeedConfig::default());
        let tick = n.normalize(&Pair::wld_numa(), quote(dec!(2.5), 1_000), Timestamp::from_millis(1_000)).unwrap();
        assert_eq!(tick.price.value(), dec!(2.5));
        assert!(!tick.degraded);
    }

    #[test]
    fn out_of_order_quote_is_dropped() {
        let pair = Pair::wld_numa();
        let mut n = FeedNormalizer::new(FeedConfig::default());
        n.normalize(&pair, quote(dec!(2.5), 2_000), Timestamp::from_millis(2_000)).unwrap();

        assert!(n.normalize(&pair, quote(dec!(2.6), 1_500), Timestamp::from_millis(2_100)).is_none());
        // equal timestamps are fine
        assert!(n.normalize(&pair, quote(dec!(2.6), 2_000), Timestamp::from_millis(2_100)).is_some());
    }

    #[test]
    fn failure_substitutes_last_good_as_degraded() {
        let pair = Pair::wld_numa();
        let mut n = FeedNormalizer::new(FeedConfig::default());
        n.normalize(&pair, quote(dec!(2.5), 1_000), Timestamp::from_millis(1_000)).unwrap();

        let tick = n
            .normalize(&pair, Err(FeedError::Upstream("timeout".into())), Timestamp::from_millis(3_000))
            .unwrap();
        assert!(tick.degraded);
        assert_eq!(tick.price.value(), dec!(2.5));
        assert_eq!(tick.observed_at, Timestamp::from_millis(3_000));
    }

    #[test]
    fn failure_without_history_yields_nothing() {
        let mut n = FeedNormalizer::new(FeedConfig::default());
        let out = n.normalize(&Pair::wld_numa(), Err(FeedError::Upstream("down".into())), Timestamp::from_millis(0));
        assert!(out.is_none());
    }

    #[test]
    fn invalid_price_counts_as_failure() {
        let pair = Pair::wld_numa();
        let mut n = FeedNormalizer::new(FeedConfig::default());
        n.normalize(&pair, quote(dec!(2.5), 1_000), Timestamp::from_millis(1_000)).unwrap();

        let tick = n.normalize(&pair, quote(dec!(0), 1_100), Timestamp::from_millis(1_100)).unwrap();
        assert!(tick.degraded);
        assert_eq!(tick.price.value(), dec!(2.5));
    }

    #[test]
    fn stale_quote_is_degraded() {
        let mut n = FeedNormalizer::new(FeedConfig {
            max_staleness_ms: 500,
            ..FeedConfig::default()
        });
        let tick = n.normalize(&Pair::wld_numa(), quote(dec!(2.5), 1_000), Timestamp::from_millis(2_000)).unwrap();
        assert!(tick.degraded);
    }

    #[test]
    fn scripted_source_runs_dry() {
        let pair = Pair::wld_numa();
        let mut source = ScriptedSource::new("script");
        source.push_quote(dec!(2.5), Timestamp::from_millis(0));
        source.push_failure("boom");

        assert!(source.fetch(&pair).is_ok());
        assert!(matches!(source.fetch(&pair), Err(FeedError::Upstream(_))));
        assert!(matches!(source.fetch(&pair), Err(FeedError::NoPriceAvailable(_))));
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn twap_zero_window_tracks_last() {
        let mut twap = TwapCalculator::new(0);
        twap.add_sample(Timestamp::from_millis(0), Price::new_unchecked(dec!(2.50)));
        twap.add_sample(Timestamp::from_millis(1_000), Price::new_unchecked(dec!(2.60)));
        assert_eq!(twap.sample_count(), 1);
        assert_eq!(twap.get_twap().unwrap().value(), dec!(2.60));
    }

    #[test]
    fn twap_weights_by_duration() {
        let mut twap = TwapCalculator::new(10_000);
        twap.add_sample(Timestamp::from_millis(0), Price::new_unchecked(dec!(2)));
        twap.add_sample(Timestamp::from_millis(999), Price::new_unchecked(dec!(4)));
        // (2 * 999 + 4 * 1) / 1000
        assert_eq!(twap.get_twap().unwrap().value(), dec!(2.002));
    }

    #[test]
    fn twap_out_of_range_falls_back_to_newest() {
        let mut twap = TwapCalculator::new(60_000);
        twap.add_sample(Timestamp::from_millis(0), Price::new_unchecked(Decimal::MAX));
        twap.add_sample(Timestamp::from_millis(30_000), Price::new_unchecked(dec!(2.5)));
        assert_eq!(twap.get_twap().unwrap().value(), dec!(2.5));
    }

    #[tokio::test]
    async fn poller_delivers_normalized_ticks() {
        let pair = Pair::wld_numa();
        let mut source = ScriptedSource::new("script");
        let now = Timestamp::now();
        source.push_quote(dec!(2.5), now);
        source.push_failure("boom");

        let sink = Arc::new(CollectingSink::default());
        let (tx, rx) = watch::channel(false);
        let config = FeedConfig {
            poll_interval_ms: 5,
            ..FeedConfig::default()
        };
        let handle = spawn_poller(source, pair, config, sink.clone(), rx);

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let ticks = sink.ticks();
        assert!(ticks.len() >= 2);
        assert!(!ticks[0].degraded);
        assert!(ticks[1..].iter().all(|t| t.degraded && t.price.value() == dec!(2.5)));
        assert!(ticks.windows(2).all(|w| w[0].observed_at <= w[1].observed_at));
    }
}
