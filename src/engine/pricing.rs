//! Tick processing.
//!
//! One tick updates the pair's last and mark prices, then walks every open
//! position of the pair. Each position is evaluated under its own lock, in a
//! fixed order: funding, price, liquidation, conditional orders. Liquidation is
//! decided before any order on the same tick, so a position gets at most one
//! terminal outcome per tick. A position whose figures leave `Decimal`'s range
//! is skipped for the tick; the rest of the pair carries on.

use tracing::{debug, warn};

use super::core::{Engine, MarketPrices};
use super::results::TickReport;
use crate::events::EventPayload;
use crate::ledger::PositionSlot;
use crate::price_feed::PriceTick;

impl Engine {
    pub fn process_tick(&self, tick: &PriceTick) -> TickReport {
        let mut report = TickReport {
            pair: Some(tick.pair.clone()),
            observed_at: Some(tick.observed_at),
            degraded: tick.degraded,
            ..TickReport::default()
        };

        // held for the whole tick: one pair, one tick at a time
        let market = self.market(&tick.pair);
        let mut market = market.lock();

        if let Some(previous) = market.prices {
            if tick.observed_at < previous.observed_at {
                warn!(
                    pair = %tick.pair,
                    observed_at = tick.observed_at.as_millis(),
                    last_seen = previous.observed_at.as_millis(),
                    "Rejecting out-of-order tick"
                );
                self.ledger.emit(
                    tick.observed_at,
                    EventPayload::TickRejected {
                        pair: tick.pair.clone(),
                        observed_at: tick.observed_at,
                        last_seen: previous.observed_at,
                    },
                );
                report.rejected = true;
                return report;
            }
        }

        market.twap.add_sample(tick.observed_at, tick.price);
        let prices = MarketPrices {
            last: tick.price,
            mark: market.twap.get_twap().unwrap_or(tick.price),
            observed_at: tick.observed_at,
        };
        market.prices = Some(prices);
        report.mark = Some(prices.mark);
        report.last = Some(prices.last);

        if tick.degraded {
            self.ledger.emit(
                tick.observed_at,
                EventPayload::EvaluationSkipped {
                    pair: tick.pair.clone(),
                    observed_at: tick.observed_at,
                    reason: format!(
                        "degraded tick (skip_liquidation={}, skip_triggers={})",
                        self.config.degraded.skip_liquidation, self.config.degraded.skip_triggers
                    ),
                },
            );
        }

        for position_id in self.ledger.open_positions_for_pair(&tick.pair) {
            let Some(slot) = self.ledger.slot(position_id) else {
                continue;
            };
            let mut slot = slot.lock();
            self.evaluate_position(&mut slot, &prices, tick, &mut report);
        }

        debug!(
            pair = %tick.pair,
            mark = %prices.mark,
            last = %prices.last,
            evaluated = report.positions_evaluated,
            liquidated = report.liquidated.len(),
            triggered = report.triggered.len(),
            "Tick processed"
        );
        report
    }

    fn evaluate_position(&self, slot: &mut PositionSlot, prices: &MarketPrices, tick: &PriceTick, report: &mut TickReport) {
        if !slot.position.is_open() {
            return;
        }
        report.positions_evaluated += 1;
        let now = tick.observed_at;

        // funding depends only on entry terms and time, so it runs on degraded ticks too
        match self.accrue_funding(slot, now) {
            Ok(true) => report.funding_charges += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(position_id = %slot.position.id, error = %e, "Funding out of range, skipping position");
                report.positions_skipped.push(slot.position.id);
                return;
            }
        }

        if let Err(e) = slot.position.apply_price(prices.mark) {
            warn!(
                position_id = %slot.position.id,
                mark = %prices.mark,
                error = %e,
                "Price out of range for position, skipping"
            );
            report.positions_skipped.push(slot.position.id);
            return;
        }

        if tick.degraded && self.config.degraded.skip_liquidation {
            report.liquidations_skipped += 1;
        } else if self.check_liquidation(slot, prices.mark, now, report) {
            return;
        }

        if tick.degraded && self.config.degraded.skip_triggers {
            report.triggers_skipped += 1;
            return;
        }

        self.evaluate_orders(slot, &prices.trigger_prices(), now, report);
    }
}
