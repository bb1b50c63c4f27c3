//! Position ledger simulation.
//!
//! Drives the engine service through the reference scenarios: PnL on a price
//! move, a trailing stop firing, a liquidation, and a cancel racing a trigger.
//! Pass a TOML config path as the first argument to override the defaults.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use perps_ledger::*;
use rust_decimal_macros::dec;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(&path).with_context(|| format!("loading config from {path}"))?,
        None => EngineConfig::development(),
    };
    config.logging.init();

    info!("Position ledger simulation: WLD/NUMA, isolated margin");

    scenario_a_unrealized_pnl(&config).await?;
    scenario_b_trailing_stop(&config).await?;
    scenario_c_liquidation(&config).await?;
    scenario_d_cancel_races_trigger(&config).await?;

    info!("All scenarios completed");
    Ok(())
}

struct Sim {
    service: EngineService,
    repository: Arc<InMemoryRepository>,
    settlement: Arc<InMemorySettlement>,
    clock: Timestamp,
}

impl Sim {
    fn start(config: &EngineConfig) -> Result<Self> {
        let repository = Arc::new(InMemoryRepository::new());
        let settlement = Arc::new(InMemorySettlement::new());
        let service = EngineService::start(config.clone(), repository.clone(), settlement.clone())?;
        Ok(Self {
            service,
            repository,
            settlement,
            clock: Timestamp::now(),
        })
    }

    async fn tick(&mut self, price: rust_decimal::Decimal) -> Result<()> {
        self.clock = self.clock.plus_millis(1_000);
        let price = Price::new(price).context("tick price must be positive")?;
        self.service.ingest(Pair::wld_numa(), price, self.clock, false).await?;
        self.service.flush().await;
        Ok(())
    }

    /// Funds the user and opens 100 WLD long at 10x with 25 NUMA margin at 2.50.
    async fn open_reference_long(&mut self, user: UserId, brackets: Vec<OrderSpec>) -> Result<OpenedPosition> {
        self.service.deposit(user, Quote::new(dec!(100)));
        self.tick(dec!(2.50)).await?;

        let mut spec = PositionSpec::new(user, Pair::wld_numa(), Side::Long, dec!(100), dec!(10), dec!(25));
        for bracket in brackets {
            spec = spec.with_bracket(bracket);
        }
        let opened = self.service.open_position(&spec)?;
        // brackets go live once the open is persisted
        self.service.flush().await;
        Ok(opened)
    }

    async fn finish(self) {
        self.service.shutdown().await;
        info!(
            writes = self.repository.write_count(),
            settlements = self.settlement.accepted().len(),
            "Scenario finished"
        );
    }
}

/// A: long 100 @ 2.50, price moves to 2.60, unrealized PnL is 10.
async fn scenario_a_unrealized_pnl(config: &EngineConfig) -> Result<()> {
    info!("Scenario A: unrealized PnL");
    let mut sim = Sim::start(config)?;

    let opened = sim.open_reference_long(UserId(1), Vec::new()).await?;
    sim.tick(dec!(2.60)).await?;

    let position = sim.service.get_position(opened.position.id).context("position missing")?;
    info!(
        entry = %position.entry_price,
        price = %position.current_price,
        unrealized_pnl = %position.unrealized_pnl,
        margin_ratio = %position.margin_ratio(),
        "Price moved"
    );
    if position.unrealized_pnl != Quote::new(dec!(10)) {
        bail!("expected unrealized PnL of 10, got {}", position.unrealized_pnl);
    }

    let closure = sim.service.close_position(position.id)?;
    info!(payout = %closure.payout, "Closed by user");
    sim.finish().await;
    Ok(())
}

/// B: 5% trailing stop, high of 2.60 puts the trigger at 2.47, 2.46 fires it.
async fn scenario_b_trailing_stop(config: &EngineConfig) -> Result<()> {
    info!("Scenario B: trailing stop");
    let mut sim = Sim::start(config)?;

    let opened = sim
        .open_reference_long(UserId(2), vec![OrderSpec::trailing_stop(dec!(5))])
        .await?;
    let order_id = opened.orders.first().map(|o| o.id).context("bracket missing")?;

    sim.tick(dec!(2.60)).await?;
    let order = sim.service.engine().get_order(order_id).context("order missing")?;
    info!(
        highest = ?order.highest_price.map(|p| p.value()),
        trigger = ?order.current_trigger_price.map(|p| p.value()),
        "Trailing stop ratcheted"
    );

    sim.tick(dec!(2.46)).await?;
    let order = sim.service.engine().get_order(order_id).context("order missing")?;
    let position = sim.service.get_position(opened.position.id).context("position missing")?;
    info!(
        order_status = ?order.status,
        position_status = ?position.status,
        realized_pnl = %position.realized_pnl,
        "Price dropped through the trigger"
    );
    if order.status != OrderStatus::Triggered {
        bail!("trailing stop did not fire: {:?}", order.status);
    }
    sim.finish().await;
    Ok(())
}

/// C: price falls to 2.27, margin ratio 2/25 = 0.08 is under the 0.10 floor.
async fn scenario_c_liquidation(config: &EngineConfig) -> Result<()> {
    info!("Scenario C: liquidation");
    let mut sim = Sim::start(config)?;

    sim.service.engine().ledger().fund_insurance(Quote::new(dec!(1_000)));
    let opened = sim.open_reference_long(UserId(3), Vec::new()).await?;
    let liquidation_price = sim.service.engine().liquidation_price(opened.position.id)?;
    info!(liquidation_price = ?liquidation_price.map(|p| p.value()), "Opened");

    sim.tick(dec!(2.27)).await?;
    let position = sim.service.get_position(opened.position.id).context("position missing")?;
    info!(
        status = ?position.status,
        insurance = %sim.service.engine().ledger().insurance_fund().balance,
        "Price crashed"
    );
    if position.status != PositionStatus::Liquidated {
        bail!("position should have been liquidated, is {:?}", position.status);
    }
    sim.finish().await;
    Ok(())
}

/// D: the user cancels a stop loss while a tick crosses it. Exactly one wins.
async fn scenario_d_cancel_races_trigger(config: &EngineConfig) -> Result<()> {
    info!("Scenario D: cancel races trigger");
    let mut sim = Sim::start(config)?;

    let opened = sim
        .open_reference_long(UserId(4), vec![OrderSpec::stop_loss(dec!(2.40))])
        .await?;
    let order_id = opened.orders.first().map(|o| o.id).context("bracket missing")?;

    sim.clock = sim.clock.plus_millis(1_000);
    let crossing = PriceTick::new(Pair::wld_numa(), Price::new_unchecked(dec!(2.39)), sim.clock);
    let (ingested, cancelled) = tokio::join!(sim.service.ingest_tick(crossing), async {
        sim.service.cancel_order(order_id)
    });
    ingested?;
    sim.service.flush().await;

    let order = sim.service.engine().get_order(order_id).context("order missing")?;
    info!(
        cancel_accepted = cancelled.is_ok(),
        final_status = ?order.status,
        "Race resolved"
    );
    match (order.status, cancelled.is_ok()) {
        (OrderStatus::Cancelled, true) | (OrderStatus::Triggered, false) => {}
        (status, accepted) => bail!("inconsistent outcome: status {status:?}, cancel accepted {accepted}"),
    }
    sim.finish().await;
    Ok(())
}
