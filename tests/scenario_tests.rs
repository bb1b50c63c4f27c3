//! End-to-end engine scenarios.
//!
//! Drives a standalone engine tick by tick with explicit timestamps. The
//! recording outbox stands in for persistence, so positions are confirmed by
//! hand where brackets need to be live.

use std::sync::Arc;

use perps_ledger::execution::RecordingOutbox;
use perps_ledger::settlement::ReasonCode;
use perps_ledger::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const HOUR: i64 = 60 * 60 * 1000;

fn engine_with(config: EngineConfig) -> (Engine, Arc<RecordingOutbox>) {
    let outbox = Arc::new(RecordingOutbox::default());
    let engine = Engine::standalone(config, outbox.clone());
    (engine, outbox)
}

fn engine() -> (Engine, Arc<RecordingOutbox>) {
    engine_with(EngineConfig::default())
}

fn tick(engine: &Engine, price: Decimal, at: i64) -> TickReport {
    engine.process_tick(&PriceTick::new(
        Pair::wld_numa(),
        Price::new_unchecked(price),
        Timestamp::from_millis(at),
    ))
}

fn degraded_tick(engine: &Engine, price: Decimal, at: i64) -> TickReport {
    engine.process_tick(&PriceTick::new(Pair::wld_numa(), Price::new_unchecked(price), Timestamp::from_millis(at)).degraded())
}

/// Long 100 WLD at 2.50, 10x, 25 NUMA margin, confirmed.
fn open_long(engine: &Engine, brackets: Vec<OrderSpec>) -> OpenedPosition {
    let t0 = Timestamp::from_millis(0);
    engine.deposit(UserId(1), Quote::new(dec!(100)), t0);
    tick(engine, dec!(2.50), 0);

    let mut spec = PositionSpec::new(UserId(1), Pair::wld_numa(), Side::Long, dec!(100), dec!(10), dec!(25));
    for bracket in brackets {
        spec = spec.with_bracket(bracket);
    }
    let opened = engine.open_position(&spec, t0).unwrap();
    engine.ledger().confirm_open(opened.position.id, t0).unwrap();
    opened
}

mod reference_scenarios {
    use super::*;

    #[test]
    fn price_rise_gives_unrealized_pnl_of_ten() {
        let (engine, _) = engine();
        let opened = open_long(&engine, Vec::new());

        let report = tick(&engine, dec!(2.60), 1_000);
        assert_eq!(report.positions_evaluated, 1);

        let position = engine.get_position(opened.position.id).unwrap();
        assert_eq!(position.unrealized_pnl, Quote::new(dec!(10)));
        assert_eq!(position.margin_ratio(), dec!(1.4));
        assert!(position.is_open());
        assert_eq!(engine.open_positions(&Pair::wld_numa()).len(), 1);
    }

    #[test]
    fn trailing_stop_fires_below_ratcheted_trigger() {
        let (engine, outbox) = engine();
        let opened = open_long(&engine, vec![OrderSpec::trailing_stop(dec!(5))]);
        let order_id = opened.orders[0].id;

        tick(&engine, dec!(2.60), 1_000);
        let order = engine.get_order(order_id).unwrap();
        assert_eq!(order.highest_price, Some(Price::new_unchecked(dec!(2.60))));
        assert_eq!(order.current_trigger_price, Some(Price::new_unchecked(dec!(2.47))));

        let report = tick(&engine, dec!(2.48), 2_000);
        assert!(report.triggered.is_empty());

        let report = tick(&engine, dec!(2.46), 3_000);
        assert_eq!(report.triggered, vec![order_id]);
        assert_eq!(report.closed, vec![opened.position.id]);

        let order = engine.get_order(order_id).unwrap();
        assert_eq!(order.status, OrderStatus::Triggered);
        assert_eq!(order.fill_price, Some(Price::new_unchecked(dec!(2.46))));

        let position = engine.get_position(opened.position.id).unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.close_reason, Some(CloseReason::TrailingStop));
        assert_eq!(position.realized_pnl, Quote::new(dec!(-4)));

        let settled = outbox.settled();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].exit_price, 2_460_000);
        assert_eq!(settled[0].reason_code, ReasonCode::TrailingStop);
        assert_eq!(settled[0].order_id, Some(order_id));
    }

    #[test]
    fn margin_ratio_of_eight_percent_liquidates() {
        let (engine, outbox) = engine();
        let opened = open_long(&engine, Vec::new());

        let report = tick(&engine, dec!(2.27), 1_000);
        assert_eq!(report.liquidated, vec![opened.position.id]);

        let position = engine.get_position(opened.position.id).unwrap();
        assert_eq!(position.status, PositionStatus::Liquidated);
        assert_eq!(position.close_reason, Some(CloseReason::Liquidation));

        let settled = outbox.settled();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].reason_code, ReasonCode::Liquidation);

        // the 2 NUMA left over goes to the insurance fund
        assert_eq!(engine.ledger().insurance_fund().balance, Quote::new(dec!(2)));
        assert!(engine.open_positions(&Pair::wld_numa()).is_empty());
    }
}

mod liquidation {
    use super::*;

    #[test]
    fn ratio_just_above_floor_survives() {
        let (engine, _) = engine();
        let opened = open_long(&engine, Vec::new());

        // ratio 3/25 = 0.12
        let report = tick(&engine, dec!(2.28), 1_000);
        assert!(report.liquidated.is_empty());
        assert!(engine.get_position(opened.position.id).unwrap().is_open());
    }

    #[test]
    fn ratio_exactly_at_floor_liquidates() {
        let (engine, _) = engine();
        let opened = open_long(&engine, Vec::new());

        // ratio 2.5/25 = 0.10
        let report = tick(&engine, dec!(2.275), 1_000);
        assert_eq!(report.liquidated, vec![opened.position.id]);
    }

    #[test]
    fn liquidation_wins_over_stop_on_same_tick() {
        let (engine, _) = engine();
        let opened = open_long(&engine, vec![OrderSpec::stop_loss(dec!(2.30))]);
        let order_id = opened.orders[0].id;

        let report = tick(&engine, dec!(2.27), 1_000);
        assert_eq!(report.liquidated, vec![opened.position.id]);
        assert!(report.triggered.is_empty());

        let order = engine.get_order(order_id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.cancel_reason, Some(CancelReason::PositionLiquidated));
    }

    #[test]
    fn liquidated_position_ignores_later_ticks() {
        let (engine, outbox) = engine();
        let opened = open_long(&engine, Vec::new());

        tick(&engine, dec!(2.27), 1_000);
        let report = tick(&engine, dec!(2.00), 2_000);
        assert_eq!(report.positions_evaluated, 0);
        assert_eq!(outbox.settled().len(), 1);

        let again = engine.liquidate_position(opened.position.id, Timestamp::from_millis(3_000)).unwrap();
        assert!(matches!(again, Applied::Unchanged));
    }

    #[test]
    fn gap_through_zero_draws_on_insurance() {
        let (engine, _) = engine();
        engine.ledger().fund_insurance(Quote::new(dec!(10)));
        let opened = open_long(&engine, Vec::new());

        // equity 25 - 50 = -25, the fund covers 10 of it
        tick(&engine, dec!(2.00), 1_000);
        assert_eq!(engine.get_position(opened.position.id).unwrap().status, PositionStatus::Liquidated);

        let fund = engine.ledger().insurance_fund();
        assert_eq!(fund.balance, Quote::zero());
        assert_eq!(fund.total_payouts, Quote::new(dec!(10)));
        assert_eq!(fund.uncovered_bad_debt, Quote::new(dec!(15)));

        let account = engine.account(UserId(1)).unwrap();
        assert_eq!(account.balance, Quote::new(dec!(75)));
        assert_eq!(account.reserved, Quote::zero());
    }

    #[test]
    fn liquidation_price_matches_floor() {
        let (engine, _) = engine();
        let opened = open_long(&engine, Vec::new());

        let price = engine.liquidation_price(opened.position.id).unwrap().unwrap();
        assert_eq!(price.value(), dec!(2.275));
    }
}

mod funding {
    use super::*;

    #[test]
    fn duplicate_ticks_charge_an_interval_once() {
        let (engine, _) = engine();
        let opened = open_long(&engine, Vec::new());

        let first = tick(&engine, dec!(2.50), 8 * HOUR);
        let second = tick(&engine, dec!(2.50), 8 * HOUR);
        assert_eq!(first.funding_charges, 1);
        assert_eq!(second.funding_charges, 0);
        assert!(first.had_effect());
        assert!(!second.had_effect());

        // 100 * 2.50 * 1bp
        let position = engine.get_position(opened.position.id).unwrap();
        assert_eq!(position.accumulated_funding, Quote::new(dec!(0.025)));
    }

    #[test]
    fn late_tick_catches_up_every_whole_interval() {
        let (engine, _) = engine();
        let opened = open_long(&engine, Vec::new());

        tick(&engine, dec!(2.50), 3 * 8 * HOUR + 5);

        let position = engine.get_position(opened.position.id).unwrap();
        assert_eq!(position.accumulated_funding, Quote::new(dec!(0.075)));
        assert_eq!(position.funding_checkpoint, Timestamp::from_millis(3 * 8 * HOUR));
    }

    #[test]
    fn funding_reduces_user_close_payout() {
        let (engine, _) = engine();
        let opened = open_long(&engine, Vec::new());

        tick(&engine, dec!(2.50), 8 * HOUR);
        let closure = engine
            .close_position(opened.position.id, Timestamp::from_millis(8 * HOUR + 1))
            .unwrap();
        assert_eq!(closure.payout, Quote::new(dec!(24.975)));
    }
}

mod orders {
    use super::*;

    #[test]
    fn full_take_profit_cancels_sibling_stop() {
        let (engine, _) = engine();
        let opened = open_long(
            &engine,
            vec![OrderSpec::take_profit(dec!(2.70)), OrderSpec::stop_loss(dec!(2.30))],
        );
        let (tp, sl) = (opened.orders[0].id, opened.orders[1].id);

        let report = tick(&engine, dec!(2.70), 1_000);
        assert_eq!(report.triggered, vec![tp]);

        let stop = engine.get_order(sl).unwrap();
        assert_eq!(stop.status, OrderStatus::Cancelled);
        assert_eq!(stop.cancel_reason, Some(CancelReason::PositionClosed));

        // 100 - 25 reserved + 25 margin back + 20 profit
        let account = engine.account(UserId(1)).unwrap();
        assert_eq!(account.balance, Quote::new(dec!(120)));
        assert_eq!(account.reserved, Quote::zero());
    }

    #[test]
    fn partial_take_profit_reduces_and_keeps_position_open() {
        let (engine, _) = engine();
        let opened = open_long(&engine, vec![OrderSpec::take_profit(dec!(2.60)).with_percentage(dec!(50))]);

        let report = tick(&engine, dec!(2.60), 1_000);
        assert_eq!(report.reduced, vec![opened.position.id]);

        let position = engine.get_position(opened.position.id).unwrap();
        assert!(position.is_open());
        assert_eq!(position.size, dec!(50));
        assert_eq!(position.margin, Quote::new(dec!(12.5)));
        assert_eq!(position.realized_pnl, Quote::new(dec!(5)));

        // fired once, stays triggered
        let report = tick(&engine, dec!(2.65), 2_000);
        assert!(report.triggered.is_empty());
    }

    #[test]
    fn pending_brackets_wait_for_confirmation() {
        let (engine, _) = engine();
        let t0 = Timestamp::from_millis(0);
        engine.deposit(UserId(1), Quote::new(dec!(100)), t0);
        tick(&engine, dec!(2.50), 0);

        let spec = PositionSpec::new(UserId(1), Pair::wld_numa(), Side::Long, dec!(100), dec!(10), dec!(25))
            .with_bracket(OrderSpec::stop_loss(dec!(2.40)));
        let opened = engine.open_position(&spec, t0).unwrap();
        let order_id = opened.orders[0].id;
        assert_eq!(opened.orders[0].status, OrderStatus::Pending);

        let report = tick(&engine, dec!(2.39), 1_000);
        assert!(report.triggered.is_empty());
        assert_eq!(engine.get_order(order_id).unwrap().status, OrderStatus::Pending);

        let activated = engine
            .ledger()
            .confirm_open(opened.position.id, Timestamp::from_millis(1_500))
            .unwrap();
        assert_eq!(activated.len(), 1);

        let report = tick(&engine, dec!(2.38), 2_000);
        assert_eq!(report.triggered, vec![order_id]);
    }

    #[test]
    fn cancelled_order_never_fires() {
        let (engine, _) = engine();
        let opened = open_long(&engine, vec![OrderSpec::stop_loss(dec!(2.40))]);
        let order_id = opened.orders[0].id;

        engine.cancel_order(order_id, Timestamp::from_millis(500)).unwrap();
        let report = tick(&engine, dec!(2.35), 1_000);
        assert!(report.triggered.is_empty());
        assert!(engine.get_position(opened.position.id).unwrap().is_open());

        let err = engine.cancel_order(order_id, Timestamp::from_millis(1_500)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn user_close_cancels_open_orders() {
        let (engine, _) = engine();
        let opened = open_long(&engine, vec![OrderSpec::trailing_stop(dec!(5))]);

        tick(&engine, dec!(2.60), 1_000);
        let closure = engine
            .close_position(opened.position.id, Timestamp::from_millis(1_500))
            .unwrap();
        assert_eq!(closure.payout, Quote::new(dec!(35)));
        assert_eq!(closure.cancelled_orders.len(), 1);

        let err = engine
            .close_position(opened.position.id, Timestamp::from_millis(2_000))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn attach_on_closed_position_conflicts() {
        let (engine, _) = engine();
        let opened = open_long(&engine, Vec::new());
        engine
            .close_position(opened.position.id, Timestamp::from_millis(1_000))
            .unwrap();

        let err = engine
            .attach_order(opened.position.id, &OrderSpec::stop_loss(dec!(2.0)), Timestamp::from_millis(2_000))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }
}

mod feed_quality {
    use super::*;

    #[test]
    fn degraded_tick_defers_liquidation() {
        let (engine, _) = engine();
        let opened = open_long(&engine, Vec::new());

        let report = degraded_tick(&engine, dec!(2.27), 1_000);
        assert!(report.liquidated.is_empty());
        assert_eq!(report.liquidations_skipped, 1);
        assert!(engine.get_position(opened.position.id).unwrap().is_open());

        let report = tick(&engine, dec!(2.27), 2_000);
        assert_eq!(report.liquidated, vec![opened.position.id]);
    }

    #[test]
    fn degraded_tick_still_fires_triggers_by_default() {
        let (engine, _) = engine();
        let opened = open_long(&engine, vec![OrderSpec::stop_loss(dec!(2.40))]);

        let report = degraded_tick(&engine, dec!(2.39), 1_000);
        assert_eq!(report.triggered, vec![opened.orders[0].id]);
    }

    #[test]
    fn conservative_policy_skips_triggers_on_degraded_ticks() {
        let mut config = EngineConfig::default();
        config.degraded.skip_triggers = true;
        let (engine, _) = engine_with(config);
        let opened = open_long(&engine, vec![OrderSpec::stop_loss(dec!(2.40))]);

        let report = degraded_tick(&engine, dec!(2.39), 1_000);
        assert!(report.triggered.is_empty());
        assert_eq!(report.triggers_skipped, 1);
        assert_eq!(engine.get_order(opened.orders[0].id).unwrap().status, OrderStatus::Active);
    }

    #[test]
    fn out_of_order_tick_is_rejected() {
        let (engine, _) = engine();
        open_long(&engine, Vec::new());
        tick(&engine, dec!(2.55), 2_000);

        let report = tick(&engine, dec!(2.27), 1_000);
        assert!(report.rejected);
        assert_eq!(report.positions_evaluated, 0);

        let prices = engine.market_prices(&Pair::wld_numa()).unwrap();
        assert_eq!(prices.last, Price::new_unchecked(dec!(2.55)));
        assert!(engine
            .recent_events(1)
            .iter()
            .any(|e| matches!(e.payload, EventPayload::TickRejected { .. })));
    }

    #[test]
    fn mark_window_smooths_a_spike() {
        let mut config = EngineConfig::default();
        config.feed.mark_window_ms = 60_000;
        let (engine, _) = engine_with(config);
        let opened = open_long(&engine, Vec::new());

        // one millisecond at 2.27 against a minute at 2.50
        let report = tick(&engine, dec!(2.27), 60_000);
        assert!(report.liquidated.is_empty());
        assert!(report.mark.unwrap() > Price::new_unchecked(dec!(2.40)));
        assert!(engine.get_position(opened.position.id).unwrap().is_open());
    }
}

mod validation {
    use super::*;

    #[test]
    fn leverage_above_cap_is_rejected() {
        let (engine, _) = engine();
        engine.deposit(UserId(1), Quote::new(dec!(100)), Timestamp::from_millis(0));
        tick(&engine, dec!(2.50), 0);

        let spec = PositionSpec::new(UserId(1), Pair::wld_numa(), Side::Long, dec!(100), dec!(501), dec!(1));
        let err = engine.open_position(&spec, Timestamp::from_millis(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(engine.account(UserId(1)).unwrap().reserved, Quote::zero());
    }

    #[test]
    fn margin_below_notional_over_leverage_is_rejected() {
        let (engine, _) = engine();
        engine.deposit(UserId(1), Quote::new(dec!(100)), Timestamp::from_millis(0));
        tick(&engine, dec!(2.50), 0);

        let spec = PositionSpec::new(UserId(1), Pair::wld_numa(), Side::Long, dec!(100), dec!(10), dec!(20));
        let err = engine.open_position(&spec, Timestamp::from_millis(0)).unwrap_err();
        assert!(matches!(err, EngineError::Ledger(LedgerError::InsufficientMargin { .. })));
    }

    #[test]
    fn open_without_price_is_unavailable() {
        let (engine, _) = engine();
        engine.deposit(UserId(1), Quote::new(dec!(100)), Timestamp::from_millis(0));

        let spec = PositionSpec::new(UserId(1), Pair::wld_numa(), Side::Long, dec!(100), dec!(10), dec!(25));
        let err = engine.open_position(&spec, Timestamp::from_millis(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn open_without_funds_is_rejected() {
        let (engine, _) = engine();
        tick(&engine, dec!(2.50), 0);

        let spec = PositionSpec::new(UserId(9), Pair::wld_numa(), Side::Short, dec!(100), dec!(10), dec!(25));
        let err = engine.open_position(&spec, Timestamp::from_millis(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
