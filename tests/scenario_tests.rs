//! End-to-end scenarios.
//!
//! Each test drives a fresh engine through a concrete situation and checks the
//! exact balances, positions and events it should leave behind.

use derivs_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const HOUR_MS: i64 = 3_600_000;

fn px(value: Decimal) -> Price {
    Price::new_unchecked(value)
}

fn set_btc(engine: &mut SimEngine, price: Decimal) {
    let now = engine.time();
    engine.oracle_mut().set_price(AssetId::BTC, price, now);
}

/// Perp with whole-unit lots, flat 10% / 5% margin, no fees and the mark
/// pinned to the index.
fn unit_perp() -> MarketConfig {
    let mut config = MarketConfig::btc_perp();
    config.lot_size = dec!(1);
    config.min_order_size = dec!(1);
    config.margin_params = MarginParams::flat(dec!(0.1), dec!(0.05));
    config.mark_price_params.ema_alpha = Decimal::ZERO;
    config.fee_config = FeeConfig::zero();
    config
}

fn funded(engine: &mut SimEngine, asset: AssetId, amount: Decimal) -> AccountId {
    let id = engine.create_account(MarginMode::Isolated);
    engine.deposit(id, asset, amount).unwrap();
    id
}

fn count_events(engine: &SimEngine, pred: impl Fn(&EventPayload) -> bool) -> usize {
    engine.events().iter().filter(|e| pred(&e.payload)).count()
}

mod order_flow {
    use super::*;

    #[test]
    fn simple_cross_fills_at_maker_price() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, MarketConfig::eth_spot()).unwrap();
        let maker = funded(&mut engine, AssetId::ETH, dec!(10));
        let taker = funded(&mut engine, AssetId::USD, dec!(1000));

        engine
            .submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(10)))
            .unwrap();
        let result = engine
            .submit_order(SubmitOrder::limit(taker, market, Side::Buy, px(dec!(101)), dec!(4)))
            .unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].price.value(), dec!(100));
        assert_eq!(result.fills[0].quantity, dec!(4));

        // resting ask shrinks to 6 and nothing new rests
        let asks = engine.depth(market, Side::Sell, 5).unwrap();
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].total_quantity, dec!(6));
        assert!(engine.peek_top_of_book(market, Side::Buy).unwrap().is_none());

        // 4 * 100 plus 5bps taker fee
        assert_eq!(engine.available(taker, AssetId::USD), dec!(1000) - dec!(400) - dec!(0.2));
        assert_eq!(engine.available(taker, AssetId::ETH), dec!(4));
        assert_eq!(engine.locked(maker, AssetId::ETH), dec!(6));
        // maker pays 2bps out of the proceeds
        assert_eq!(engine.available(maker, AssetId::USD), dec!(400) - dec!(0.08));
        assert_eq!(engine.fee_router().total(AssetId::USD), dec!(0.28));
        assert!(engine.vault().check_conservation().is_ok());
    }

    #[test]
    fn fok_rejection_leaves_book_and_escrow_untouched() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, MarketConfig::eth_spot()).unwrap();
        let maker = funded(&mut engine, AssetId::ETH, dec!(10));
        let taker = funded(&mut engine, AssetId::USD, dec!(1000));

        engine
            .submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(1)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(101)), dec!(2)))
            .unwrap();
        let events_before = engine.events().iter().count();
        let maker_locked = engine.locked(maker, AssetId::ETH);

        let fok = SubmitOrder::limit(taker, market, Side::Buy, px(dec!(102)), dec!(5)).with_time_in_force(TimeInForce::FOK);
        match engine.submit_order(fok) {
            Err(EngineError::FillPlanIncomplete { requested, available }) => {
                assert_eq!(requested, dec!(5));
                assert_eq!(available, dec!(3));
            }
            other => panic!("expected FillPlanIncomplete, got {other:?}"),
        }

        assert_eq!(engine.peek_top_of_book(market, Side::Sell).unwrap(), Some(px(dec!(100))));
        assert_eq!(engine.depth(market, Side::Sell, 5).unwrap().len(), 2);
        assert_eq!(engine.available(taker, AssetId::USD), dec!(1000));
        assert_eq!(engine.locked(maker, AssetId::ETH), maker_locked);
        assert_eq!(engine.events().iter().count(), events_before);
    }

    #[test]
    fn fully_filled_order_cancels_as_noop() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, MarketConfig::eth_spot()).unwrap();
        let maker = funded(&mut engine, AssetId::ETH, dec!(2));
        let taker = funded(&mut engine, AssetId::USD, dec!(1000));

        let ask = engine
            .submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(2)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(taker, market, Side::Buy, dec!(2)))
            .unwrap();

        assert_eq!(engine.cancel_order(maker, market, ask.order_id).unwrap(), Decimal::ZERO);
        assert!(matches!(
            engine.cancel_order(maker, market, OrderId(999)),
            Err(EngineError::OrderNotFound(_))
        ));
    }

    #[test]
    fn only_the_owner_may_cancel() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, MarketConfig::eth_spot()).unwrap();
        let maker = funded(&mut engine, AssetId::ETH, dec!(2));
        let other = funded(&mut engine, AssetId::USD, dec!(10));

        let ask = engine
            .submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(2)))
            .unwrap();
        assert!(matches!(
            engine.cancel_order(other, market, ask.order_id),
            Err(EngineError::NotOrderOwner { .. })
        ));

        let released = engine.cancel_order(maker, market, ask.order_id).unwrap();
        assert_eq!(released, dec!(2));
        assert_eq!(engine.available(maker, AssetId::ETH), dec!(2));
    }

    #[test]
    fn expired_maker_is_swept_not_matched() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, MarketConfig::eth_spot()).unwrap();
        let maker = funded(&mut engine, AssetId::ETH, dec!(2));
        let taker = funded(&mut engine, AssetId::USD, dec!(1000));

        engine
            .submit_order(
                SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(2)).with_expiry(Timestamp::from_millis(1_000)),
            )
            .unwrap();
        engine.set_time(Timestamp::from_millis(2_000));

        let result = engine
            .submit_order(SubmitOrder::market(taker, market, Side::Buy, dec!(1)))
            .unwrap();
        assert_eq!(result.filled_quantity, Decimal::ZERO);
        assert_eq!(result.status, OrderStatus::RemainderCancelled);
        assert_eq!(engine.available(maker, AssetId::ETH), dec!(2));
        assert_eq!(count_events(&engine, |p| matches!(p, EventPayload::OrderExpired(_))), 1);

        // nothing left for the keeper
        assert!(engine.run_matching_pass(market).unwrap().expired_orders.is_empty());
    }

    #[test]
    fn self_match_rejects_whole_order() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, MarketConfig::eth_spot()).unwrap();
        let trader = engine.create_account(MarginMode::Isolated);
        engine.deposit(trader, AssetId::ETH, dec!(2)).unwrap();
        engine.deposit(trader, AssetId::USD, dec!(1000)).unwrap();

        engine
            .submit_order(SubmitOrder::limit(trader, market, Side::Sell, px(dec!(100)), dec!(1)))
            .unwrap();
        assert!(matches!(
            engine.submit_order(SubmitOrder::market(trader, market, Side::Buy, dec!(1))),
            Err(EngineError::SelfMatchRejected { .. })
        ));
        assert_eq!(engine.available(trader, AssetId::USD), dec!(1000));
    }

    #[test]
    fn only_fully_filled_orders_cancel_as_noop() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, MarketConfig::eth_spot()).unwrap();
        let maker = funded(&mut engine, AssetId::ETH, dec!(5));
        let taker = funded(&mut engine, AssetId::USD, dec!(1000));

        let ask = engine
            .submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(2)))
            .unwrap();
        assert_eq!(engine.cancel_order(maker, market, ask.order_id).unwrap(), dec!(2));
        assert!(matches!(
            engine.cancel_order(maker, market, ask.order_id),
            Err(EngineError::OrderNotFound(_))
        ));

        engine
            .submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(1)))
            .unwrap();
        let ioc = engine
            .submit_order(SubmitOrder::market(taker, market, Side::Buy, dec!(3)))
            .unwrap();
        assert_eq!(ioc.status, OrderStatus::RemainderCancelled);
        assert!(matches!(
            engine.cancel_order(taker, market, ioc.order_id),
            Err(EngineError::OrderNotFound(_))
        ));

        let filled: Vec<OrderId> = engine.market(market).unwrap().filled_orders.keys().copied().collect();
        assert_eq!(filled, vec![OrderId(ask.order_id.0 + 1)]);
    }

    #[test]
    fn maker_fill_needs_maintenance_not_initial_margin() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, unit_perp()).unwrap();
        set_btc(&mut engine, dec!(100));
        let maker = funded(&mut engine, AssetId::USD, dec!(100));
        let taker = funded(&mut engine, AssetId::USD, dec!(1000));

        // escrow is exactly the IM at the limit price
        let ask = engine
            .submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(10)))
            .unwrap();
        assert_eq!(ask.locked, dec!(100));

        set_btc(&mut engine, dec!(103));
        let result = engine
            .submit_order(SubmitOrder::limit(taker, market, Side::Buy, px(dec!(100)), dec!(10)))
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);

        // the maker posts its whole escrow: equity 100 - 30 against MM 51.5
        let position = engine.position(maker, market).unwrap();
        assert_eq!(position.size.value(), dec!(-10));
        assert_eq!(position.locked_margin.value(), dec!(100));
        let snapshot = engine.margin_snapshot(maker, market).unwrap();
        assert_eq!(snapshot.equity.value(), dec!(70));
        assert_eq!(snapshot.maintenance.value(), dec!(51.5));
        assert!(!snapshot.meets_initial());
        assert!(!snapshot.is_liquidatable());

        // the taker still posts full IM: 103 less its 30 of profit
        assert_eq!(engine.available(taker, AssetId::USD), dec!(927));
        assert_eq!(engine.clearing_balance(market), dec!(173));
        assert!(engine.vault().check_conservation().is_ok());
    }

    #[test]
    fn maker_that_cannot_carry_the_fill_is_cancelled() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, unit_perp()).unwrap();
        set_btc(&mut engine, dec!(100));
        let thin = funded(&mut engine, AssetId::USD, dec!(100));
        let deep = funded(&mut engine, AssetId::USD, dec!(1000));
        let taker = funded(&mut engine, AssetId::USD, dec!(1000));

        let thin_ask = engine
            .submit_order(SubmitOrder::limit(thin, market, Side::Sell, px(dec!(100)), dec!(10)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::limit(deep, market, Side::Sell, px(dec!(101)), dec!(10)))
            .unwrap();

        // at 110 the thin maker would hold equity 0 against MM 55
        set_btc(&mut engine, dec!(110));
        let result = engine
            .submit_order(SubmitOrder::limit(taker, market, Side::Buy, px(dec!(101)), dec!(10)))
            .unwrap();
        assert_eq!(result.filled_quantity, dec!(10));
        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].maker, deep);
        assert_eq!(result.fills[0].price.value(), dec!(101));

        assert!(engine.position(thin, market).is_none());
        assert_eq!(engine.available(thin, AssetId::USD), dec!(100));
        assert!(engine.open_orders(thin, market).is_empty());
        let cancelled = count_events(&engine, |p| {
            matches!(p, EventPayload::OrderCancelled(e)
                if e.order_id == thin_ask.order_id && e.reason == CancelReason::InsufficientMargin)
        });
        assert_eq!(cancelled, 1);

        // deep maker: 1000 free, posts 200 against a 90 loss
        assert_eq!(engine.position(deep, market).unwrap().locked_margin.value(), dec!(200));
        assert_eq!(engine.available(deep, AssetId::USD), dec!(800));
        // taker: IM 110 less 90 of profit
        assert_eq!(engine.available(taker, AssetId::USD), dec!(980));
        assert!(engine.vault().check_conservation().is_ok());
    }

    #[test]
    fn reducing_while_unhealthy_must_not_lower_health() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, unit_perp()).unwrap();
        set_btc(&mut engine, dec!(100));
        let trader = funded(&mut engine, AssetId::USD, dec!(100));
        let short = funded(&mut engine, AssetId::USD, dec!(1000));
        let bidder = funded(&mut engine, AssetId::USD, dec!(1000));
        engine
            .submit_order(SubmitOrder::limit(short, market, Side::Sell, px(dec!(100)), dec!(10)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(trader, market, Side::Buy, dec!(10)))
            .unwrap();

        // equity 37.5 against MM 46.875
        set_btc(&mut engine, dec!(93.75));
        engine.refresh_prices(market).unwrap();
        assert_eq!(engine.account_health(trader, market).unwrap(), dec!(0.8));

        // selling at 89 loses more than the closed part's claim
        let low = engine
            .submit_order(SubmitOrder::limit(bidder, market, Side::Buy, px(dec!(89)), dec!(2)))
            .unwrap();
        assert!(matches!(
            engine.submit_order(SubmitOrder::market(trader, market, Side::Sell, dec!(2))),
            Err(EngineError::InsufficientMargin { .. })
        ));
        assert_eq!(engine.position(trader, market).unwrap().size.value(), dec!(10));
        engine.cancel_order(bidder, market, low.order_id).unwrap();

        // at 94 the closed part pays out 8 and health holds at 0.8
        engine
            .submit_order(SubmitOrder::limit(bidder, market, Side::Buy, px(dec!(94)), dec!(2)))
            .unwrap();
        let result = engine
            .submit_order(SubmitOrder::market(trader, market, Side::Sell, dec!(2)))
            .unwrap();
        assert_eq!(result.filled_quantity, dec!(2));

        let position = engine.position(trader, market).unwrap();
        assert_eq!(position.size.value(), dec!(8));
        assert_eq!(position.locked_margin.value(), dec!(80));
        assert_eq!(engine.available(trader, AssetId::USD), dec!(8));
        assert_eq!(engine.account_health(trader, market).unwrap(), dec!(0.8));
        assert_eq!(engine.risk_state(trader, market).unwrap(), RiskState::AtRisk);
        assert!(engine.vault().check_conservation().is_ok());
    }
}

mod liquidation_flow {
    use super::*;

    #[test]
    fn partial_liquidation_restores_initial_margin() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let mut config = unit_perp();
        // opened at 14.05% IM so the claim is 1405, then IM drops to 10%
        config.margin_params = MarginParams {
            initial_margin_rate: dec!(0.1405),
            maintenance_margin_rate: dec!(0.05),
            max_leverage: Leverage::whole(8),
            leverage_tiers: Vec::new(),
        };
        let market = engine.create_market(&cap, config).unwrap();
        set_btc(&mut engine, dec!(100));

        let trader = funded(&mut engine, AssetId::USD, dec!(1405));
        let maker = funded(&mut engine, AssetId::USD, dec!(5000));
        let liquidator = funded(&mut engine, AssetId::USD, dec!(5000));

        engine
            .submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(100)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(trader, market, Side::Buy, dec!(100)))
            .unwrap();
        assert_eq!(engine.position(trader, market).unwrap().locked_margin.value(), dec!(1405));
        engine
            .update_margin_params(&cap, market, MarginParams::flat(dec!(0.1), dec!(0.05)))
            .unwrap();

        set_btc(&mut engine, dec!(90));
        engine.refresh_prices(market).unwrap();
        assert_eq!(engine.account_health(trader, market).unwrap(), dec!(0.9));
        assert_eq!(engine.liquidation_candidates(market), vec![(trader, dec!(0.9))]);

        let result = engine.liquidate(liquidator, trader, market, None).unwrap();
        assert_eq!(result.ticket.size_to_close, dec!(62));
        assert!(!result.ticket.full_close);
        assert_eq!(result.outcome, RiskState::PartiallyLiquidated);
        assert_eq!(result.penalty.total.value(), dec!(55.8));
        assert_eq!(result.penalty.liquidator.value(), dec!(27.9));
        assert_eq!(result.penalty.insurance.value(), dec!(27.9));

        let position = engine.position(trader, market).unwrap();
        assert_eq!(position.size.value(), dec!(38));
        // 1405 - 62 * 10 realized - 55.8 penalty
        assert_eq!(position.locked_margin.value(), dec!(729.2));
        assert!(engine.margin_snapshot(trader, market).unwrap().meets_initial());

        let taken = engine.position(liquidator, market).unwrap();
        assert_eq!(taken.size.value(), dec!(62));
        assert_eq!(taken.entry_price.value(), dec!(90));
        assert_eq!(engine.available(liquidator, AssetId::USD), dec!(5000) - dec!(558) + dec!(27.9));
        assert_eq!(engine.insurance_balance(market), dec!(27.9));

        // second call finds nothing to do
        assert!(matches!(
            engine.liquidate(liquidator, trader, market, None),
            Err(EngineError::AlreadyHealthy { .. })
        ));
        assert!(engine.vault().check_conservation().is_ok());
    }

    #[test]
    fn max_repay_caps_the_partial_close() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let mut config = unit_perp();
        config.margin_params = MarginParams {
            initial_margin_rate: dec!(0.1405),
            maintenance_margin_rate: dec!(0.05),
            max_leverage: Leverage::whole(8),
            leverage_tiers: Vec::new(),
        };
        let market = engine.create_market(&cap, config).unwrap();
        set_btc(&mut engine, dec!(100));

        let trader = funded(&mut engine, AssetId::USD, dec!(1405));
        let maker = funded(&mut engine, AssetId::USD, dec!(5000));
        let liquidator = funded(&mut engine, AssetId::USD, dec!(5000));
        engine
            .submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(100)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(trader, market, Side::Buy, dec!(100)))
            .unwrap();
        engine
            .update_margin_params(&cap, market, MarginParams::flat(dec!(0.1), dec!(0.05)))
            .unwrap();
        set_btc(&mut engine, dec!(90));

        // 1,000 of notional at 90 buys 11 whole lots
        let result = engine
            .liquidate(liquidator, trader, market, Some(Quote::new(dec!(1000))))
            .unwrap();
        assert_eq!(result.ticket.size_to_close, dec!(11));
        assert_eq!(engine.position(trader, market).unwrap().size.value(), dec!(89));
        assert_eq!(engine.risk_state(trader, market).unwrap(), RiskState::AtRisk);
    }

    #[test]
    fn bankrupt_long_uses_insurance_then_deleverages() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, unit_perp()).unwrap();
        engine.fund_insurance(market, dec!(30)).unwrap();
        set_btc(&mut engine, dec!(100));

        let long = funded(&mut engine, AssetId::USD, dec!(100));
        let short = funded(&mut engine, AssetId::USD, dec!(1000));
        let liquidator = funded(&mut engine, AssetId::USD, dec!(1000));
        engine
            .submit_order(SubmitOrder::limit(short, market, Side::Sell, px(dec!(100)), dec!(10)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(long, market, Side::Buy, dec!(10)))
            .unwrap();

        // equity 100 - 200 = -100; insurance covers 30, the short absorbs 70
        set_btc(&mut engine, dec!(80));
        let result = engine.liquidate(liquidator, long, market, None).unwrap();

        assert_eq!(result.outcome, RiskState::FullyLiquidated);
        assert_eq!(result.insurance_used.value(), dec!(30));
        assert_eq!(result.deleveraged, vec![(short, dec!(10))]);
        assert_eq!(result.liquidator_size, Decimal::ZERO);
        assert!(result.socialized.is_zero());

        assert!(engine.position(long, market).is_none());
        assert!(engine.position(short, market).is_none());
        // closed at the bankruptcy price of 87: claim 100 + profit 130
        assert_eq!(engine.available(short, AssetId::USD), dec!(900) + dec!(230));
        assert_eq!(engine.insurance_balance(market), Decimal::ZERO);
        assert_eq!(engine.clearing_balance(market), Decimal::ZERO);
        assert_eq!(count_events(&engine, |p| matches!(p, EventPayload::AutoDeleveraged(_))), 1);
        assert!(engine.vault().check_conservation().is_ok());

        // nothing left to close
        assert!(matches!(
            engine.liquidate(liquidator, long, market, None),
            Err(EngineError::AlreadyHealthy { .. })
        ));
        assert_eq!(engine.available(short, AssetId::USD), dec!(1130));
    }

    #[test]
    fn unabsorbed_deficit_is_socialized() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, unit_perp()).unwrap();
        set_btc(&mut engine, dec!(100));

        let long = funded(&mut engine, AssetId::USD, dec!(100));
        let first_short = funded(&mut engine, AssetId::USD, dec!(1000));
        let late_short = funded(&mut engine, AssetId::USD, dec!(1000));
        let liquidator = funded(&mut engine, AssetId::USD, dec!(1000));
        engine
            .submit_order(SubmitOrder::limit(first_short, market, Side::Sell, px(dec!(100)), dec!(10)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(long, market, Side::Buy, dec!(10)))
            .unwrap();

        // the profitable short hands its position to one that entered at 85
        set_btc(&mut engine, dec!(85));
        engine
            .submit_order(SubmitOrder::limit(late_short, market, Side::Sell, px(dec!(85)), dec!(10)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(first_short, market, Side::Buy, dec!(10)))
            .unwrap();
        assert_eq!(engine.available(first_short, AssetId::USD), dec!(1150));

        // bankruptcy value 90 is a loss for the late short, so nobody is deleveraged
        set_btc(&mut engine, dec!(80));
        let result = engine.liquidate(liquidator, long, market, None).unwrap();
        assert!(result.deleveraged.is_empty());
        assert_eq!(result.liquidator_size, dec!(10));
        assert_eq!(result.socialized.value(), dec!(100));

        let state = engine.market(market).unwrap();
        assert_eq!(state.socialized_deficit.value(), dec!(100));
        assert_eq!(engine.clearing_gap(market), Some(dec!(100)));
        assert_eq!(count_events(&engine, |p| matches!(p, EventPayload::InsolvencyDetected(_))), 1);
        assert!(engine.vault().check_conservation().is_ok());
    }

    #[test]
    fn healthy_account_cannot_be_liquidated() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, unit_perp()).unwrap();
        set_btc(&mut engine, dec!(100));
        let long = funded(&mut engine, AssetId::USD, dec!(500));
        let short = funded(&mut engine, AssetId::USD, dec!(500));
        engine
            .submit_order(SubmitOrder::limit(short, market, Side::Sell, px(dec!(100)), dec!(10)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(long, market, Side::Buy, dec!(10)))
            .unwrap();

        assert!(matches!(
            engine.liquidate(short, long, market, None),
            Err(EngineError::AlreadyHealthy { .. })
        ));
        assert!(matches!(
            engine.liquidate(long, long, market, None),
            Err(EngineError::InvalidOrder(_))
        ));
    }
}

mod funding_flow {
    use super::*;

    fn open_pair(engine: &mut SimEngine, cap: &AdminCap) -> (MarketId, AccountId, AccountId) {
        let market = engine.create_market(cap, unit_perp()).unwrap();
        set_btc(engine, dec!(100));
        let long = funded(engine, AssetId::USD, dec!(1000));
        let short = funded(engine, AssetId::USD, dec!(1000));
        engine
            .submit_order(SubmitOrder::limit(short, market, Side::Sell, px(dec!(100)), dec!(10)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(long, market, Side::Buy, dec!(10)))
            .unwrap();
        (market, long, short)
    }

    #[test]
    fn accrual_lag_settles_every_period_at_once() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let (market, long, short) = open_pair(&mut engine, &cap);

        // five periods pass one by one while the positions are untouched
        for _ in 0..5 {
            engine.advance_time(8 * HOUR_MS);
            set_btc(&mut engine, dec!(100));
            assert_eq!(engine.accrue_funding(market).unwrap().periods, 1);
        }

        // zero premium leaves the 1bp interest rate: 5 * 0.0001 * 100 per unit
        let index = engine.market(market).unwrap().funding_state.cumulative_index;
        assert_eq!(index, dec!(0.05));
        assert_eq!(engine.settle_funding(long, market).unwrap().value(), dec!(0.5));
        assert_eq!(engine.settle_funding(short, market).unwrap().value(), dec!(-0.5));
        assert_eq!(engine.position(long, market).unwrap().locked_margin.value(), dec!(99.5));
        assert_eq!(engine.position(short, market).unwrap().locked_margin.value(), dec!(100.5));

        // already settled
        assert!(engine.settle_funding(long, market).unwrap().is_zero());
    }

    #[test]
    fn one_accrual_over_the_gap_matches_period_by_period() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let (market, long, _) = open_pair(&mut engine, &cap);

        engine.advance_time(5 * 8 * HOUR_MS + 1_000);
        set_btc(&mut engine, dec!(100));
        let result = engine.accrue_funding(market).unwrap();
        assert_eq!(result.periods, 5);
        assert_eq!(result.cumulative_index, dec!(0.05));

        // the partial period stays pending
        assert_eq!(engine.accrue_funding(market).unwrap().periods, 0);
        assert_eq!(engine.settle_funding(long, market).unwrap().value(), dec!(0.5));
    }

    #[test]
    fn stale_oracle_aborts_accrual() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let (market, _, _) = open_pair(&mut engine, &cap);

        engine.advance_time(8 * HOUR_MS);
        let err = engine.accrue_funding(market).unwrap_err();
        assert!(matches!(err, EngineError::StaleOracle(OracleError::Stale { .. })));
        assert_eq!(err.retry_hint(), RetryHint::RetryLater);
        assert!(engine.market(market).unwrap().funding_state.cumulative_index.is_zero());
    }
}

mod settlement_flow {
    use super::*;

    fn future_market(engine: &mut SimEngine, cap: &AdminCap, expiry: Timestamp) -> MarketId {
        let mut config = MarketConfig::btc_future(expiry);
        config.fee_config = FeeConfig::zero();
        engine.create_market(cap, config).unwrap()
    }

    #[test]
    fn settles_at_window_twap_and_is_final() {
        let expiry = Timestamp::from_millis(24 * HOUR_MS);
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = future_market(&mut engine, &cap, expiry);
        set_btc(&mut engine, dec!(50000));

        let long = funded(&mut engine, AssetId::USD, dec!(20000));
        let short = funded(&mut engine, AssetId::USD, dec!(20000));
        engine
            .submit_order(SubmitOrder::limit(short, market, Side::Sell, px(dec!(50000)), dec!(1)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(long, market, Side::Buy, dec!(1)))
            .unwrap();
        let resting = engine
            .submit_order(SubmitOrder::limit(long, market, Side::Buy, px(dec!(49000)), dec!(1)))
            .unwrap();
        assert!(resting.is_resting());

        engine.set_time(expiry.plus_millis(-20 * 60_000));
        set_btc(&mut engine, dec!(51000));
        engine.refresh_prices(market).unwrap();
        engine.set_time(expiry.plus_millis(-10 * 60_000));
        set_btc(&mut engine, dec!(53000));
        engine.refresh_prices(market).unwrap();

        // before expiry nothing happens
        assert!(!engine.settle_expired(market).unwrap().settled);

        engine.set_time(expiry);
        let result = engine.settle_expired(market).unwrap();
        assert!(result.settled);
        assert_eq!(result.settlement_price, Some(px(dec!(52000))));
        assert_eq!(result.positions_closed, 2);
        assert_eq!(result.orders_released, 1);
        assert!(result.haircut.is_zero());

        // size * (settlement - entry) on top of each claim
        assert_eq!(engine.available(long, AssetId::USD), dec!(22000));
        assert_eq!(engine.locked(long, AssetId::USD), Decimal::ZERO);
        assert_eq!(engine.available(short, AssetId::USD), dec!(18000));
        assert_eq!(engine.clearing_balance(market), Decimal::ZERO);
        let state = engine.market(market).unwrap();
        assert_eq!(state.status, MarketStatus::Settled);
        assert!(state.total_open_interest().is_zero());

        assert!(matches!(
            engine.submit_order(SubmitOrder::market(long, market, Side::Buy, dec!(1))),
            Err(EngineError::MarketExpired(_))
        ));
        assert!(matches!(
            engine.cancel_order(long, market, resting.order_id),
            Err(EngineError::MarketExpired(_))
        ));
        assert!(matches!(
            engine.liquidate(long, short, market, None),
            Err(EngineError::MarketExpired(_))
        ));

        let again = engine.settle_expired(market).unwrap();
        assert!(!again.settled);
        assert_eq!(again.settlement_price, Some(px(dec!(52000))));
        assert_eq!(count_events(&engine, |p| matches!(p, EventPayload::MarketSettled(_))), 1);
        assert!(engine.vault().check_conservation().is_ok());
    }

    #[test]
    fn falls_back_to_fresh_reading_without_samples() {
        let expiry = Timestamp::from_millis(24 * HOUR_MS);
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = future_market(&mut engine, &cap, expiry);

        engine.set_time(expiry.plus_millis(1));
        assert!(matches!(engine.settle_expired(market), Err(EngineError::StaleOracle(_))));
        assert!(!engine.market(market).unwrap().is_settled());

        set_btc(&mut engine, dec!(48000));
        let result = engine.settle_expired(market).unwrap();
        assert_eq!(result.settlement_price, Some(px(dec!(48000))));
    }

    #[test]
    fn perpetual_never_settles() {
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let market = engine.create_market(&cap, unit_perp()).unwrap();
        engine.set_time(Timestamp::from_millis(365 * 24 * HOUR_MS));
        let result = engine.settle_expired(market).unwrap();
        assert!(!result.settled);
        assert!(result.settlement_price.is_none());
    }

    #[test]
    fn knocked_out_call_pays_nothing() {
        let expiry = Timestamp::from_millis(24 * HOUR_MS);
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let mut config =
            MarketConfig::btc_barrier_call(px(dec!(50000)), px(dec!(56000)), BarrierKind::UpAndOut, expiry);
        config.fee_config = FeeConfig::zero();
        let market = engine.create_market(&cap, config).unwrap();
        set_btc(&mut engine, dec!(50000));

        let buyer = funded(&mut engine, AssetId::USD, dec!(1000));
        let writer = funded(&mut engine, AssetId::USD, dec!(20000));
        engine
            .submit_order(SubmitOrder::limit(writer, market, Side::Sell, px(dec!(800)), dec!(1)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(buyer, market, Side::Buy, dec!(1)))
            .unwrap();
        assert_eq!(engine.available(buyer, AssetId::USD), dec!(200));

        engine.set_time(Timestamp::from_millis(6 * HOUR_MS));
        set_btc(&mut engine, dec!(56500));
        engine.refresh_prices(market).unwrap();
        assert!(engine.position(buyer, market).unwrap().barrier_touched);

        // back under the barrier and in the money, but the touch latched
        engine.set_time(expiry);
        set_btc(&mut engine, dec!(54000));
        engine.settle_expired(market).unwrap();
        assert_eq!(engine.available(buyer, AssetId::USD), dec!(200));
        assert_eq!(engine.available(writer, AssetId::USD), dec!(20800));
        assert_eq!(count_events(&engine, |p| matches!(p, EventPayload::BarrierTouched(_))), 1);
    }

    #[test]
    fn vanilla_call_pays_intrinsic_value() {
        let expiry = Timestamp::from_millis(24 * HOUR_MS);
        let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
        let mut config = MarketConfig::btc_call(px(dec!(50000)), expiry);
        config.fee_config = FeeConfig::zero();
        let market = engine.create_market(&cap, config).unwrap();
        set_btc(&mut engine, dec!(50000));

        let buyer = funded(&mut engine, AssetId::USD, dec!(1000));
        let writer = funded(&mut engine, AssetId::USD, dec!(20000));
        engine
            .submit_order(SubmitOrder::limit(writer, market, Side::Sell, px(dec!(800)), dec!(1)))
            .unwrap();
        engine
            .submit_order(SubmitOrder::market(buyer, market, Side::Buy, dec!(1)))
            .unwrap();

        engine.set_time(expiry);
        set_btc(&mut engine, dec!(53000));
        engine.settle_expired(market).unwrap();
        assert_eq!(engine.available(buyer, AssetId::USD), dec!(200) + dec!(3000));
        assert_eq!(engine.available(writer, AssetId::USD), dec!(20000) + dec!(800) - dec!(3000));
    }
}
