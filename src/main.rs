//! Derivatives core simulation.
//!
//! Walks one engine through spot trading, a perpetual with funding, a
//! liquidation, a dated future and a barrier option, printing balances along
//! the way. Set `RUST_LOG=derivs_core=debug` to see every committed event.

use derivs_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing_subscriber::EnvFilter;

type SimResult = Result<(), EngineError>;

const HOUR_MS: i64 = 3_600_000;

fn main() -> SimResult {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    println!("Derivatives Core Simulation\n");

    scenario_1_spot_cross()?;
    scenario_2_perp_funding()?;
    scenario_3_partial_liquidation()?;
    scenario_4_future_settlement()?;
    scenario_5_barrier_option()?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn px(value: Decimal) -> Price {
    Price::new_unchecked(value)
}

fn set_btc(engine: &mut SimEngine, price: Decimal) {
    let now = engine.time();
    engine.oracle_mut().set_price(AssetId::BTC, price, now);
}

/// Spot: base against quote, both sides escrowed, taker pays the fee.
fn scenario_1_spot_cross() -> SimResult {
    println!("Scenario 1: Spot Cross\n");

    let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
    let market = engine.create_market(&cap, MarketConfig::eth_spot())?;

    let alice = engine.create_account(MarginMode::Isolated);
    let bob = engine.create_account(MarginMode::Isolated);
    engine.deposit(alice, AssetId::USD, dec!(10000))?;
    engine.deposit(bob, AssetId::ETH, dec!(5))?;

    let ask = engine.submit_order(SubmitOrder::limit(bob, market, Side::Sell, px(dec!(2000)), dec!(2)))?;
    println!("  Bob rests SELL 2 ETH @ $2,000, locked {} ETH", ask.locked);

    let buy = engine.submit_order(SubmitOrder::market(alice, market, Side::Buy, dec!(1)))?;
    println!(
        "  Alice buys {} ETH @ ${}",
        buy.filled_quantity,
        buy.average_price.map(|p| p.value()).unwrap_or_default()
    );
    println!(
        "  Alice: {} USD, {} ETH | Bob: {} USD, {} ETH locked",
        engine.available(alice, AssetId::USD),
        engine.available(alice, AssetId::ETH),
        engine.available(bob, AssetId::USD),
        engine.locked(bob, AssetId::ETH)
    );
    println!("  Fees routed: {} USD\n", engine.vault().fees_routed(AssetId::USD));
    Ok(())
}

/// Perpetual: both sides post IM, funding accrues lazily.
fn scenario_2_perp_funding() -> SimResult {
    println!("Scenario 2: Perpetual Funding\n");

    let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
    let market = engine.create_market(&cap, MarketConfig::btc_perp())?;
    set_btc(&mut engine, dec!(50000));

    let long = engine.create_account(MarginMode::Isolated);
    let short = engine.create_account(MarginMode::Isolated);
    engine.deposit(long, AssetId::USD, dec!(20000))?;
    engine.deposit(short, AssetId::USD, dec!(20000))?;

    // a bid above the index pulls the mark up, so longs pay
    engine.submit_order(SubmitOrder::limit(short, market, Side::Sell, px(dec!(50500)), dec!(1)))?;
    engine.submit_order(SubmitOrder::market(long, market, Side::Buy, dec!(0.5)))?;
    engine.submit_order(SubmitOrder::limit(long, market, Side::Buy, px(dec!(50400)), dec!(0.1)))?;

    for _ in 0..3 {
        engine.advance_time(8 * HOUR_MS);
        set_btc(&mut engine, dec!(50000));
        let result = engine.accrue_funding(market)?;
        println!(
            "  {} period(s), rate {:.6}%, index {:.4}",
            result.periods,
            result.funding_rate * dec!(100),
            result.cumulative_index
        );
    }

    let paid = engine.settle_funding(long, market)?;
    let received = engine.settle_funding(short, market)?;
    println!("  Long paid ${:.2}, short paid ${:.2}\n", paid, received);
    Ok(())
}

/// A long at health 0.9 is cut back to initial margin, not closed.
fn scenario_3_partial_liquidation() -> SimResult {
    println!("Scenario 3: Partial Liquidation\n");

    let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
    let mut config = MarketConfig::btc_perp();
    config.lot_size = dec!(1);
    config.min_order_size = dec!(1);
    config.margin_params = MarginParams {
        initial_margin_rate: dec!(0.1405),
        maintenance_margin_rate: dec!(0.05),
        max_leverage: Leverage::whole(8),
        leverage_tiers: Vec::new(),
    };
    config.mark_price_params.ema_alpha = Decimal::ZERO;
    config.fee_config = FeeConfig::zero();
    let market = engine.create_market(&cap, config)?;
    set_btc(&mut engine, dec!(100));

    let trader = engine.create_account(MarginMode::Isolated);
    let maker = engine.create_account(MarginMode::Isolated);
    let liquidator = engine.create_account(MarginMode::Isolated);
    engine.deposit(trader, AssetId::USD, dec!(1405))?;
    engine.deposit(maker, AssetId::USD, dec!(5000))?;
    engine.deposit(liquidator, AssetId::USD, dec!(5000))?;

    engine.submit_order(SubmitOrder::limit(maker, market, Side::Sell, px(dec!(100)), dec!(100)))?;
    engine.submit_order(SubmitOrder::market(trader, market, Side::Buy, dec!(100)))?;
    engine.update_margin_params(&cap, market, MarginParams::flat(dec!(0.1), dec!(0.05)))?;

    set_btc(&mut engine, dec!(90));
    engine.refresh_prices(market)?;
    println!("  Mark $90, health {}", engine.account_health(trader, market)?);

    let result = engine.liquidate(liquidator, trader, market, None)?;
    let remaining = engine.position(trader, market).map(|p| p.size.value()).unwrap_or_default();
    println!(
        "  Closed {} of 100, penalty ${} ({} to insurance), {} left open",
        result.ticket.size_to_close, result.penalty.total, result.penalty.insurance, remaining
    );
    println!("  Health after: {:.4}", engine.account_health(trader, market)?);

    match engine.liquidate(liquidator, trader, market, None) {
        Err(err @ EngineError::AlreadyHealthy { .. }) => println!("  Second call: {err}\n"),
        other => println!("  Second call: {other:?}\n"),
    }
    Ok(())
}

/// Dated future: settled at the TWAP of the window before expiry.
fn scenario_4_future_settlement() -> SimResult {
    println!("Scenario 4: Future Settlement\n");

    let expiry = Timestamp::from_millis(24 * HOUR_MS);
    let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
    let market = engine.create_market(&cap, MarketConfig::btc_future(expiry))?;
    set_btc(&mut engine, dec!(50000));

    let long = engine.create_account(MarginMode::Isolated);
    let short = engine.create_account(MarginMode::Isolated);
    engine.deposit(long, AssetId::USD, dec!(20000))?;
    engine.deposit(short, AssetId::USD, dec!(20000))?;
    engine.submit_order(SubmitOrder::limit(short, market, Side::Sell, px(dec!(50000)), dec!(1)))?;
    engine.submit_order(SubmitOrder::market(long, market, Side::Buy, dec!(1)))?;

    // two samples inside the window: 51,000 then 53,000 for equal halves
    engine.set_time(expiry.plus_millis(-20 * 60_000));
    set_btc(&mut engine, dec!(51000));
    engine.refresh_prices(market)?;
    engine.set_time(expiry.plus_millis(-10 * 60_000));
    set_btc(&mut engine, dec!(53000));
    engine.refresh_prices(market)?;

    engine.set_time(expiry);
    let result = engine.settle_expired(market)?;
    println!(
        "  Settled at ${}, {} positions closed",
        result.settlement_price.map(|p| p.value()).unwrap_or_default(),
        result.positions_closed
    );
    println!(
        "  Long: ${}, short: ${}",
        engine.available(long, AssetId::USD),
        engine.available(short, AssetId::USD)
    );

    let late = engine.submit_order(SubmitOrder::market(long, market, Side::Buy, dec!(1)));
    println!("  Late order: {:?}\n", late.err());
    Ok(())
}

/// Up-and-out call: a touch before expiry knocks the payoff out for good.
fn scenario_5_barrier_option() -> SimResult {
    println!("Scenario 5: Barrier Option\n");

    let expiry = Timestamp::from_millis(24 * HOUR_MS);
    let (mut engine, cap) = SimEngine::with_mocks(EngineConfig::default());
    let config = MarketConfig::btc_barrier_call(px(dec!(50000)), px(dec!(56000)), BarrierKind::UpAndOut, expiry);
    let market = engine.create_market(&cap, config)?;
    set_btc(&mut engine, dec!(50000));

    let buyer = engine.create_account(MarginMode::Isolated);
    let writer = engine.create_account(MarginMode::Isolated);
    engine.deposit(buyer, AssetId::USD, dec!(5000))?;
    engine.deposit(writer, AssetId::USD, dec!(20000))?;

    engine.submit_order(SubmitOrder::limit(writer, market, Side::Sell, px(dec!(800)), dec!(1)))?;
    engine.submit_order(SubmitOrder::market(buyer, market, Side::Buy, dec!(1)))?;
    println!("  Buyer pays $800 premium for a 50k/56k up-and-out call");

    engine.set_time(Timestamp::from_millis(6 * HOUR_MS));
    set_btc(&mut engine, dec!(56500));
    engine.refresh_prices(market)?;
    println!("  Underlying touches $56,500: barrier hit");

    engine.set_time(expiry);
    set_btc(&mut engine, dec!(54000));
    let result = engine.settle_expired(market)?;
    println!(
        "  Settled at ${}: buyer ${}, writer ${}",
        result.settlement_price.map(|p| p.value()).unwrap_or_default(),
        engine.available(buyer, AssetId::USD),
        engine.available(writer, AssetId::USD)
    );
    Ok(())
}
