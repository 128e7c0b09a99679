//! Market configuration and state.
//!
//! A market is one instrument on one underlying: its own order book, clearing
//! pool, insurance fund, funding state and risk parameters. Config is fixed at
//! creation except for the governance-tunable parameter blocks; state changes
//! with every trade, oracle refresh and keeper call.

use crate::account::MarketView;
use crate::adl::AdlParams;
use crate::fees::FeeConfig;
use crate::funding::{FundingParams, FundingState};
use crate::instrument::{Barrier, BarrierKind, InstrumentKind, OptionType};
use crate::liquidation::LiquidationParams;
use crate::margin::MarginParams;
use crate::mark_price::MarkPriceParams;
use crate::order::OrderBook;
use crate::types::{is_multiple_of, AccountId, AssetId, MarketId, OrderId, Price, Quote, SignedSize, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Filled orders a market remembers for late cancels.
pub const MAX_FILLED_ORDERS: usize = 10_000;

/// Market status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarketStatus {
    /// Market is open for trading
    #[default]
    Active,
    /// Trading halted by governance. Cancels still work.
    Paused,
    /// Dated market past settlement. Terminal.
    Settled,
}

/// Market configuration. Identity fields never change; the parameter blocks
/// can be replaced through admin entry points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    pub id: MarketId,
    /// Human-readable name (e.g., "BTC-PERP")
    pub name: String,
    /// Underlying asset. Spot markets trade it; derivatives only reference its price.
    pub base_asset: AssetId,
    /// Settlement and margin asset
    pub quote_asset: AssetId,
    pub kind: InstrumentKind,
    pub min_order_size: Decimal,
    pub max_order_size: Decimal,
    /// Minimum price increment. Misaligned prices are rejected.
    pub tick_size: Decimal,
    /// Minimum size increment
    pub lot_size: Decimal,
    pub margin_params: MarginParams,
    pub mark_price_params: MarkPriceParams,
    pub funding_params: FundingParams,
    pub liquidation_params: LiquidationParams,
    pub fee_config: FeeConfig,
    pub adl_params: AdlParams,
    /// Oracle samples inside `[expiry - window, expiry]` feed the settlement TWAP.
    pub settlement_window_ms: i64,
}

impl MarketConfig {
    fn base(id: u32, name: &str, base_asset: AssetId, kind: InstrumentKind) -> Self {
        Self {
            id: MarketId(id),
            name: name.to_string(),
            base_asset,
            quote_asset: AssetId::USD,
            kind,
            min_order_size: dec!(0.0001),
            max_order_size: dec!(1000),
            tick_size: dec!(0.1),
            lot_size: dec!(0.0001),
            margin_params: MarginParams::default(),
            mark_price_params: MarkPriceParams::default(),
            funding_params: FundingParams::default(),
            liquidation_params: LiquidationParams::default(),
            fee_config: FeeConfig::default(),
            adl_params: AdlParams::default(),
            settlement_window_ms: 30 * 60_000,
        }
    }

    /// BTC perpetual margined in USD.
    pub fn btc_perp() -> Self {
        Self::base(1, "BTC-PERP", AssetId::BTC, InstrumentKind::Perpetual)
    }

    /// ETH/USD spot.
    pub fn eth_spot() -> Self {
        let mut config = Self::base(2, "ETH-USD", AssetId::ETH, InstrumentKind::Spot);
        config.min_order_size = dec!(0.001);
        config.max_order_size = dec!(10_000);
        config.lot_size = dec!(0.001);
        config.tick_size = dec!(0.01);
        config
    }

    /// Cash-settled BTC future.
    pub fn btc_future(expiry: Timestamp) -> Self {
        Self::base(3, "BTC-FUT", AssetId::BTC, InstrumentKind::Future { expiry })
    }

    /// European BTC call. Orders are quoted in premium.
    pub fn btc_call(strike: Price, expiry: Timestamp) -> Self {
        let mut config = Self::base(
            4,
            "BTC-CALL",
            AssetId::BTC,
            InstrumentKind::Option {
                expiry,
                strike,
                option_type: OptionType::Call,
                barrier: None,
            },
        );
        config.tick_size = dec!(0.01);
        config.lot_size = dec!(0.01);
        config.min_order_size = dec!(0.01);
        config
    }

    pub fn btc_barrier_call(strike: Price, level: Price, barrier_kind: BarrierKind, expiry: Timestamp) -> Self {
        let mut config = Self::btc_call(strike, expiry);
        config.id = MarketId(5);
        config.name = "BTC-BARRIER-CALL".to_string();
        config.kind = InstrumentKind::Option {
            expiry,
            strike,
            option_type: OptionType::Call,
            barrier: Some(Barrier {
                level,
                kind: barrier_kind,
            }),
        };
        config
    }

    pub fn with_id(mut self, id: MarketId) -> Self {
        self.id = id;
        self
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        if self.tick_size <= Decimal::ZERO || self.lot_size <= Decimal::ZERO {
            return Err(MarketError::InvalidConfig("tick and lot size must be positive".to_string()));
        }
        if self.min_order_size < self.lot_size {
            return Err(MarketError::InvalidConfig("minimum order below one lot".to_string()));
        }
        if self.min_order_size > self.max_order_size {
            return Err(MarketError::InvalidConfig("minimum order above maximum".to_string()));
        }
        if self.settlement_window_ms < 0 {
            return Err(MarketError::InvalidConfig("negative settlement window".to_string()));
        }
        if !self.kind.is_spot() && self.base_asset == self.quote_asset {
            return Err(MarketError::InvalidConfig("underlying equals quote asset".to_string()));
        }
        self.margin_params.validate().map_err(MarketError::InvalidConfig)?;
        self.funding_params.validate().map_err(MarketError::InvalidConfig)?;
        self.liquidation_params.validate().map_err(MarketError::InvalidConfig)?;
        self.fee_config
            .validate()
            .map_err(|e| MarketError::InvalidConfig(e.to_string()))?;
        Ok(())
    }

    /// Validate an order size
    pub fn validate_size(&self, size: Decimal) -> Result<(), MarketError> {
        if size < self.min_order_size {
            return Err(MarketError::OrderTooSmall {
                size,
                minimum: self.min_order_size,
            });
        }
        if size > self.max_order_size {
            return Err(MarketError::OrderTooLarge {
                size,
                maximum: self.max_order_size,
            });
        }
        if !is_multiple_of(size, self.lot_size) {
            return Err(MarketError::InvalidLotSize {
                size,
                lot_size: self.lot_size,
            });
        }
        Ok(())
    }

    pub fn validate_price(&self, price: Price) -> Result<Price, MarketError> {
        if !is_multiple_of(price.value(), self.tick_size) {
            return Err(MarketError::InvalidTick {
                price,
                tick_size: self.tick_size,
            });
        }
        Ok(price)
    }

    /// `size * price`, or an error where the product leaves decimal range.
    pub fn notional(&self, size: Decimal, price: Price) -> Result<Decimal, MarketError> {
        size.checked_mul(price.value()).ok_or(MarketError::NotionalOverflow { size, price })
    }
}

/// Dynamic market state (changes during trading)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketState {
    pub config: MarketConfig,
    pub status: MarketStatus,
    pub order_book: OrderBook,
    pub funding_state: FundingState,
    /// Last validated oracle price of the underlying
    pub index_price: Option<Price>,
    /// Underlying price margin and pnl are measured against
    pub mark_price: Option<Price>,
    /// Smoothed premium for mark price calculation
    pub smoothed_premium: Decimal,
    pub open_interest_long: Decimal,
    pub open_interest_short: Decimal,
    pub last_trade_price: Option<Price>,
    /// Cumulative traded notional
    pub volume: Decimal,
    /// Latest oracle time at which the barrier was touched, at or before expiry.
    pub last_barrier_touch: Option<Timestamp>,
    /// Oracle samples inside the settlement window, in time order.
    pub settlement_samples: Vec<(Timestamp, Price)>,
    pub settlement_price: Option<Price>,
    /// Newest fully filled orders and their owners, so a late cancel is a no-op.
    pub filled_orders: BTreeMap<OrderId, AccountId>,
    /// Deficit neither insurance nor deleveraging could absorb.
    pub socialized_deficit: Quote,
    pub created_at: Timestamp,
    pub last_updated: Timestamp,
}

impl MarketState {
    pub fn new(config: MarketConfig, timestamp: Timestamp) -> Self {
        let order_book = OrderBook::new(config.id);
        let funding_state = FundingState::new(timestamp);

        Self {
            config,
            status: MarketStatus::Active,
            order_book,
            funding_state,
            index_price: None,
            mark_price: None,
            smoothed_premium: Decimal::ZERO,
            open_interest_long: Decimal::ZERO,
            open_interest_short: Decimal::ZERO,
            last_trade_price: None,
            volume: Decimal::ZERO,
            last_barrier_touch: None,
            settlement_samples: Vec::new(),
            settlement_price: None,
            filled_orders: BTreeMap::new(),
            socialized_deficit: Quote::zero(),
            created_at: timestamp,
            last_updated: timestamp,
        }
    }

    pub fn id(&self) -> MarketId {
        self.config.id
    }

    /// Remembers a fully filled order. Order ids only grow, so the oldest entry
    /// goes first once `MAX_FILLED_ORDERS` is reached.
    pub fn record_filled_order(&mut self, order_id: OrderId, owner: AccountId) {
        self.filled_orders.insert(order_id, owner);
        while self.filled_orders.len() > MAX_FILLED_ORDERS {
            self.filled_orders.pop_first();
        }
    }

    pub fn kind(&self) -> &InstrumentKind {
        &self.config.kind
    }

    pub fn is_active(&self) -> bool {
        self.status == MarketStatus::Active
    }

    pub fn is_settled(&self) -> bool {
        self.status == MarketStatus::Settled
    }

    /// At or past expiry. Never true for spot or perpetual markets.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.config.kind.expiry().is_some_and(|expiry| now >= expiry)
    }

    /// Get effective mark price (falls back to index if no mark)
    pub fn effective_mark_price(&self) -> Option<Price> {
        self.mark_price.or(self.index_price)
    }

    /// Margin inputs for this market, once it has a price.
    pub fn view(&self) -> Option<MarketView<'_>> {
        let mark = self.effective_mark_price()?;
        Some(MarketView {
            kind: &self.config.kind,
            quote_asset: self.config.quote_asset,
            mark,
            funding_index: self.funding_state.cumulative_index,
            margin_params: &self.config.margin_params,
        })
    }

    // 12.1: open interest follows position size changes, one side at a time
    pub fn apply_position_change(&mut self, old: SignedSize, new: SignedSize) {
        let long = |s: SignedSize| s.value().max(Decimal::ZERO);
        let short = |s: SignedSize| (-s.value()).max(Decimal::ZERO);
        self.open_interest_long += long(new) - long(old);
        self.open_interest_short += short(new) - short(old);
    }

    pub fn record_trade(&mut self, price: Price, size: Decimal, timestamp: Timestamp) {
        self.last_trade_price = Some(price);
        self.volume = self.volume.saturating_add(size.saturating_mul(price.value()));
        self.last_updated = timestamp;
    }

    /// Longs minus shorts. Zero whenever every fill has a counterparty.
    pub fn net_open_interest(&self) -> Decimal {
        self.open_interest_long - self.open_interest_short
    }

    pub fn total_open_interest(&self) -> Decimal {
        self.open_interest_long.max(self.open_interest_short)
    }

    // 12.2: keeps samples that fall inside the settlement window
    pub fn record_settlement_sample(&mut self, at: Timestamp, price: Price) -> bool {
        let Some(expiry) = self.config.kind.expiry() else {
            return false;
        };
        let window_start = expiry.plus_millis(-self.config.settlement_window_ms);
        if at < window_start || at > expiry {
            return false;
        }
        if self.settlement_samples.last().is_some_and(|(last, _)| *last >= at) {
            return false;
        }
        self.settlement_samples.push((at, price));
        true
    }

    // 12.3: a touch after expiry does not count
    pub fn record_barrier(&mut self, at: Timestamp, underlying: Price) -> bool {
        let Some(barrier) = self.config.kind.barrier() else {
            return false;
        };
        if self.config.kind.expiry().is_some_and(|expiry| at > expiry) {
            return false;
        }
        if !barrier.touched_by(underlying) {
            return false;
        }
        if self.last_barrier_touch.map_or(true, |last| at > last) {
            self.last_barrier_touch = Some(at);
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketError {
    #[error("Order size {size} below minimum {minimum}")]
    OrderTooSmall { size: Decimal, minimum: Decimal },

    #[error("Order size {size} above maximum {maximum}")]
    OrderTooLarge { size: Decimal, maximum: Decimal },

    #[error("Notional of {size} at {price} is out of range")]
    NotionalOverflow { size: Decimal, price: Price },

    #[error("Size {size} not aligned to lot size {lot_size}")]
    InvalidLotSize { size: Decimal, lot_size: Decimal },

    #[error("Price {price} not aligned to tick size {tick_size}")]
    InvalidTick { price: Price, tick_size: Decimal },

    #[error("Invalid market config: {0}")]
    InvalidConfig(String),
}
