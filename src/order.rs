//! Order types and order book.
//!
//! Resting orders sit in two BTreeMaps keyed so that ascending iteration is
//! best-first on both sides: asks by (price, sequence), bids by (-price, sequence).
//! The sequence number is assigned on insertion, which gives strict FIFO inside a
//! price level even when two orders share a millisecond.

use crate::types::{AccountId, AssetId, MarketId, OrderId, Price, Side, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Order time in force options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till canceled. Remainder rests until filled, canceled or expired.
    #[default]
    GTC,
    /// Immediate or cancel. Fill what is possible, discard the rest.
    IOC,
    /// Fill or kill. Fill entirely in one step or not at all.
    FOK,
    /// Post only. Rejected if any part would take liquidity.
    PostOnly,
}

impl TimeInForce {
    pub fn may_rest(&self) -> bool {
        matches!(self, TimeInForce::GTC | TimeInForce::PostOnly)
    }
}

/// A trading order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub owner: AccountId,
    pub market_id: MarketId,
    pub side: Side,
    /// None = market order
    pub price: Option<Price>,
    pub quantity: Decimal,
    pub quantity_remaining: Decimal,
    /// Time priority inside a price level. Set by the book on insert.
    pub sequence: u64,
    pub created_at: Timestamp,
    pub expiry: Option<Timestamp>,
    pub time_in_force: TimeInForce,
    /// Escrow held for the unfilled remainder.
    pub locked: Decimal,
    pub lock_asset: AssetId,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: OrderId,
        owner: AccountId,
        market_id: MarketId,
        side: Side,
        price: Option<Price>,
        quantity: Decimal,
        time_in_force: TimeInForce,
        expiry: Option<Timestamp>,
        created_at: Timestamp,
        lock_asset: AssetId,
    ) -> Self {
        Self {
            id,
            owner,
            market_id,
            side,
            price,
            quantity,
            quantity_remaining: quantity,
            sequence: 0,
            created_at,
            expiry,
            time_in_force,
            locked: Decimal::ZERO,
            lock_asset,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.quantity_remaining.is_zero()
    }

    pub fn filled_quantity(&self) -> Decimal {
        self.quantity - self.quantity_remaining
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry.is_some_and(|expiry| now >= expiry)
    }

    /// Would this order trade against a resting order at `maker_price`?
    pub fn accepts(&self, maker_price: Price) -> bool {
        match (self.side, self.price) {
            (_, None) => true,
            (Side::Buy, Some(limit)) => maker_price <= limit,
            (Side::Sell, Some(limit)) => maker_price >= limit,
        }
    }

    // share of the escrow that backs `quantity` of the remainder. the last fill
    // takes everything left so no dust stays locked.
    pub fn lock_slice(&self, quantity: Decimal) -> Decimal {
        if quantity >= self.quantity_remaining || self.quantity_remaining.is_zero() {
            self.locked
        } else {
            self.locked * quantity / self.quantity_remaining
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct BookKey {
    priority: Decimal,
    sequence: u64,
}

impl BookKey {
    fn new(side: Side, price: Price, sequence: u64) -> Self {
        let priority = match side {
            Side::Buy => -price.value(),
            Side::Sell => price.value(),
        };
        Self { priority, sequence }
    }
}

/// Aggregated depth at one price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub total_quantity: Decimal,
    pub order_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookError {
    #[error("Market order {0:?} cannot rest on the book")]
    MarketOrderCannotRest(OrderId),

    #[error("Order {0:?} already on the book")]
    DuplicateOrder(OrderId),
}

/// Central limit order book for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub market_id: MarketId,
    bids: BTreeMap<BookKey, Order>,
    asks: BTreeMap<BookKey, Order>,
    index: BTreeMap<OrderId, (Side, BookKey)>,
    next_sequence: u64,
}

impl OrderBook {
    pub fn new(market_id: MarketId) -> Self {
        Self {
            market_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: BTreeMap::new(),
            next_sequence: 1,
        }
    }

    fn side_map(&self, side: Side) -> &BTreeMap<BookKey, Order> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn side_map_mut(&mut self, side: Side) -> &mut BTreeMap<BookKey, Order> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.values().next().and_then(|o| o.price)
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.values().next().and_then(|o| o.price)
    }

    pub fn peek_top(&self, side: Side) -> Option<Price> {
        match side {
            Side::Buy => self.best_bid(),
            Side::Sell => self.best_ask(),
        }
    }

    pub fn mid_price(&self) -> Option<Price> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Price::new((bid.value() + ask.value()) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.value() - bid.value()),
            _ => None,
        }
    }

    /// Insert a resting order. Assigns its time priority.
    pub fn insert(&mut self, mut order: Order) -> Result<u64, BookError> {
        let price = order.price.ok_or(BookError::MarketOrderCannotRest(order.id))?;
        if self.index.contains_key(&order.id) {
            return Err(BookError::DuplicateOrder(order.id));
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        order.sequence = sequence;

        let side = order.side;
        let key = BookKey::new(side, price, sequence);
        self.index.insert(order.id, (side, key));
        self.side_map_mut(side).insert(key, order);
        Ok(sequence)
    }

    pub fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        let (side, key) = self.index.remove(&order_id)?;
        self.side_map_mut(side).remove(&key)
    }

    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        let (side, key) = self.index.get(&order_id)?;
        self.side_map(*side).get(key)
    }

    pub(crate) fn get_mut(&mut self, order_id: OrderId) -> Option<&mut Order> {
        let (side, key) = *self.index.get(&order_id)?;
        self.side_map_mut(side).get_mut(&key)
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.index.contains_key(&order_id)
    }

    /// Resting orders on `side`, best price first, FIFO within a price.
    pub fn iter_side(&self, side: Side) -> impl Iterator<Item = &Order> {
        self.side_map(side).values()
    }

    pub fn top(&self, side: Side, depth: usize) -> Vec<&Order> {
        self.iter_side(side).take(depth).collect()
    }

    pub fn levels(&self, side: Side, max_levels: usize) -> Vec<PriceLevel> {
        let mut levels: Vec<PriceLevel> = Vec::new();

        for order in self.iter_side(side) {
            let Some(price) = order.price else { continue };
            let same_level = levels.last().is_some_and(|l| l.price == price);
            if !same_level {
                if levels.len() >= max_levels {
                    break;
                }
                levels.push(PriceLevel {
                    price,
                    total_quantity: Decimal::ZERO,
                    order_count: 0,
                });
            }
            if let Some(level) = levels.last_mut() {
                level.total_quantity += order.quantity_remaining;
                level.order_count += 1;
            }
        }

        levels
    }

    pub fn expired_orders(&self, now: Timestamp) -> Vec<OrderId> {
        self.bids
            .values()
            .chain(self.asks.values())
            .filter(|o| o.is_expired(now))
            .map(|o| o.id)
            .collect()
    }

    pub fn order_ids(&self) -> Vec<OrderId> {
        self.index.keys().copied().collect()
    }

    /// Best bid >= best ask. Must never be observable after a commit.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    pub fn order_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// An execution between a resting maker and an incoming taker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub market_id: MarketId,
    pub maker_order_id: OrderId,
    pub maker: AccountId,
    pub taker_order_id: OrderId,
    pub taker: AccountId,
    pub taker_side: Side,
    pub price: Price,
    pub quantity: Decimal,
    pub taker_fee: Decimal,
    /// negative = rebate
    pub maker_fee: Decimal,
    pub timestamp: Timestamp,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price.value()
    }
}
