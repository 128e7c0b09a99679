//! Order entry, cancellation and the matching commit.

use super::core::Engine;
use super::positions::RiskBefore;
use super::results::{margin_error, EngineError, MatchingPassResult, OrderResult, OrderStatus};
use crate::events::{CancelReason, EventPayload, OrderCancelledEvent, OrderExpiredEvent, OrderPostedEvent, TradeExecutedEvent};
use crate::fees::{FeeRouter, FillFees};
use crate::matching::{compute_fill_plan, PlannedFill};
use crate::oracle::PriceOracle;
use crate::order::{Fill, Order, PriceLevel, TimeInForce};
use crate::types::{AccountId, MarketId, OrderId, Price, Side, Timestamp};
use crate::vault::Holder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An order as a trader submits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOrder {
    pub account: AccountId,
    pub market_id: MarketId,
    pub side: Side,
    /// None = market order
    pub price: Option<Price>,
    pub quantity: Decimal,
    pub time_in_force: TimeInForce,
    pub expiry: Option<Timestamp>,
}

impl SubmitOrder {
    /// Good-till-cancelled limit order.
    pub fn limit(account: AccountId, market_id: MarketId, side: Side, price: Price, quantity: Decimal) -> Self {
        Self {
            account,
            market_id,
            side,
            price: Some(price),
            quantity,
            time_in_force: TimeInForce::GTC,
            expiry: None,
        }
    }

    /// Market order. Whatever the book cannot fill is dropped.
    pub fn market(account: AccountId, market_id: MarketId, side: Side, quantity: Decimal) -> Self {
        Self {
            account,
            market_id,
            side,
            price: None,
            quantity,
            time_in_force: TimeInForce::IOC,
            expiry: None,
        }
    }

    pub fn with_time_in_force(mut self, time_in_force: TimeInForce) -> Self {
        self.time_in_force = time_in_force;
        self
    }

    pub fn with_expiry(mut self, expiry: Timestamp) -> Self {
        self.expiry = Some(expiry);
        self
    }
}

impl<O: PriceOracle, R: FeeRouter> Engine<O, R> {
    fn next_order_id(&mut self) -> OrderId {
        let id = OrderId(self.state.next_order_id);
        self.state.next_order_id += 1;
        id
    }

    /// Match an order against the book and rest any remainder its time in force
    /// allows. Either every fill and the resting remainder commit, or nothing does.
    pub fn submit_order(&mut self, request: SubmitOrder) -> Result<OrderResult, EngineError> {
        self.transaction(|engine| engine.execute_order(request))
    }

    fn execute_order(&mut self, request: SubmitOrder) -> Result<OrderResult, EngineError> {
        let now = self.current_time;
        let market_id = request.market_id;

        // 2.0: admission
        let market = self.market_ref(market_id)?;
        if market.is_settled() || market.is_expired(now) {
            return Err(EngineError::MarketExpired(market_id));
        }
        if !market.is_active() {
            return Err(EngineError::MarketNotActive(market_id));
        }
        market.config.validate_size(request.quantity)?;
        if let Some(price) = request.price {
            market.config.validate_price(price)?;
            market.config.notional(request.quantity, price)?;
        }
        if request.price.is_none() && request.time_in_force == TimeInForce::PostOnly {
            return Err(EngineError::InvalidOrder("post-only order needs a limit price".to_string()));
        }
        if request.expiry.is_some_and(|expiry| expiry <= now) {
            return Err(EngineError::InvalidOrder("order expires before it can rest".to_string()));
        }
        let spot = market.config.kind.is_spot();
        let (base, quote) = (market.config.base_asset, market.config.quote_asset);
        self.account_ref(request.account)?;

        if !spot {
            self.refresh_market_prices(market_id)?;
        }

        let lock_asset = if spot && request.side == Side::Sell { base } else { quote };
        let order_id = self.next_order_id();
        let order = Order::new(
            order_id,
            request.account,
            market_id,
            request.side,
            request.price,
            request.quantity,
            request.time_in_force,
            request.expiry,
            now,
            lock_asset,
        );

        // 2.1: a maker that cannot carry its fill loses the order and the taker
        // matches deeper
        let plan = loop {
            let plan = compute_fill_plan(&order, &self.market_ref(market_id)?.order_book, now)?;
            self.purge_orders(market_id, &plan.expired)?;
            let unfunded = if spot {
                Vec::new()
            } else {
                self.unfunded_maker_orders(market_id, order.side, &plan)?
            };
            if unfunded.is_empty() {
                break plan;
            }
            for maker_order_id in unfunded {
                self.cancel_unfunded(market_id, maker_order_id)?;
            }
        };

        // 2.1: everyone whose position moves is re-checked after the last fill
        let mut parties: Vec<RiskBefore> = Vec::new();
        if !spot {
            let mut accounts: Vec<AccountId> = plan.fills.iter().map(|f| f.maker).collect();
            accounts.push(order.owner);
            accounts.sort();
            accounts.dedup();
            for account in accounts {
                let passive = account != order.owner;
                parties.push(self.risk_before(account, market_id, passive)?);
            }
        }

        let mut fills = Vec::with_capacity(plan.fills.len());
        for planned in &plan.fills {
            fills.push(self.execute_fill(market_id, &order, planned)?);
        }
        for before in &parties {
            self.ensure_margin(before, market_id)?;
        }

        let remaining = plan.remaining_quantity;
        let mut locked = Decimal::ZERO;
        let status = match request.price {
            Some(price) if remaining > Decimal::ZERO && request.time_in_force.may_rest() => {
                locked = self.rest_order(order, price, remaining)?;
                OrderStatus::Resting
            }
            _ if remaining > Decimal::ZERO => OrderStatus::RemainderCancelled,
            _ => {
                self.market_mut(market_id)?
                    .record_filled_order(order_id, request.account);
                OrderStatus::Filled
            }
        };

        debug!(
            order = order_id.0,
            market = market_id.0,
            filled = %plan.filled_quantity,
            remaining = %remaining,
            ?status,
            "order executed"
        );

        Ok(OrderResult {
            order_id,
            status,
            filled_quantity: plan.filled_quantity,
            remaining_quantity: remaining,
            average_price: plan.average_price(),
            locked,
            fills,
        })
    }

    // 2.2: settle one planned fill and shrink the maker's resting order
    fn execute_fill(&mut self, market_id: MarketId, taker: &Order, planned: &PlannedFill) -> Result<Fill, EngineError> {
        let now = self.current_time;
        let market = self.market_ref(market_id)?;
        let maker_order = market
            .order_book
            .get(planned.maker_order_id)
            .ok_or(EngineError::OrderNotFound(planned.maker_order_id))?;
        let slice = maker_order.lock_slice(planned.quantity);
        let slice_asset = maker_order.lock_asset;
        let fees = FillFees::compute(planned.quantity * planned.price.value(), &market.config.fee_config);
        let spot = market.config.kind.is_spot();
        let (base, quote) = (market.config.base_asset, market.config.quote_asset);

        if spot {
            self.settle_spot_fill(
                base,
                quote,
                taker.owner,
                taker.side,
                planned.maker,
                (slice_asset, slice),
                planned.price,
                planned.quantity,
                &fees,
            )?;
        } else {
            let ctx = self.market_ctx(market_id)?;
            self.settle_derivative_fill(
                &ctx,
                taker.owner,
                taker.side,
                planned.maker,
                slice,
                planned.price,
                planned.quantity,
                &fees,
            )?;
        }

        let market = self.market_mut(market_id)?;
        let maker_filled = match market.order_book.get_mut(planned.maker_order_id) {
            Some(maker) => {
                maker.quantity_remaining -= planned.quantity;
                maker.locked -= slice;
                maker.is_filled()
            }
            None => false,
        };
        if maker_filled {
            market.order_book.remove(planned.maker_order_id);
            market.record_filled_order(planned.maker_order_id, planned.maker);
        }
        market.record_trade(planned.price, planned.quantity, now);

        self.emit(EventPayload::TradeExecuted(TradeExecutedEvent {
            market_id,
            maker_order_id: planned.maker_order_id,
            taker_order_id: taker.id,
            maker: planned.maker,
            taker: taker.owner,
            taker_side: taker.side,
            price: planned.price,
            quantity: planned.quantity,
            taker_fee: fees.taker_fee,
            maker_fee: fees.maker_fee,
        }));

        Ok(Fill {
            market_id,
            maker_order_id: planned.maker_order_id,
            maker: planned.maker,
            taker_order_id: taker.id,
            taker: taker.owner,
            taker_side: taker.side,
            price: planned.price,
            quantity: planned.quantity,
            taker_fee: fees.taker_fee,
            maker_fee: fees.maker_fee,
            timestamp: now,
        })
    }

    // 2.3: lock escrow for the remainder and put it on the book
    fn rest_order(&mut self, mut order: Order, price: Price, remaining: Decimal) -> Result<Decimal, EngineError> {
        let market_id = order.market_id;
        let (lock_asset, amount) = self.order_escrow(market_id, order.side, price, remaining)?;
        let market = self.market_ref(market_id)?;
        let spot = market.config.kind.is_spot();
        let quote = market.config.quote_asset;

        self.state
            .vault
            .lock(Holder::Account(order.owner), lock_asset, amount)
            .map_err(|err| if spot { err.into() } else { margin_error(err, quote) })?;

        order.quantity_remaining = remaining;
        order.locked = amount;
        order.lock_asset = lock_asset;
        let posted = OrderPostedEvent {
            market_id,
            order_id: order.id,
            account_id: order.owner,
            side: order.side,
            price,
            quantity: remaining,
            locked: amount,
        };

        let market = self.market_mut(market_id)?;
        market.order_book.insert(order)?;
        if market.order_book.is_crossed() {
            return Err(EngineError::CrossedBookRejected(market_id));
        }
        self.emit(EventPayload::OrderPosted(posted));
        Ok(amount)
    }

    /// Cancel a resting order and release its escrow. Cancelling an order that
    /// already filled completely is a no-op that releases nothing.
    pub fn cancel_order(&mut self, account: AccountId, market_id: MarketId, order_id: OrderId) -> Result<Decimal, EngineError> {
        self.transaction(|engine| {
            let market = engine.market_ref(market_id)?;
            if market.is_settled() {
                return Err(EngineError::MarketExpired(market_id));
            }
            if let Some(owner) = market.filled_orders.get(&order_id) {
                if *owner != account {
                    return Err(EngineError::NotOrderOwner { order_id, account });
                }
                return Ok(Decimal::ZERO);
            }
            let order = market
                .order_book
                .get(order_id)
                .ok_or(EngineError::OrderNotFound(order_id))?;
            if order.owner != account {
                return Err(EngineError::NotOrderOwner { order_id, account });
            }

            let released = engine.release_order(market_id, order_id)?;
            engine.emit(EventPayload::OrderCancelled(OrderCancelledEvent {
                market_id,
                order_id,
                account_id: account,
                released,
                reason: CancelReason::UserRequested,
            }));
            Ok(released)
        })
    }

    fn cancel_unfunded(&mut self, market_id: MarketId, order_id: OrderId) -> Result<(), EngineError> {
        let Some(owner) = self.market_ref(market_id)?.order_book.get(order_id).map(|o| o.owner) else {
            return Ok(());
        };
        let released = self.release_order(market_id, order_id)?;
        debug!(order = order_id.0, market = market_id.0, account = owner.0, "maker order cancelled for margin");
        self.emit(EventPayload::OrderCancelled(OrderCancelledEvent {
            market_id,
            order_id,
            account_id: owner,
            released,
            reason: CancelReason::InsufficientMargin,
        }));
        Ok(())
    }

    /// Take an order off the book and hand its escrow back. Returns the amount released.
    pub(super) fn release_order(&mut self, market_id: MarketId, order_id: OrderId) -> Result<Decimal, EngineError> {
        let market = self.market_mut(market_id)?;
        let order = market
            .order_book
            .remove(order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?;
        self.state
            .vault
            .release(Holder::Account(order.owner), order.lock_asset, order.locked)?;
        Ok(order.locked)
    }

    fn purge_orders(&mut self, market_id: MarketId, order_ids: &[OrderId]) -> Result<Decimal, EngineError> {
        let mut released = Decimal::ZERO;
        for order_id in order_ids {
            let Some(owner) = self
                .market_ref(market_id)?
                .order_book
                .get(*order_id)
                .map(|o| o.owner)
            else {
                continue;
            };
            let amount = self.release_order(market_id, *order_id)?;
            released += amount;
            self.emit(EventPayload::OrderExpired(OrderExpiredEvent {
                market_id,
                order_id: *order_id,
                account_id: owner,
                released: amount,
            }));
        }
        Ok(released)
    }

    /// Sweep expired resting orders off the book. Running it twice in a row
    /// finds nothing the second time.
    pub fn run_matching_pass(&mut self, market_id: MarketId) -> Result<MatchingPassResult, EngineError> {
        self.transaction(|engine| {
            let now = engine.current_time;
            let expired = engine.market_ref(market_id)?.order_book.expired_orders(now);
            let released = engine.purge_orders(market_id, &expired)?;
            Ok(MatchingPassResult {
                expired_orders: expired,
                released,
            })
        })
    }

    pub fn peek_top_of_book(&self, market_id: MarketId, side: Side) -> Result<Option<Price>, EngineError> {
        Ok(self.market_ref(market_id)?.order_book.peek_top(side))
    }

    pub fn depth(&self, market_id: MarketId, side: Side, max_levels: usize) -> Result<Vec<PriceLevel>, EngineError> {
        Ok(self.market_ref(market_id)?.order_book.levels(side, max_levels))
    }

    pub fn open_orders(&self, account: AccountId, market_id: MarketId) -> Vec<&Order> {
        let Some(market) = self.market(market_id) else {
            return Vec::new();
        };
        market
            .order_book
            .iter_side(Side::Buy)
            .chain(market.order_book.iter_side(Side::Sell))
            .filter(|o| o.owner == account)
            .collect()
    }
}
