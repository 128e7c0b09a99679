//! Position updates and fill settlement.
//!
//! A fill is settled as one vault batch: the maker's escrow slice comes back,
//! both sides' positions move, margin is posted into or paid out of the market's
//! clearing pool, and fees are charged. The batch is applied once every leg is
//! known, so a fill never lands half-way.

use super::core::Engine;
use super::results::{margin_error, EngineError};
use crate::account::{calculate_account_metrics, position_snapshot, MarketView};
use crate::events::{EventPayload, FundingSettledEvent, PositionChangedEvent};
use crate::fees::{FeeRouter, FillFees};
use crate::instrument::InstrumentKind;
use crate::margin::{position_requirement, MarginParams, MarginSnapshot};
use crate::matching::{FillPlan, PlannedFill};
use crate::market::MarketError;
use crate::oracle::PriceOracle;
use crate::position::{ClosedMargin, FillOutcome, Position};
use crate::types::{AccountId, AssetId, MarketId, OrderId, Price, Quote, Side, SignedSize, Timestamp};
use crate::vault::{Bucket, Holder, LedgerOp};
use rust_decimal::Decimal;

/// Who is moving a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FillAuthority {
    /// A voluntary trade. Closed margin is paid out, opened exposure must be funded.
    Trade,
    /// The resting side of a trade. Posts toward IM only what it has free.
    Maker { free: Decimal },
    /// Forced close of a liquidated account. Skips the owner's consent and
    /// margin check; closed margin stays in the claim.
    Liquidation,
}

#[derive(Debug, Clone)]
pub(super) struct MarketCtx {
    pub(super) id: MarketId,
    pub(super) kind: InstrumentKind,
    pub(super) quote: AssetId,
    pub(super) mark: Price,
    pub(super) funding_index: Decimal,
    pub(super) margin: MarginParams,
    pub(super) tick: Decimal,
    pub(super) lot: Decimal,
    pub(super) last_barrier_touch: Option<Timestamp>,
}

impl MarketCtx {
    pub(super) fn view(&self) -> MarketView<'_> {
        MarketView {
            kind: &self.kind,
            quote_asset: self.quote,
            mark: self.mark,
            funding_index: self.funding_index,
            margin_params: &self.margin,
        }
    }

    pub(super) fn unit_value(&self, position: &Position) -> Decimal {
        position.unit_value(&self.kind, self.mark)
    }
}

/// Ledger legs of one settlement step.
#[derive(Debug, Clone)]
pub(super) struct LegBatch {
    market_id: MarketId,
    quote: AssetId,
    pool: Decimal,
    pub(super) ops: Vec<LedgerOp>,
}

impl LegBatch {
    pub(super) fn new(market_id: MarketId, quote: AssetId, pool: Decimal) -> Self {
        Self {
            market_id,
            quote,
            pool,
            ops: Vec::new(),
        }
    }

    pub(super) fn push(&mut self, op: LedgerOp) {
        self.ops.push(op);
    }

    pub(super) fn post(&mut self, account: AccountId, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        self.ops.push(LedgerOp::Lock {
            holder: Holder::Account(account),
            asset: self.quote,
            amount,
        });
        self.pool_in(Holder::Account(account), amount);
    }

    pub(super) fn pool_in(&mut self, from: Holder, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        self.ops.push(LedgerOp::TransferLocked {
            from,
            to: Holder::Clearing(self.market_id),
            asset: self.quote,
            amount,
            into: Bucket::Locked,
        });
        self.pool += amount;
    }

    // capped at what the pool holds
    pub(super) fn pay_out(&mut self, to: Holder, amount: Decimal) -> Decimal {
        let paid = amount.min(self.pool).max(Decimal::ZERO);
        if paid > Decimal::ZERO {
            self.ops.push(LedgerOp::TransferLocked {
                from: Holder::Clearing(self.market_id),
                to,
                asset: self.quote,
                amount: paid,
                into: Bucket::Available,
            });
            self.pool -= paid;
        }
        paid
    }

    pub(super) fn pool(&self) -> Decimal {
        self.pool
    }

    // 2.4: taker fee (less the maker rebate it funds) and any maker charge, all
    // paid from available quote
    pub(super) fn charge_fees(&mut self, taker: AccountId, maker: AccountId, fees: &FillFees) {
        let quote = self.quote;
        if fees.taker_fee > Decimal::ZERO {
            self.ops.push(LedgerOp::Lock {
                holder: Holder::Account(taker),
                asset: quote,
                amount: fees.taker_fee,
            });
            self.ops.push(LedgerOp::RouteFee {
                payer: Holder::Account(taker),
                asset: quote,
                amount: fees.taker_routed(),
            });
            if fees.maker_rebate() > Decimal::ZERO {
                self.ops.push(LedgerOp::TransferLocked {
                    from: Holder::Account(taker),
                    to: Holder::Account(maker),
                    asset: quote,
                    amount: fees.maker_rebate(),
                    into: Bucket::Available,
                });
            }
        }
        if fees.maker_charge() > Decimal::ZERO {
            self.ops.push(LedgerOp::Lock {
                holder: Holder::Account(maker),
                asset: quote,
                amount: fees.maker_charge(),
            });
            self.ops.push(LedgerOp::RouteFee {
                payer: Holder::Account(maker),
                asset: quote,
                amount: fees.maker_charge(),
            });
        }
    }
}

/// Risk of one account before a trade, for the post-trade check.
#[derive(Debug, Clone, Copy)]
pub(super) struct RiskBefore {
    pub(super) account: AccountId,
    pub(super) size: SignedSize,
    pub(super) health: Decimal,
    /// Resting maker; added exposure only has to clear maintenance.
    pub(super) passive: bool,
}

// 3.3: added exposure needs IM, except on a resting maker, which only has to stay
// above maintenance. a reduction must not leave the account liquidatable unless
// it improved its health.
fn margin_holds(before: &RiskBefore, size: SignedSize, after: &MarginSnapshot) -> bool {
    let flipped = !before.size.is_zero() && !size.is_zero() && before.size.is_long() != size.is_long();
    let increased = flipped || size.abs() > before.size.abs();
    match (increased, before.passive) {
        (true, false) => after.meets_initial(),
        (true, true) => !after.is_liquidatable(),
        (false, _) => !after.is_liquidatable() || after.health() >= before.health,
    }
}

impl<O: PriceOracle, R: FeeRouter> Engine<O, R> {
    pub(super) fn market_ctx(&self, market_id: MarketId) -> Result<MarketCtx, EngineError> {
        let market = self.market_ref(market_id)?;
        let mark = market
            .effective_mark_price()
            .ok_or(EngineError::NoMarkPrice(market_id))?;
        Ok(MarketCtx {
            id: market_id,
            kind: market.config.kind.clone(),
            quote: market.config.quote_asset,
            mark,
            funding_index: market.funding_state.cumulative_index,
            margin: market.config.margin_params.clone(),
            tick: market.config.tick_size,
            lot: market.config.lot_size,
            last_barrier_touch: market.last_barrier_touch,
        })
    }

    pub(super) fn new_batch(&self, ctx: &MarketCtx) -> LegBatch {
        LegBatch::new(ctx.id, ctx.quote, self.clearing_balance(ctx.id))
    }

    /// Applies a batch and queues its fee legs for routing at commit.
    pub(super) fn commit_batch(&mut self, ops: &[LedgerOp], quote: AssetId, margined: bool) -> Result<(), EngineError> {
        let fees = self.state.vault.apply_batch(ops).map_err(|err| {
            if margined {
                margin_error(err, quote)
            } else {
                err.into()
            }
        })?;
        self.state.pending_fees.extend(fees);
        Ok(())
    }

    /// Realizes pending funding into the position's claim. Zero if there is none.
    pub(super) fn settle_position_funding(
        &mut self,
        account_id: AccountId,
        market_id: MarketId,
        funding_index: Decimal,
    ) -> Result<Quote, EngineError> {
        let account = self.account_mut(account_id)?;
        let Some(position) = account.get_position_mut(market_id) else {
            return Ok(Quote::zero());
        };
        let position_size = position.size;
        let payment = position.settle_funding(funding_index);
        if !payment.is_zero() {
            self.emit(EventPayload::FundingSettled(FundingSettledEvent {
                market_id,
                account_id,
                payment,
                position_size,
            }));
        }
        Ok(payment)
    }

    // 4.4: one side of a derivative fill. settles funding, applies the fill and
    // adds the margin legs to `batch`.
    pub(super) fn position_leg(
        &mut self,
        ctx: &MarketCtx,
        account_id: AccountId,
        delta: Decimal,
        price: Price,
        authority: FillAuthority,
        batch: &mut LegBatch,
    ) -> Result<FillOutcome, EngineError> {
        let now = self.current_time;
        self.settle_position_funding(account_id, ctx.id, ctx.funding_index)?;

        let account = self.account_ref(account_id)?;
        let is_cross = account.is_cross();
        let mut position = account
            .get_position(ctx.id)
            .cloned()
            .unwrap_or_else(|| Position::new(account_id, ctx.id, price, ctx.funding_index, now));

        let old_size = position.size;
        let mode = match authority {
            FillAuthority::Trade | FillAuthority::Maker { .. } => ClosedMargin::Released,
            FillAuthority::Liquidation => ClosedMargin::Retained,
        };
        let outcome = position.apply_fill(delta, price, mode, now);
        latch_barrier(&mut position, ctx.last_barrier_touch);

        if mode == ClosedMargin::Released {
            // opened exposure is funded up to IM from free collateral
            if outcome.opened > Decimal::ZERO {
                let mut shortfall = position_snapshot(&position, &ctx.view()).initial_shortfall().value();
                if let FillAuthority::Maker { free } = authority {
                    shortfall = shortfall.min(free.max(Decimal::ZERO));
                }
                batch.post(account_id, shortfall);
                position.locked_margin = position.locked_margin.add(Quote::new(shortfall));
            }

            if outcome.released.is_positive() {
                batch.pay_out(Holder::Account(account_id), outcome.released.value());
            } else if outcome.released.is_negative() {
                let owed = outcome.released.abs().value();
                self.cover_closing_loss(ctx, account_id, is_cross, owed, batch)?;
            }
        }

        let new_size = position.size;
        let event = PositionChangedEvent {
            market_id: ctx.id,
            account_id,
            old_size,
            new_size,
            entry_price: position.entry_price,
            locked_margin: position.locked_margin,
            realized_pnl: outcome.realized_pnl,
        };

        let account = self.account_mut(account_id)?;
        if position.is_empty() && position.locked_margin.is_zero() {
            account.remove_position(ctx.id);
        } else {
            account.set_position(position);
        }
        self.market_mut(ctx.id)?.apply_position_change(old_size, new_size);
        self.emit(EventPayload::PositionChanged(event));
        Ok(outcome)
    }

    // a full close whose loss ran past its claim: the owner pays the rest from
    // free quote, then from other cross claims
    fn cover_closing_loss(
        &mut self,
        ctx: &MarketCtx,
        account_id: AccountId,
        is_cross: bool,
        owed: Decimal,
        batch: &mut LegBatch,
    ) -> Result<(), EngineError> {
        let available = self.state.vault.available(Holder::Account(account_id), ctx.quote);
        let from_available = owed.min(available.max(Decimal::ZERO));
        batch.post(account_id, from_available);

        let mut remaining = owed - from_available;
        if remaining > Decimal::ZERO && is_cross {
            remaining -= self.draw_cross_claims(ctx, account_id, remaining, batch)?;
        }
        if remaining > Decimal::ZERO {
            return Err(EngineError::InsufficientMargin {
                account: account_id,
                required: owed,
                available: owed - remaining,
            });
        }
        Ok(())
    }

    /// Moves up to `amount` of a cross account's claims in other same-quote markets
    /// into `ctx`'s pool. Returns what was moved.
    pub(super) fn draw_cross_claims(
        &mut self,
        ctx: &MarketCtx,
        account_id: AccountId,
        amount: Decimal,
        batch: &mut LegBatch,
    ) -> Result<Decimal, EngineError> {
        let donors: Vec<(MarketId, Decimal)> = self
            .account_ref(account_id)?
            .positions
            .iter()
            .filter(|(id, p)| **id != ctx.id && p.locked_margin.is_positive())
            .filter(|(id, _)| {
                self.state
                    .markets
                    .get(id)
                    .is_some_and(|m| m.config.quote_asset == ctx.quote && !m.is_settled())
            })
            .map(|(id, p)| (*id, p.locked_margin.value()))
            .collect();

        let mut moved = Decimal::ZERO;
        for (donor, claim) in donors {
            if moved >= amount {
                break;
            }
            let pool = self.state.vault.locked(Holder::Clearing(donor), ctx.quote);
            let take = (amount - moved).min(claim).min(pool);
            if take <= Decimal::ZERO {
                continue;
            }
            batch.pool_in(Holder::Clearing(donor), take);
            if let Some(position) = self.account_mut(account_id)?.get_position_mut(donor) {
                position.locked_margin = position.locked_margin.sub(Quote::new(take));
            }
            moved += take;
        }
        Ok(moved)
    }

    // 2.3: derivative fill. maker escrow slice back, both legs, then fees
    #[allow(clippy::too_many_arguments)]
    pub(super) fn settle_derivative_fill(
        &mut self,
        ctx: &MarketCtx,
        taker: AccountId,
        taker_side: Side,
        maker: AccountId,
        maker_slice: Decimal,
        price: Price,
        quantity: Decimal,
        fees: &FillFees,
    ) -> Result<(), EngineError> {
        let mut batch = self.new_batch(ctx);
        if maker_slice > Decimal::ZERO {
            batch.push(LedgerOp::Release {
                holder: Holder::Account(maker),
                asset: ctx.quote,
                amount: maker_slice,
            });
        }

        let free = self.state.vault.available(Holder::Account(maker), ctx.quote) + maker_slice - fees.maker_charge();
        let delta = taker_side.sign() * quantity;
        self.position_leg(ctx, maker, -delta, price, FillAuthority::Maker { free }, &mut batch)?;
        self.position_leg(ctx, taker, delta, price, FillAuthority::Trade, &mut batch)?;
        batch.charge_fees(taker, maker, fees);

        self.commit_batch(&batch.ops, ctx.quote, true)
    }

    // 2.2: spot fill. buyer's quote for seller's base, both delivered to
    // available, fees in quote. the seller pays its fee out of the proceeds.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn settle_spot_fill(
        &mut self,
        base: AssetId,
        quote: AssetId,
        taker: AccountId,
        taker_side: Side,
        maker: AccountId,
        maker_slice: (AssetId, Decimal),
        price: Price,
        quantity: Decimal,
        fees: &FillFees,
    ) -> Result<(), EngineError> {
        let (buyer, seller) = match taker_side {
            Side::Buy => (taker, maker),
            Side::Sell => (maker, taker),
        };
        let notional = quantity * price.value();
        let buyer_fee = if buyer == taker { fees.taker_fee } else { fees.maker_charge() };
        let seller_fee = if seller == taker { fees.taker_fee } else { fees.maker_charge() };

        let mut ops = Vec::new();
        let (slice_asset, slice) = maker_slice;
        if slice > Decimal::ZERO {
            ops.push(LedgerOp::Release {
                holder: Holder::Account(maker),
                asset: slice_asset,
                amount: slice,
            });
        }
        ops.push(LedgerOp::Lock {
            holder: Holder::Account(buyer),
            asset: quote,
            amount: notional + buyer_fee,
        });
        ops.push(LedgerOp::Lock {
            holder: Holder::Account(seller),
            asset: base,
            amount: quantity,
        });
        ops.push(LedgerOp::TransferLocked {
            from: Holder::Account(seller),
            to: Holder::Account(buyer),
            asset: base,
            amount: quantity,
            into: Bucket::Available,
        });
        ops.push(LedgerOp::TransferLocked {
            from: Holder::Account(buyer),
            to: Holder::Account(seller),
            asset: quote,
            amount: notional,
            into: Bucket::Locked,
        });

        // taker fee out of the taker's locked quote, rebate to the maker
        ops.push(LedgerOp::RouteFee {
            payer: Holder::Account(taker),
            asset: quote,
            amount: fees.taker_routed(),
        });
        if fees.maker_rebate() > Decimal::ZERO {
            ops.push(LedgerOp::TransferLocked {
                from: Holder::Account(taker),
                to: Holder::Account(maker),
                asset: quote,
                amount: fees.maker_rebate(),
                into: Bucket::Available,
            });
        }
        ops.push(LedgerOp::RouteFee {
            payer: Holder::Account(maker),
            asset: quote,
            amount: fees.maker_charge(),
        });

        ops.push(LedgerOp::Release {
            holder: Holder::Account(seller),
            asset: quote,
            amount: notional - seller_fee,
        });

        self.commit_batch(&ops, quote, false)
    }

    pub(super) fn risk_before(
        &self,
        account_id: AccountId,
        market_id: MarketId,
        passive: bool,
    ) -> Result<RiskBefore, EngineError> {
        let size = self
            .position(account_id, market_id)
            .map(|p| p.size)
            .unwrap_or_default();
        Ok(RiskBefore {
            account: account_id,
            size,
            health: self.margin_snapshot(account_id, market_id)?.health(),
            passive,
        })
    }

    pub(super) fn ensure_margin(&self, before: &RiskBefore, market_id: MarketId) -> Result<(), EngineError> {
        let after = self.margin_snapshot(before.account, market_id)?;
        let size = self
            .position(before.account, market_id)
            .map(|p| p.size)
            .unwrap_or_default();

        if !margin_holds(before, size, &after) {
            let required = if after.is_liquidatable() { after.maintenance } else { after.initial };
            return Err(EngineError::InsufficientMargin {
                account: before.account,
                required: required.value(),
                available: after.equity.value(),
            });
        }
        Ok(())
    }

    /// Resting orders in `plan` whose makers cannot carry their fills: after
    /// posting everything they have free they would still fail the margin check.
    pub(super) fn unfunded_maker_orders(
        &self,
        market_id: MarketId,
        taker_side: Side,
        plan: &FillPlan,
    ) -> Result<Vec<OrderId>, EngineError> {
        let ctx = self.market_ctx(market_id)?;
        let mut makers: Vec<AccountId> = plan.fills.iter().map(|f| f.maker).collect();
        makers.sort();
        makers.dedup();

        let mut unfunded = Vec::new();
        for maker in makers {
            let fills: Vec<&PlannedFill> = plan.fills.iter().filter(|f| f.maker == maker).collect();
            if !self.maker_can_carry(&ctx, maker, taker_side, &fills)? {
                unfunded.extend(fills.iter().map(|f| f.maker_order_id));
            }
        }
        Ok(unfunded)
    }

    // replays the maker's fills on a copy of its account, the way position_leg
    // and charge_fees will
    fn maker_can_carry(
        &self,
        ctx: &MarketCtx,
        maker: AccountId,
        taker_side: Side,
        fills: &[&PlannedFill],
    ) -> Result<bool, EngineError> {
        let Some(first) = fills.first() else {
            return Ok(true);
        };
        let now = self.current_time;
        let before = self.risk_before(maker, ctx.id, true)?;
        let market = self.market_ref(ctx.id)?;
        let mut account = self.account_ref(maker)?.clone();
        let mut position = account
            .get_position(ctx.id)
            .cloned()
            .unwrap_or_else(|| Position::new(maker, ctx.id, first.price, ctx.funding_index, now));
        position.settle_funding(ctx.funding_index);

        let mut free = self.state.vault.available(Holder::Account(maker), ctx.quote);
        for fill in fills {
            let slice = market
                .order_book
                .get(fill.maker_order_id)
                .map(|o| o.lock_slice(fill.quantity))
                .unwrap_or_default();
            let fees = FillFees::compute(fill.quantity * fill.price.value(), &market.config.fee_config);
            free += slice - fees.maker_charge();

            let delta = -(taker_side.sign() * fill.quantity);
            let outcome = position.apply_fill(delta, fill.price, ClosedMargin::Released, now);
            if outcome.opened > Decimal::ZERO {
                let shortfall = position_snapshot(&position, &ctx.view()).initial_shortfall().value();
                let posted = shortfall.min(free.max(Decimal::ZERO));
                free -= posted;
                position.locked_margin = position.locked_margin.add(Quote::new(posted));
            }
            // an isolated close beyond its claim is paid from free quote only
            if outcome.released.is_negative() && !account.is_cross() && outcome.released.abs().value() > free {
                return Ok(false);
            }
            free += outcome.released.value();
        }

        let size = position.size;
        let after = if account.is_cross() {
            account.set_position(position);
            calculate_account_metrics(&account, &self.views(), ctx.quote).snapshot
        } else {
            position_snapshot(&position, &ctx.view())
        };
        Ok(margin_holds(&before, size, &after))
    }

    /// Escrow a resting order locks: IM plus the maker fee reserve in quote for
    /// derivatives, the full cost (bids) or the base (asks) for spot.
    pub(super) fn order_escrow(
        &self,
        market_id: MarketId,
        side: Side,
        price: Price,
        quantity: Decimal,
    ) -> Result<(AssetId, Decimal), EngineError> {
        let market = self.market_ref(market_id)?;
        let config = &market.config;
        let notional = config.notional(quantity, price)?;
        let fee_reserve = notional * config.fee_config.maker_reserve_rate();
        let overflow = || MarketError::NotionalOverflow { size: quantity, price };

        if config.kind.is_spot() {
            return Ok(match side {
                Side::Buy => (config.quote_asset, notional.checked_add(fee_reserve).ok_or_else(overflow)?),
                Side::Sell => (config.base_asset, quantity),
            });
        }

        let margin = match (&config.kind, side) {
            // a long option needs its premium
            (InstrumentKind::Option { .. }, Side::Buy) => notional,
            (InstrumentKind::Option { .. }, Side::Sell) => {
                let mark = market
                    .effective_mark_price()
                    .ok_or(EngineError::NoMarkPrice(market_id))?;
                position_requirement(
                    &config.kind,
                    SignedSize::from_side(side, quantity),
                    mark,
                    false,
                    &config.margin_params,
                )
                .initial
                .value()
            }
            _ => position_requirement(
                &config.kind,
                SignedSize::from_side(side, quantity),
                price,
                false,
                &config.margin_params,
            )
            .initial
            .value(),
        };
        let escrow = margin.checked_add(fee_reserve).ok_or_else(overflow)?;
        Ok((config.quote_asset, escrow))
    }
}

// 12.4: a position open when the barrier was touched is latched for good
pub(super) fn latch_barrier(position: &mut Position, last_touch: Option<Timestamp>) {
    if !position.is_empty() && last_touch.is_some_and(|touch| touch >= position.opened_at) {
        position.barrier_touched = true;
    }
}
