//! Liquidation, insurance and auto-deleveraging.
//!
//! A liquidator takes over an unhealthy position at the mark and posts initial
//! margin for it. A healthy-enough account is only cut back until it meets IM
//! again; one that cannot be rescued is closed in full. If the closed position
//! leaves a hole, cross claims and then the market's insurance fund fill it;
//! anything left is closed against profitable opposite positions at the
//! bankruptcy price, and only what even that cannot absorb is socialized.

use super::core::Engine;
use super::positions::{FillAuthority, LegBatch, MarketCtx};
use super::results::{EngineError, LiquidationResult};
use crate::account::position_snapshot;
use crate::adl::{bankruptcy_fill_price, plan_adl, rank_adl_candidates};
use crate::events::{
    AutoDeleveragedEvent, EventPayload, InsolvencyDetectedEvent, InsuranceFundUsedEvent, PositionLiquidatedEvent,
};
use crate::fees::FeeRouter;
use crate::instrument::InstrumentKind;
use crate::liquidation::{
    bankruptcy_value, cap_to_repay, insurance_cover, liquidation_size, split_penalty, LiquidationTicket, PenaltySplit,
    RiskState, SizingInput,
};
use crate::oracle::PriceOracle;
use crate::types::{AccountId, MarketId, Price, Quote};
use crate::vault::{Holder, LedgerOp};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use tracing::{info, warn};

/// How the tail of a fully closed position was settled.
#[derive(Debug, Clone, Copy, Default)]
struct CloseOut {
    insurance_used: Quote,
    socialized: Quote,
}

impl<O: PriceOracle, R: FeeRouter> Engine<O, R> {
    /// Liquidate `account`'s position in `market_id`. `max_repay` caps the
    /// notional the liquidator takes on in a partial liquidation.
    pub fn liquidate(
        &mut self,
        liquidator: AccountId,
        account: AccountId,
        market_id: MarketId,
        max_repay: Option<Quote>,
    ) -> Result<LiquidationResult, EngineError> {
        self.transaction(|engine| engine.execute_liquidation(liquidator, account, market_id, max_repay))
    }

    /// Accounts whose position in `market_id` is liquidatable at the stored mark.
    pub fn liquidation_candidates(&self, market_id: MarketId) -> Vec<(AccountId, Decimal)> {
        self.state
            .accounts
            .values()
            .filter(|a| a.get_position(market_id).is_some_and(|p| !p.is_empty()))
            .filter_map(|a| {
                let snapshot = self.margin_snapshot(a.id, market_id).ok()?;
                snapshot.is_liquidatable().then(|| (a.id, snapshot.health()))
            })
            .collect()
    }

    fn execute_liquidation(
        &mut self,
        liquidator: AccountId,
        account: AccountId,
        market_id: MarketId,
        max_repay: Option<Quote>,
    ) -> Result<LiquidationResult, EngineError> {
        let now = self.current_time;
        let market = self.market_ref(market_id)?;
        if market.is_settled() || market.is_expired(now) {
            return Err(EngineError::MarketExpired(market_id));
        }
        if market.config.kind.is_spot() {
            return Err(EngineError::InvalidOrder("spot markets carry no positions".to_string()));
        }
        let params = market.config.liquidation_params.clone();
        self.account_ref(account)?;
        self.account_ref(liquidator)?;
        if liquidator == account {
            return Err(EngineError::InvalidOrder("an account cannot liquidate itself".to_string()));
        }

        // 6.0: trigger check at a fresh mark
        self.refresh_market_prices(market_id)?;
        let ctx = self.market_ctx(market_id)?;
        self.settle_position_funding(account, market_id, ctx.funding_index)?;

        let Some(position) = self.position(account, market_id).filter(|p| !p.is_empty()).cloned() else {
            return Err(EngineError::AlreadyHealthy {
                account,
                health: Decimal::MAX,
            });
        };
        let snapshot = self.margin_snapshot(account, market_id)?;
        if !snapshot.is_liquidatable() {
            return Err(EngineError::AlreadyHealthy {
                account,
                health: snapshot.health(),
            });
        }
        let health_at_trigger = snapshot.health();
        let liquidator_before = self.risk_before(liquidator, market_id, false)?;

        // 6.2: sizing
        let size = position.size.abs();
        let sign = position.size.value().signum();
        let unit_value = ctx.unit_value(&position);
        let own = position_snapshot(&position, &ctx.view());
        let basis = match ctx.kind {
            InstrumentKind::Option { .. } if position.size.is_long() => unit_value,
            _ => ctx.mark.value(),
        };
        let (mut close_size, mut full_close) = liquidation_size(&SizingInput {
            equity: snapshot.equity,
            initial: snapshot.initial,
            position_size: size,
            im_per_unit: own.initial.value() / size,
            penalty_per_unit: basis * params.penalty_rate(),
            lot_size: ctx.lot,
        });
        let bankrupt = full_close && own.equity.is_negative();
        if !bankrupt {
            if let Some(cap) = max_repay {
                close_size = cap_to_repay(close_size, cap, basis, ctx.lot);
                full_close = close_size >= size;
            }
        }

        let fill_price = match ctx.kind {
            InstrumentKind::Option { .. } => bankruptcy_fill_price(unit_value, ctx.tick),
            _ => ctx.mark,
        };
        let mut batch = self.new_batch(&ctx);
        let mut result = LiquidationResult {
            ticket: LiquidationTicket {
                account,
                market_id,
                health_factor_at_trigger: health_at_trigger,
                size_to_close: close_size,
                penalty_bps: params.penalty_bps,
                full_close,
            },
            price: fill_price,
            penalty: PenaltySplit::default(),
            insurance_used: Quote::zero(),
            cross_margin_used: Quote::zero(),
            deleveraged: Vec::new(),
            liquidator_size: Decimal::ZERO,
            socialized: Quote::zero(),
            outcome: if full_close {
                RiskState::FullyLiquidated
            } else {
                RiskState::PartiallyLiquidated
            },
        };

        let insurance_balance = self.insurance_balance(market_id);
        if bankrupt {
            self.close_bankrupt(&ctx, liquidator, account, own.equity, unit_value, fill_price, &mut batch, &mut result)?;
        } else {
            // 6.3: liquidator takes `close_size` over at the mark
            self.position_leg(&ctx, account, -sign * close_size, fill_price, FillAuthority::Liquidation, &mut batch)?;
            self.position_leg(&ctx, liquidator, sign * close_size, fill_price, FillAuthority::Trade, &mut batch)?;
            result.liquidator_size = close_size;

            let equity_cap = snapshot.equity.min(own.equity);
            let penalty = split_penalty(Quote::new(close_size * basis), equity_cap, &params);
            if let Some(pos) = self.account_mut(account)?.get_position_mut(market_id) {
                pos.locked_margin = pos.locked_margin.sub(penalty.total);
            }
            batch.pay_out(Holder::Account(liquidator), penalty.liquidator.value());
            batch.pay_out(Holder::Insurance(market_id), penalty.insurance.value());
            result.penalty = penalty;

            if full_close {
                let insurance_left = insurance_balance + penalty.insurance.value();
                let close_out = self.close_out(&ctx, account, insurance_left, &mut batch)?;
                result.insurance_used = close_out.insurance_used;
                result.socialized = close_out.socialized;
            }
        }

        self.commit_batch(&batch.ops, ctx.quote, true)?;
        self.ensure_margin(&liquidator_before, market_id)?;

        info!(
            market = market_id.0,
            account = account.0,
            liquidator = liquidator.0,
            size = %close_size,
            health = %health_at_trigger,
            outcome = ?result.outcome,
            "position liquidated"
        );
        self.emit(EventPayload::PositionLiquidated(PositionLiquidatedEvent {
            market_id,
            account_id: account,
            liquidator,
            size_closed: close_size,
            price: fill_price,
            health_factor_at_trigger: health_at_trigger,
            penalty: result.penalty.total,
            outcome: result.outcome,
        }));
        Ok(result)
    }

    // 6.4: negative equity at the mark. cross claims, then insurance, then ADL at
    // the bankruptcy price; the liquidator takes what ADL could not place.
    #[allow(clippy::too_many_arguments)]
    fn close_bankrupt(
        &mut self,
        ctx: &MarketCtx,
        liquidator: AccountId,
        account: AccountId,
        equity: Quote,
        unit_value: Decimal,
        mark_fill: Price,
        batch: &mut LegBatch,
        result: &mut LiquidationResult,
    ) -> Result<(), EngineError> {
        let market_id = ctx.id;
        let deficit = equity.abs().value();
        let is_cross = self.account_ref(account)?.is_cross();

        let mut covered = Decimal::ZERO;
        if is_cross {
            covered = self.draw_cross_claims(ctx, account, deficit, batch)?;
            result.cross_margin_used = Quote::new(covered);
        }

        let insurance_balance = self.insurance_balance(market_id);
        let from_insurance = insurance_cover(Quote::new(deficit - covered), insurance_balance);
        if from_insurance.is_positive() {
            batch.push(LedgerOp::Lock {
                holder: Holder::Insurance(market_id),
                asset: ctx.quote,
                amount: from_insurance.value(),
            });
            batch.pool_in(Holder::Insurance(market_id), from_insurance.value());
            result.insurance_used = from_insurance;
            self.emit(EventPayload::InsuranceFundUsed(InsuranceFundUsedEvent {
                market_id,
                account_id: Some(account),
                amount: from_insurance,
                remaining_balance: insurance_balance - from_insurance.value(),
            }));
        }
        let injected = Quote::new(covered).add(from_insurance);
        let position = {
            let pos = self
                .account_mut(account)?
                .get_position_mut(market_id)
                .ok_or(EngineError::AlreadyHealthy {
                    account,
                    health: Decimal::MAX,
                })?;
            pos.locked_margin = pos.locked_margin.add(injected);
            pos.clone()
        };

        let size = position.size.abs();
        let sign = position.size.value().signum();
        let remaining_deficit = deficit - injected.value();
        let mut placed = Decimal::ZERO;

        if remaining_deficit > Decimal::ZERO {
            let adl_params = self.market_ref(market_id)?.config.adl_params.clone();
            let bankrupt_value = bankruptcy_value(unit_value, Quote::new(-remaining_deficit), position.size.value());
            let bankrupt_price = bankruptcy_fill_price(bankrupt_value, ctx.tick);
            let target_side = position.size.side().map(|s| s.opposite());

            let plan = match target_side {
                Some(side) => {
                    let ranked = rank_adl_candidates(
                        self.state
                            .accounts
                            .values()
                            .filter(|a| a.id != account)
                            .filter_map(|a| a.get_position(market_id).map(|p| (a.id, p))),
                        side,
                        bankrupt_value,
                        unit_value,
                    );
                    plan_adl(&ranked, size, &adl_params)
                }
                None => Vec::new(),
            };

            for (counterparty, take) in plan {
                self.position_leg(ctx, account, -sign * take, bankrupt_price, FillAuthority::Liquidation, batch)?;
                self.position_leg(ctx, counterparty, sign * take, bankrupt_price, FillAuthority::Trade, batch)?;
                placed += take;
                info!(market = market_id.0, counterparty = counterparty.0, size = %take, "auto-deleveraged");
                self.emit(EventPayload::AutoDeleveraged(AutoDeleveragedEvent {
                    market_id,
                    bankrupt_account: account,
                    counterparty,
                    size: take,
                    bankruptcy_price: bankrupt_price,
                }));
                result.deleveraged.push((counterparty, take));
            }
        }

        let rest = size - placed;
        if rest > Decimal::ZERO {
            self.position_leg(ctx, account, -sign * rest, mark_fill, FillAuthority::Liquidation, batch)?;
            self.position_leg(ctx, liquidator, sign * rest, mark_fill, FillAuthority::Trade, batch)?;
            result.liquidator_size = rest;
        }

        let insurance_left = insurance_balance - from_insurance.value();
        let close_out = self.close_out(ctx, account, insurance_left, batch)?;
        result.insurance_used = result.insurance_used.add(close_out.insurance_used);
        result.socialized = close_out.socialized;
        Ok(())
    }

    // 6.5: what is left of a fully closed claim. a surplus goes to the owner, a
    // hole goes to insurance and then to the market's socialized deficit.
    fn close_out(
        &mut self,
        ctx: &MarketCtx,
        account: AccountId,
        insurance_available: Decimal,
        batch: &mut LegBatch,
    ) -> Result<CloseOut, EngineError> {
        let market_id = ctx.id;
        let Some(position) = self.account_mut(account)?.remove_position(market_id) else {
            return Ok(CloseOut::default());
        };
        let residual = position.locked_margin;
        let mut out = CloseOut::default();

        if residual.is_positive() {
            batch.pay_out(Holder::Account(account), residual.value());
            return Ok(out);
        }
        if residual.is_zero() {
            return Ok(out);
        }

        let hole = residual.abs();
        let cover = insurance_cover(hole, insurance_available);
        if cover.is_positive() {
            batch.push(LedgerOp::Lock {
                holder: Holder::Insurance(market_id),
                asset: ctx.quote,
                amount: cover.value(),
            });
            batch.pool_in(Holder::Insurance(market_id), cover.value());
            out.insurance_used = cover;
            self.emit(EventPayload::InsuranceFundUsed(InsuranceFundUsedEvent {
                market_id,
                account_id: Some(account),
                amount: cover,
                remaining_balance: insurance_available - cover.value(),
            }));
        }

        let shortfall = hole.sub(cover);
        if shortfall.is_positive() {
            let market = self.market_mut(market_id)?;
            market.socialized_deficit = market.socialized_deficit.add(shortfall);
            out.socialized = shortfall;
            warn!(market = market_id.0, account = account.0, shortfall = %shortfall, "insolvency socialized");
            self.emit(EventPayload::InsolvencyDetected(InsolvencyDetectedEvent {
                market_id,
                account_id: account,
                shortfall,
            }));
        }
        Ok(out)
    }
}
