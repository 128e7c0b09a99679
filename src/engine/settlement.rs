//! Expiry settlement of dated markets.

use super::core::Engine;
use super::positions::{latch_barrier, LegBatch};
use super::results::{EngineError, SettlementResult};
use crate::events::{
    CancelReason, EventPayload, InsuranceFundUsedEvent, MarketSettledEvent, MarketStatusChangedEvent, OrderCancelledEvent,
};
use crate::fees::FeeRouter;
use crate::market::MarketStatus;
use crate::oracle::{validate_reading, PriceOracle};
use crate::settlement::{plan_settlement, settlement_price_from_samples};
use crate::types::{AccountId, MarketId, Quote, SignedSize};
use crate::vault::{Holder, LedgerOp};
use rust_decimal::Decimal;
use tracing::info;

impl<O: PriceOracle, R: FeeRouter> Engine<O, R> {
    /// Cash-settle a dated market at or after expiry.
    ///
    /// Every resting order is released and every position closes at its payoff
    /// against the settlement price. Calling it on a perpetual or spot market,
    /// before expiry or a second time does nothing.
    pub fn settle_expired(&mut self, market_id: MarketId) -> Result<SettlementResult, EngineError> {
        self.transaction(|engine| engine.execute_settlement(market_id))
    }

    fn execute_settlement(&mut self, market_id: MarketId) -> Result<SettlementResult, EngineError> {
        let now = self.current_time;
        let market = self.market_ref(market_id)?;
        let Some(expiry) = market.config.kind.expiry() else {
            return Ok(SettlementResult::noop(market_id, None));
        };
        if market.is_settled() {
            return Ok(SettlementResult::noop(market_id, market.settlement_price));
        }
        if now < expiry {
            return Ok(SettlementResult::noop(market_id, None));
        }

        // 9.3: TWAP of the window, or one fresh reading if nothing was sampled
        let price = match settlement_price_from_samples(&market.settlement_samples, expiry) {
            Some(price) => price,
            None => {
                let base = market.config.base_asset;
                validate_reading(base, self.oracle.get_price(base), now, &self.config.oracle)?.0
            }
        };

        let market = self.market_mut(market_id)?;
        let old_status = market.status;
        market.status = MarketStatus::Settled;
        market.settlement_price = Some(price);
        market.mark_price = Some(price);
        let kind = market.config.kind.clone();
        let quote = market.config.quote_asset;
        let funding_index = market.funding_state.cumulative_index;
        let last_touch = market.last_barrier_touch;
        let order_ids = market.order_book.order_ids();
        self.emit(EventPayload::MarketStatusChanged(MarketStatusChangedEvent {
            market_id,
            old_status,
            new_status: MarketStatus::Settled,
        }));

        for order_id in &order_ids {
            let Some(owner) = self.market_ref(market_id)?.order_book.get(*order_id).map(|o| o.owner) else {
                continue;
            };
            let released = self.release_order(market_id, *order_id)?;
            self.emit(EventPayload::OrderCancelled(OrderCancelledEvent {
                market_id,
                order_id: *order_id,
                account_id: owner,
                released,
                reason: CancelReason::MarketSettled,
            }));
        }

        // 9.4: equity of every position at its payoff
        let holders: Vec<AccountId> = self
            .state
            .accounts
            .values()
            .filter(|a| a.get_position(market_id).is_some())
            .map(|a| a.id)
            .collect();
        let mut equities = Vec::with_capacity(holders.len());
        for account_id in &holders {
            self.settle_position_funding(*account_id, market_id, funding_index)?;
            if let Some(position) = self.account_mut(*account_id)?.get_position_mut(market_id) {
                latch_barrier(position, last_touch);
                let payoff = kind.value_at(price, position.barrier_touched);
                equities.push((*account_id, position.equity(payoff, funding_index)));
            }
        }

        let insurance_balance = self.insurance_balance(market_id);
        let plan = plan_settlement(&equities, insurance_balance);
        let mut batch = LegBatch::new(market_id, quote, self.clearing_balance(market_id));

        if plan.insurance_used.is_positive() {
            batch.push(LedgerOp::Lock {
                holder: Holder::Insurance(market_id),
                asset: quote,
                amount: plan.insurance_used.value(),
            });
            batch.pool_in(Holder::Insurance(market_id), plan.insurance_used.value());
            self.emit(EventPayload::InsuranceFundUsed(InsuranceFundUsedEvent {
                market_id,
                account_id: None,
                amount: plan.insurance_used,
                remaining_balance: insurance_balance - plan.insurance_used.value(),
            }));
        }

        // a socialized deficit from earlier liquidations is already missing from
        // the pool; winners absorb it on top of the plan's haircut
        let owed = plan.total_payout().value();
        let scale = if owed > batch.pool() && owed > Decimal::ZERO {
            batch.pool() / owed
        } else {
            Decimal::ONE
        };
        let mut paid = Decimal::ZERO;
        for leg in &plan.legs {
            paid += batch.pay_out(Holder::Account(leg.account_id), leg.payout.value() * scale);
        }
        let haircut = plan.haircut.add(Quote::new(owed - paid));

        // rounding dust left in the pool goes to insurance
        let dust = batch.pool();
        batch.pay_out(Holder::Insurance(market_id), dust);
        self.commit_batch(&batch.ops, quote, false)?;

        for account_id in &holders {
            if let Some(position) = self.account_mut(*account_id)?.remove_position(market_id) {
                self.market_mut(market_id)?
                    .apply_position_change(position.size, SignedSize::zero());
            }
        }
        let market = self.market_mut(market_id)?;
        market.socialized_deficit = Quote::zero();

        info!(
            market = market_id.0,
            price = %price,
            positions = holders.len(),
            orders = order_ids.len(),
            haircut = %haircut,
            "market settled"
        );
        self.emit(EventPayload::MarketSettled(MarketSettledEvent {
            market_id,
            settlement_price: price,
            positions_closed: holders.len(),
            orders_released: order_ids.len(),
            insurance_used: plan.insurance_used,
            haircut,
        }));

        Ok(SettlementResult {
            market_id,
            settled: true,
            settlement_price: Some(price),
            positions_closed: holders.len(),
            orders_released: order_ids.len(),
            insurance_used: plan.insurance_used,
            haircut,
        })
    }
}
