//! Oracle refresh: index, mark, barrier and settlement samples.

use super::core::Engine;
use super::positions::latch_barrier;
use super::results::EngineError;
use crate::events::{BarrierTouchedEvent, EventPayload, MarkPriceUpdatedEvent};
use crate::fees::FeeRouter;
use crate::mark_price::derive_mark_price;
use crate::oracle::{validate_reading, PriceOracle};
use crate::types::{MarketId, Price};
use tracing::{debug, info};

impl<O: PriceOracle, R: FeeRouter> Engine<O, R> {
    /// Pull a fresh reading for the market's underlying and update its prices.
    pub fn refresh_prices(&mut self, market_id: MarketId) -> Result<Price, EngineError> {
        self.transaction(|engine| engine.refresh_market_prices(market_id))
    }

    // 13.0: a reading that fails validation aborts the surrounding operation
    pub(super) fn refresh_market_prices(&mut self, market_id: MarketId) -> Result<Price, EngineError> {
        let now = self.current_time;
        let base = self.market_ref(market_id)?.config.base_asset;
        let (index_price, observed_at) = validate_reading(base, self.oracle.get_price(base), now, &self.config.oracle)?;

        let market = self.market_mut(market_id)?;
        let mid = market.order_book.mid_price();
        let state = derive_mark_price(
            &market.config.kind,
            market.smoothed_premium,
            index_price,
            mid,
            &market.config.mark_price_params,
        );
        market.index_price = Some(index_price);
        market.mark_price = Some(state.mark_price);
        market.smoothed_premium = state.premium_index;
        market.last_updated = now;

        let touched = market.record_barrier(observed_at, index_price);
        let last_touch = market.last_barrier_touch;
        market.record_settlement_sample(observed_at, index_price);

        debug!(
            market = market_id.0,
            index = %index_price,
            mark = %state.mark_price,
            "prices refreshed"
        );
        self.emit(EventPayload::MarkPriceUpdated(MarkPriceUpdatedEvent {
            market_id,
            index_price,
            mark_price: state.mark_price,
        }));

        if touched {
            info!(market = market_id.0, underlying = %index_price, "barrier touched");
            self.emit(EventPayload::BarrierTouched(BarrierTouchedEvent {
                market_id,
                underlying: index_price,
                at: observed_at,
            }));
        }
        if last_touch.is_some() {
            for account in self.state.accounts.values_mut() {
                if let Some(position) = account.get_position_mut(market_id) {
                    latch_barrier(position, last_touch);
                }
            }
        }

        Ok(state.mark_price)
    }
}
