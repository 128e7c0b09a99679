//! Funding accrual and settlement for perpetual markets.

use super::core::Engine;
use super::results::{EngineError, FundingResult};
use crate::events::{EventPayload, FundingAccruedEvent};
use crate::fees::FeeRouter;
use crate::funding::{accrue_funding_state, elapsed_periods};
use crate::oracle::PriceOracle;
use crate::types::{AccountId, MarketId, Quote};
use tracing::info;

impl<O: PriceOracle, R: FeeRouter> Engine<O, R> {
    /// Accrue every whole funding period elapsed since the last update.
    ///
    /// A no-op for non-perpetual markets and when less than one period has
    /// passed, so calling it twice in a row changes nothing the second time.
    pub fn accrue_funding(&mut self, market_id: MarketId) -> Result<FundingResult, EngineError> {
        self.transaction(|engine| engine.accrue_market_funding(market_id))
    }

    pub(super) fn accrue_market_funding(&mut self, market_id: MarketId) -> Result<FundingResult, EngineError> {
        let now = self.current_time;
        let market = self.market_ref(market_id)?;
        let idle = FundingResult {
            market_id,
            periods: 0,
            funding_rate: market.funding_state.current_rate,
            cumulative_index: market.funding_state.cumulative_index,
            last_update: market.funding_state.last_update,
        };
        if !market.config.kind.is_perpetual() || market.is_settled() {
            return Ok(idle);
        }
        if elapsed_periods(&market.funding_state, now, &market.config.funding_params) == 0 {
            return Ok(idle);
        }

        // 5.5: rate comes from a fresh mark/index pair
        self.refresh_market_prices(market_id)?;
        let market = self.market_mut(market_id)?;
        let (Some(mark), Some(index)) = (market.mark_price, market.index_price) else {
            return Err(EngineError::NoMarkPrice(market_id));
        };
        let params = market.config.funding_params.clone();
        let Some(accrual) = accrue_funding_state(&mut market.funding_state, mark, index, now, &params) else {
            return Ok(idle);
        };
        let last_update = market.funding_state.last_update;

        info!(
            market = market_id.0,
            periods = accrual.periods,
            rate = %accrual.rate,
            index = %accrual.new_index,
            "funding accrued"
        );
        self.emit(EventPayload::FundingAccrued(FundingAccruedEvent {
            market_id,
            periods: accrual.periods,
            funding_rate: accrual.rate,
            cumulative_index: accrual.new_index,
        }));

        Ok(FundingResult {
            market_id,
            periods: accrual.periods,
            funding_rate: accrual.rate,
            cumulative_index: accrual.new_index,
            last_update,
        })
    }

    /// Realize a position's pending funding into its margin claim. Returns what
    /// the position paid (negative = received).
    pub fn settle_funding(&mut self, account_id: AccountId, market_id: MarketId) -> Result<Quote, EngineError> {
        self.transaction(|engine| {
            let index = engine.market_ref(market_id)?.funding_state.cumulative_index;
            engine.account_ref(account_id)?;
            engine.settle_position_funding(account_id, market_id, index)
        })
    }
}
