// 5.0: funding rates. every period longs pay shorts or vice versa to keep the perp near the index.
// 5.0 has the params/state structs. 5.1 has the rate calculation logic, 5.4 the accrual step.
// accrual only moves the cumulative index; positions settle lazily against it on touch.

use crate::types::{Price, Quote, SignedSize, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingParams {
    pub max_rate: Decimal,
    pub interest_rate: Decimal,
    pub period_ms: i64,
    pub dampening_factor: Decimal,
}

impl Default for FundingParams {
    fn default() -> Self {
        Self {
            max_rate: dec!(0.01),
            interest_rate: dec!(0.0001),
            period_ms: 8 * 3_600_000,
            dampening_factor: dec!(0.5),
        }
    }
}

impl FundingParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.period_ms <= 0 {
            return Err("funding period must be positive".to_string());
        }
        if self.max_rate < Decimal::ZERO {
            return Err("max funding rate must not be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingState {
    pub current_rate: Decimal,
    /// Cumulative funding paid per unit of long exposure since market creation.
    pub cumulative_index: Decimal,
    pub last_update: Timestamp,
}

impl FundingState {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            current_rate: Decimal::ZERO,
            cumulative_index: Decimal::ZERO,
            last_update: timestamp,
        }
    }
}

// 5.1: how far perp is from spot. positive = perp above spot
pub fn calculate_premium_index(mark_price: Price, index_price: Price) -> Decimal {
    (mark_price.value() - index_price.value()) / index_price.value()
}

// 5.2: dampens and clamps the rate to prevent wild swings
pub fn calculate_funding_rate(premium_index: Decimal, params: &FundingParams) -> Decimal {
    let dampened_premium = premium_index * params.dampening_factor;
    let rate = dampened_premium + params.interest_rate;
    rate.max(-params.max_rate).min(params.max_rate)
}

// 5.3: how much you pay/receive for one period. size * price * rate
pub fn calculate_funding_payment(position_size: SignedSize, mark_price: Price, funding_rate: Decimal) -> Quote {
    let payment = position_size.value() * mark_price.value() * funding_rate;
    Quote::new(payment)
}

pub fn calculate_funding_from_cumulative(
    position_size: SignedSize,
    entry_cumulative: Decimal,
    current_cumulative: Decimal,
) -> Quote {
    let funding_delta = current_cumulative - entry_cumulative;
    Quote::new(position_size.value() * funding_delta)
}

/// One accrual step over whole elapsed periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingAccrual {
    pub periods: i64,
    pub rate: Decimal,
    pub index_delta: Decimal,
    pub new_index: Decimal,
}

pub fn elapsed_periods(state: &FundingState, now: Timestamp, params: &FundingParams) -> i64 {
    if params.period_ms <= 0 {
        return 0;
    }
    let elapsed = now.as_millis() - state.last_update.as_millis();
    if elapsed <= 0 {
        return 0;
    }
    elapsed / params.period_ms
}

// 5.4: every whole period since the last update accrues rate * mark. a partial
// period stays pending: last_update moves by whole periods only, so the
// remainder counts towards the next one.
pub fn accrue_funding_state(
    state: &mut FundingState,
    mark_price: Price,
    index_price: Price,
    now: Timestamp,
    params: &FundingParams,
) -> Option<FundingAccrual> {
    let periods = elapsed_periods(state, now, params);
    if periods == 0 {
        return None;
    }

    let premium = calculate_premium_index(mark_price, index_price);
    let rate = calculate_funding_rate(premium, params);
    let index_delta = Decimal::from(periods) * rate * mark_price.value();

    state.cumulative_index += index_delta;
    state.current_rate = rate;
    state.last_update = state.last_update.plus_millis(periods * params.period_ms);

    Some(FundingAccrual {
        periods,
        rate,
        index_delta,
        new_index: state.cumulative_index,
    })
}

pub fn annualized_funding_rate(period_rate: Decimal, params: &FundingParams) -> Decimal {
    let periods_per_year = Decimal::from(365 * 24 * 3_600_000_i64) / Decimal::from(params.period_ms.max(1));
    period_rate * periods_per_year
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn px(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    #[test]
    fn premium_index_both_ways() {
        assert_eq!(calculate_premium_index(px(dec!(50500)), px(dec!(50000))), dec!(0.01));
        assert_eq!(calculate_premium_index(px(dec!(49500)), px(dec!(50000))), dec!(-0.01));
    }

    #[test]
    fn funding_rate_with_dampening() {
        let params = FundingParams::default();
        // 0.02 * 0.5 + 0.0001 = 0.0101, clamped to 0.01
        assert_eq!(calculate_funding_rate(dec!(0.02), &params), dec!(0.01));
        // 0.001 * 0.5 + 0.0001
        assert_eq!(calculate_funding_rate(dec!(0.001), &params), dec!(0.0006));
        assert_eq!(calculate_funding_rate(dec!(-0.5), &params), dec!(-0.01));
    }

    #[test]
    fn funding_payment_signs() {
        let price = px(dec!(50000));
        assert_eq!(
            calculate_funding_payment(SignedSize::new(dec!(1)), price, dec!(0.001)).value(),
            dec!(50)
        );
        assert_eq!(
            calculate_funding_payment(SignedSize::new(dec!(-1)), price, dec!(0.001)).value(),
            dec!(-50)
        );
    }

    #[test]
    fn cumulative_funding_tracking() {
        let payment = calculate_funding_from_cumulative(SignedSize::new(dec!(1)), dec!(100), dec!(150));
        assert_eq!(payment.value(), dec!(50));
    }

    #[test]
    fn no_accrual_inside_a_period() {
        let params = FundingParams::default();
        let mut state = FundingState::new(Timestamp::from_millis(0));
        let now = Timestamp::from_millis(params.period_ms - 1);
        assert!(accrue_funding_state(&mut state, px(dec!(100)), px(dec!(100)), now, &params).is_none());
        assert_eq!(state, FundingState::new(Timestamp::from_millis(0)));
    }

    #[test]
    fn accrues_whole_periods_and_keeps_remainder() {
        let params = FundingParams::default();
        let mut state = FundingState::new(Timestamp::from_millis(0));
        let now = Timestamp::from_millis(5 * params.period_ms + 1_000);

        let accrual = accrue_funding_state(&mut state, px(dec!(100)), px(dec!(100)), now, &params).unwrap();
        assert_eq!(accrual.periods, 5);
        // zero premium: interest only. 5 * 0.0001 * 100
        assert_eq!(accrual.index_delta, dec!(0.05));
        assert_eq!(state.cumulative_index, dec!(0.05));
        assert_eq!(state.last_update, Timestamp::from_millis(5 * params.period_ms));
    }

    #[test]
    fn annualized_rate() {
        // 0.1% per 8h, three periods a day
        assert_eq!(annualized_funding_rate(dec!(0.001), &FundingParams::default()), dec!(1.095));
    }
}
