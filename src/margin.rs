//! Margin requirements and health factor.
//!
//! Initial margin (IM) is what a position must be funded to after any change
//! that adds risk, and what liquidation restores it to. Maintenance margin (MM)
//! is the floor; health factor = equity / MM and a position is liquidatable
//! below 1. Leverage tiers raise the IM rate as notional grows.
//!
//! Long options are fully paid: the initial requirement is their own value and
//! there is no maintenance requirement, so they are never liquidated. Short
//! options are margined on underlying notional like futures.

use crate::instrument::InstrumentKind;
use crate::types::{Leverage, Price, Quote, SignedSize};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginParams {
    pub initial_margin_rate: Decimal,
    pub maintenance_margin_rate: Decimal,
    pub max_leverage: Leverage,
    pub leverage_tiers: Vec<LeverageTier>,
}

impl Default for MarginParams {
    fn default() -> Self {
        Self {
            initial_margin_rate: dec!(0.10),
            maintenance_margin_rate: dec!(0.05),
            max_leverage: Leverage::whole(10),
            leverage_tiers: vec![
                LeverageTier {
                    max_notional: Quote::new(dec!(1_000_000)),
                    max_leverage: Leverage::whole(10),
                },
                LeverageTier {
                    max_notional: Quote::new(dec!(5_000_000)),
                    max_leverage: Leverage::whole(5),
                },
                LeverageTier {
                    max_notional: Quote::new(dec!(20_000_000)),
                    max_leverage: Leverage::whole(2),
                },
            ],
        }
    }
}

impl MarginParams {
    /// Flat rates with no tiers.
    pub fn flat(initial_margin_rate: Decimal, maintenance_margin_rate: Decimal) -> Self {
        let max_leverage = Leverage::new(Decimal::ONE / initial_margin_rate).unwrap_or(Leverage::whole(1));
        Self {
            initial_margin_rate,
            maintenance_margin_rate,
            max_leverage,
            leverage_tiers: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.maintenance_margin_rate <= Decimal::ZERO {
            return Err("maintenance margin rate must be positive".to_string());
        }
        if self.initial_margin_rate <= self.maintenance_margin_rate {
            return Err("initial margin rate must exceed maintenance rate".to_string());
        }
        if self.initial_margin_rate > Decimal::ONE {
            return Err("initial margin rate above 100%".to_string());
        }
        let ascending = self
            .leverage_tiers
            .windows(2)
            .all(|w| w[0].max_notional < w[1].max_notional);
        if !ascending {
            return Err("leverage tiers must be sorted by notional".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeverageTier {
    pub max_notional: Quote,
    pub max_leverage: Leverage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarginRequirement {
    pub initial: Quote,
    pub maintenance: Quote,
}

pub fn notional_value(size: SignedSize, price: Price) -> Quote {
    Quote::new(size.abs() * price.value())
}

pub fn effective_max_leverage(notional: Quote, params: &MarginParams) -> Leverage {
    for tier in &params.leverage_tiers {
        if notional <= tier.max_notional {
            return tier.max_leverage;
        }
    }
    params
        .leverage_tiers
        .last()
        .map(|t| t.max_leverage)
        .unwrap_or(params.max_leverage)
}

// 3.1: IM rate for a notional. the stricter of the flat rate and the tier/cap leverage.
pub fn initial_rate(notional: Quote, leverage_cap: Leverage, params: &MarginParams) -> Decimal {
    let tier = effective_max_leverage(notional, params);
    let leverage = if tier.value() < leverage_cap.value() {
        tier
    } else {
        leverage_cap
    };
    params.initial_margin_rate.max(leverage.initial_margin_fraction())
}

pub fn required_margin(notional: Quote, leverage_cap: Leverage, params: &MarginParams) -> Quote {
    notional.mul(initial_rate(notional, leverage_cap, params))
}

// 3.2: requirement for one position at the current underlying mark
pub fn position_requirement(
    kind: &InstrumentKind,
    size: SignedSize,
    underlying_mark: Price,
    barrier_touched: bool,
    params: &MarginParams,
) -> MarginRequirement {
    if size.is_zero() {
        return MarginRequirement::default();
    }
    match kind {
        InstrumentKind::Spot => MarginRequirement::default(),
        InstrumentKind::Option { .. } if size.is_long() => {
            let value = Quote::new(size.abs() * kind.value_at(underlying_mark, barrier_touched));
            MarginRequirement {
                initial: value,
                maintenance: Quote::zero(),
            }
        }
        _ => {
            let notional = notional_value(size, underlying_mark);
            MarginRequirement {
                initial: required_margin(notional, params.max_leverage, params),
                maintenance: notional.mul(params.maintenance_margin_rate),
            }
        }
    }
}

pub fn health_factor(equity: Quote, maintenance: Quote) -> Decimal {
    if maintenance.value() <= Decimal::ZERO {
        return Decimal::MAX;
    }
    equity.value() / maintenance.value()
}

/// Aggregated equity and requirements. One position for isolated margin, every
/// cross position sharing a quote asset for cross margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarginSnapshot {
    pub equity: Quote,
    pub initial: Quote,
    pub maintenance: Quote,
}

impl MarginSnapshot {
    pub fn new(equity: Quote, requirement: MarginRequirement) -> Self {
        Self {
            equity,
            initial: requirement.initial,
            maintenance: requirement.maintenance,
        }
    }

    pub fn combine(&self, other: &MarginSnapshot) -> MarginSnapshot {
        MarginSnapshot {
            equity: self.equity.add(other.equity),
            initial: self.initial.add(other.initial),
            maintenance: self.maintenance.add(other.maintenance),
        }
    }

    pub fn health(&self) -> Decimal {
        health_factor(self.equity, self.maintenance)
    }

    pub fn is_liquidatable(&self) -> bool {
        self.maintenance.is_positive() && self.equity < self.maintenance
    }

    pub fn meets_initial(&self) -> bool {
        self.equity >= self.initial
    }

    /// Margin that must be added to reach IM.
    pub fn initial_shortfall(&self) -> Quote {
        self.initial.sub(self.equity).max_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::OptionType;
    use crate::types::Timestamp;
    use rust_decimal_macros::dec;

    fn px(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    #[test]
    fn notional_calculation() {
        let notional = notional_value(SignedSize::new(dec!(-2)), px(dec!(50000)));
        assert_eq!(notional.value(), dec!(100000));
    }

    #[test]
    fn flat_rates_for_futures() {
        let params = MarginParams::flat(dec!(0.1), dec!(0.05));
        let req = position_requirement(
            &InstrumentKind::Perpetual,
            SignedSize::new(dec!(100)),
            px(dec!(100)),
            false,
            &params,
        );
        assert_eq!(req.initial.value(), dec!(1000));
        assert_eq!(req.maintenance.value(), dec!(500));
    }

    #[test]
    fn tiers_raise_initial_rate() {
        let params = MarginParams::default();
        // 2M notional falls in the 5x tier
        let im = required_margin(Quote::new(dec!(2_000_000)), params.max_leverage, &params);
        assert_eq!(im.value(), dec!(400_000));
        // small notional stays on the flat 10%
        let im = required_margin(Quote::new(dec!(10_000)), params.max_leverage, &params);
        assert_eq!(im.value(), dec!(1_000));
    }

    #[test]
    fn long_option_requirement_is_its_value() {
        let call = InstrumentKind::Option {
            expiry: Timestamp::from_millis(1),
            strike: px(dec!(100)),
            option_type: OptionType::Call,
            barrier: None,
        };
        let params = MarginParams::default();
        let long = position_requirement(&call, SignedSize::new(dec!(2)), px(dec!(130)), false, &params);
        assert_eq!(long.initial.value(), dec!(60));
        assert!(long.maintenance.is_zero());

        let short = position_requirement(&call, SignedSize::new(dec!(-2)), px(dec!(130)), false, &params);
        assert_eq!(short.maintenance.value(), dec!(13));
        assert_eq!(short.initial.value(), dec!(26));
    }

    #[test]
    fn health_factor_values() {
        assert_eq!(health_factor(Quote::new(dec!(450)), Quote::new(dec!(500))), dec!(0.9));
        assert_eq!(health_factor(Quote::new(dec!(1)), Quote::zero()), Decimal::MAX);
    }

    #[test]
    fn snapshot_combines_for_cross() {
        let a = MarginSnapshot {
            equity: Quote::new(dec!(300)),
            initial: Quote::new(dec!(200)),
            maintenance: Quote::new(dec!(100)),
        };
        let b = MarginSnapshot {
            equity: Quote::new(dec!(-50)),
            initial: Quote::new(dec!(200)),
            maintenance: Quote::new(dec!(100)),
        };
        let total = a.combine(&b);
        assert_eq!(total.health(), dec!(1.25));
        assert!(!total.is_liquidatable());
        assert!(b.is_liquidatable());
        assert_eq!(total.initial_shortfall().value(), dec!(150));
    }

    #[test]
    fn params_validation() {
        assert!(MarginParams::default().validate().is_ok());
        assert!(MarginParams::flat(dec!(0.05), dec!(0.05)).validate().is_err());
    }
}
