//! Liquidation sizing, penalty distribution and bankruptcy math.
//!
//! A liquidation closes the smallest lot-rounded size that brings the account
//! back to its initial requirement, not merely maintenance. The liquidator takes
//! the closed size over at the mark, so the close itself does not move equity;
//! only the penalty does. That gives a closed form:
//!
//! ```text
//! E - q * pen_per_unit >= IM - q * im_per_unit
//! q >= (IM - E) / (im_per_unit - pen_per_unit)
//! ```
//!
//! When the penalty per unit is at least the margin freed per unit, no partial
//! size helps and the position is closed in full.

use crate::margin::MarginSnapshot;
use crate::types::{ceil_to_lot, AccountId, Bps, MarketId, Quote};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationParams {
    pub penalty_bps: u32,
    /// Fraction of the penalty paid to the liquidator. The rest goes to insurance.
    pub liquidator_share: Decimal,
}

impl Default for LiquidationParams {
    fn default() -> Self {
        Self {
            penalty_bps: 100,
            liquidator_share: dec!(0.5),
        }
    }
}

impl LiquidationParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.liquidator_share < Decimal::ZERO || self.liquidator_share > Decimal::ONE {
            return Err("liquidator share must be within [0, 1]".to_string());
        }
        if self.penalty_bps >= 10_000 {
            return Err("penalty must be below 100% of notional".to_string());
        }
        Ok(())
    }

    pub fn penalty_rate(&self) -> Decimal {
        Bps::new(self.penalty_bps as i32).as_fraction()
    }
}

/// Where an account sits in the liquidation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskState {
    Healthy,
    /// Health below 1. Anyone may liquidate.
    AtRisk,
    /// A liquidation left part of the position open.
    PartiallyLiquidated,
    FullyLiquidated,
}

pub fn classify(snapshot: &MarginSnapshot) -> RiskState {
    if snapshot.is_liquidatable() {
        RiskState::AtRisk
    } else {
        RiskState::Healthy
    }
}

/// Produced and consumed inside a single liquidate call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationTicket {
    pub account: AccountId,
    pub market_id: MarketId,
    pub health_factor_at_trigger: Decimal,
    pub size_to_close: Decimal,
    pub penalty_bps: u32,
    pub full_close: bool,
}

/// Inputs of the sizing rule, all per the liquidated position's market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizingInput {
    pub equity: Quote,
    pub initial: Quote,
    pub position_size: Decimal,
    /// IM released per unit closed.
    pub im_per_unit: Decimal,
    /// Penalty charged per unit closed.
    pub penalty_per_unit: Decimal,
    pub lot_size: Decimal,
}

/// Returns (size to close, full close).
pub fn liquidation_size(input: &SizingInput) -> (Decimal, bool) {
    let size = input.position_size.abs();
    let freed_per_unit = input.im_per_unit - input.penalty_per_unit;
    if freed_per_unit <= Decimal::ZERO {
        return (size, true);
    }

    let shortfall = input.initial.sub(input.equity).max_zero().value();
    let q = ceil_to_lot(shortfall / freed_per_unit, input.lot_size);
    if q >= size {
        (size, true)
    } else {
        (q, false)
    }
}

/// Caps a partial close at the notional the liquidator is willing to take.
/// Never rounds below one lot.
pub fn cap_to_repay(size: Decimal, max_repay: Quote, unit_notional: Decimal, lot_size: Decimal) -> Decimal {
    if unit_notional <= Decimal::ZERO {
        return size;
    }
    let affordable = max_repay.value() / unit_notional;
    let lots = if lot_size > Decimal::ZERO {
        (affordable / lot_size).floor() * lot_size
    } else {
        affordable
    };
    size.min(lots.max(lot_size))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PenaltySplit {
    pub total: Quote,
    pub liquidator: Quote,
    pub insurance: Quote,
}

// 6.1: penalty on notional closed, never more than the equity left to pay it
pub fn split_penalty(notional_closed: Quote, equity: Quote, params: &LiquidationParams) -> PenaltySplit {
    let total = notional_closed.mul(params.penalty_rate()).min(equity.max_zero());
    let liquidator = total.mul(params.liquidator_share);
    PenaltySplit {
        total,
        liquidator,
        insurance: total.sub(liquidator),
    }
}

/// How much of a deficit a fund holding `balance` can cover.
pub fn insurance_cover(deficit: Quote, balance: Decimal) -> Quote {
    deficit.max_zero().min(Quote::new(balance.max(Decimal::ZERO)))
}

/// Unit value at which a position's equity is exactly zero.
pub fn bankruptcy_value(unit_value: Decimal, equity: Quote, size: Decimal) -> Decimal {
    if size.is_zero() {
        return unit_value;
    }
    unit_value - equity.value() / size
}
