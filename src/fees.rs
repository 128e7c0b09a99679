//! Fee schedule and the fee router seam.
//!
//! Maker fees may be negative (a rebate). A rebate is paid out of the taker's
//! fee on the same fill, so the config rejects a rebate larger than the taker fee
//! and the fee legs of a fill always sum to exactly what gets routed.

use crate::types::{AssetId, Bps};
use crate::vault::Holder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Maker fee in basis points (negative = rebate)
    pub maker_fee_bps: i32,
    /// Taker fee in basis points
    pub taker_fee_bps: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            maker_fee_bps: 2,
            taker_fee_bps: 5,
        }
    }
}

impl FeeConfig {
    pub fn zero() -> Self {
        Self {
            maker_fee_bps: 0,
            taker_fee_bps: 0,
        }
    }

    pub fn validate(&self) -> Result<(), FeeConfigError> {
        if self.maker_fee_bps < 0 && self.maker_fee_bps.unsigned_abs() > self.taker_fee_bps {
            return Err(FeeConfigError::RebateExceedsTakerFee {
                rebate_bps: self.maker_fee_bps.unsigned_abs(),
                taker_fee_bps: self.taker_fee_bps,
            });
        }
        if self.taker_fee_bps > 10_000 || self.maker_fee_bps > 10_000 {
            return Err(FeeConfigError::FeeAboveNotional);
        }
        Ok(())
    }

    pub fn taker_rate(&self) -> Decimal {
        Bps::new(self.taker_fee_bps as i32).as_fraction()
    }

    pub fn maker_rate(&self) -> Decimal {
        Bps::new(self.maker_fee_bps).as_fraction()
    }

    /// Rate a resting order reserves on top of its principal.
    pub fn maker_reserve_rate(&self) -> Decimal {
        self.maker_rate().max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeeConfigError {
    #[error("Maker rebate {rebate_bps}bps exceeds taker fee {taker_fee_bps}bps")]
    RebateExceedsTakerFee { rebate_bps: u32, taker_fee_bps: u32 },

    #[error("Fee above 100% of notional")]
    FeeAboveNotional,
}

/// Fees owed on one fill, in the quote asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FillFees {
    pub taker_fee: Decimal,
    /// Positive = maker pays, negative = maker receives a rebate.
    pub maker_fee: Decimal,
}

impl FillFees {
    pub fn compute(notional: Decimal, config: &FeeConfig) -> Self {
        Self {
            taker_fee: notional * config.taker_rate(),
            maker_fee: notional * config.maker_rate(),
        }
    }

    pub fn maker_rebate(&self) -> Decimal {
        (-self.maker_fee).max(Decimal::ZERO)
    }

    pub fn maker_charge(&self) -> Decimal {
        self.maker_fee.max(Decimal::ZERO)
    }

    /// Taker fee net of the maker rebate it funds.
    pub fn taker_routed(&self) -> Decimal {
        self.taker_fee - self.maker_rebate()
    }

    /// Everything that leaves custody for this fill.
    pub fn total_routed(&self) -> Decimal {
        self.taker_routed() + self.maker_charge()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Fee routing failed: {0}")]
pub struct FeeRouteError(pub String);

/// External fee sink. Called once per (payer, asset) leg after a transaction
/// commits; a refused leg stays queued on the engine.
pub trait FeeRouter {
    fn route_fee(&mut self, asset: AssetId, amount: Decimal, payer: Holder) -> Result<(), FeeRouteError>;
}

/// Keeps every routed leg in memory. Used by the simulator and tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingFeeRouter {
    pub routed: Vec<(AssetId, Decimal, Holder)>,
    pub fail_next: bool,
}

impl RecordingFeeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, asset: AssetId) -> Decimal {
        self.routed
            .iter()
            .filter(|(a, _, _)| *a == asset)
            .map(|(_, amount, _)| *amount)
            .sum()
    }
}

impl FeeRouter for RecordingFeeRouter {
    fn route_fee(&mut self, asset: AssetId, amount: Decimal, payer: Holder) -> Result<(), FeeRouteError> {
        if self.fail_next {
            self.fail_next = false;
            return Err(FeeRouteError("treasury unavailable".to_string()));
        }
        self.routed.push((asset, amount, payer));
        Ok(())
    }
}
