// 14.0: instrument shapes. one tagged enum instead of a trait per product so that
// margin, funding and settlement each branch on the kind in one visible match.
// 14.1 has payoffs, 14.2 barrier touch detection.

use crate::types::{Price, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarrierKind {
    /// knocked out once the underlying trades at or above the level
    UpAndOut,
    /// only pays if the underlying reached the level
    UpAndIn,
    DownAndOut,
    DownAndIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barrier {
    pub level: Price,
    pub kind: BarrierKind,
}

impl Barrier {
    // 14.2: inclusive. touching the level counts.
    pub fn touched_by(&self, underlying: Price) -> bool {
        match self.kind {
            BarrierKind::UpAndOut | BarrierKind::UpAndIn => underlying >= self.level,
            BarrierKind::DownAndOut | BarrierKind::DownAndIn => underlying <= self.level,
        }
    }

    pub fn is_knock_out(&self) -> bool {
        matches!(self.kind, BarrierKind::UpAndOut | BarrierKind::DownAndOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentKind {
    /// Immediate exchange of base for quote. No positions, no margin.
    Spot,
    /// Open-ended future kept near the index by periodic funding.
    Perpetual,
    /// Dated future, cash settled against the underlying at expiry.
    Future { expiry: Timestamp },
    /// European option on the underlying, optionally barrier dependent.
    /// Order prices are premiums; there is no pricing model.
    Option {
        expiry: Timestamp,
        strike: Price,
        option_type: OptionType,
        barrier: Option<Barrier>,
    },
}

impl InstrumentKind {
    pub fn expiry(&self) -> Option<Timestamp> {
        match self {
            InstrumentKind::Spot | InstrumentKind::Perpetual => None,
            InstrumentKind::Future { expiry } => Some(*expiry),
            InstrumentKind::Option { expiry, .. } => Some(*expiry),
        }
    }

    pub fn is_spot(&self) -> bool {
        matches!(self, InstrumentKind::Spot)
    }

    pub fn is_perpetual(&self) -> bool {
        matches!(self, InstrumentKind::Perpetual)
    }

    pub fn barrier(&self) -> Option<&Barrier> {
        match self {
            InstrumentKind::Option { barrier, .. } => barrier.as_ref(),
            _ => None,
        }
    }

    // 14.1: per-unit value of one contract given the underlying price.
    // futures track the underlying one to one, options pay intrinsic value.
    pub fn value_at(&self, underlying: Price, barrier_touched: bool) -> Decimal {
        match self {
            InstrumentKind::Spot | InstrumentKind::Perpetual | InstrumentKind::Future { .. } => {
                underlying.value()
            }
            InstrumentKind::Option {
                strike,
                option_type,
                barrier,
                ..
            } => {
                let vanilla = intrinsic_value(*option_type, *strike, underlying);
                match barrier {
                    None => vanilla,
                    Some(b) if b.is_knock_out() => {
                        if barrier_touched {
                            Decimal::ZERO
                        } else {
                            vanilla
                        }
                    }
                    Some(_) => {
                        if barrier_touched {
                            vanilla
                        } else {
                            Decimal::ZERO
                        }
                    }
                }
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InstrumentKind::Spot => "spot",
            InstrumentKind::Perpetual => "perpetual",
            InstrumentKind::Future { .. } => "future",
            InstrumentKind::Option { barrier: None, .. } => "option",
            InstrumentKind::Option { barrier: Some(_), .. } => "barrier-option",
        }
    }
}

pub fn intrinsic_value(option_type: OptionType, strike: Price, underlying: Price) -> Decimal {
    let diff = match option_type {
        OptionType::Call => underlying.value() - strike.value(),
        OptionType::Put => strike.value() - underlying.value(),
    };
    diff.max(Decimal::ZERO)
}
