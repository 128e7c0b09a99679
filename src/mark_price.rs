// 13.0: mark price derivation. perpetuals blend the index with the book mid through a
// clamped, EMA-smoothed premium so a thin book cannot drag margin around.
// every other instrument marks its underlying at the index: dated futures and options
// settle against the oracle, and an option book trades premiums, not the underlying.

use crate::instrument::InstrumentKind;
use crate::types::Price;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPriceParams {
    pub max_premium: Decimal,
    /// EMA weight of the newest premium. 1 = no smoothing, 0 = mark pinned to index.
    pub ema_alpha: Decimal,
}

impl Default for MarkPriceParams {
    fn default() -> Self {
        Self {
            max_premium: dec!(0.05),
            ema_alpha: dec!(0.1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPriceState {
    pub mark_price: Price,
    pub premium_index: Decimal,
}

pub fn calculate_raw_premium(mid_price: Price, index_price: Price) -> Decimal {
    (mid_price.value() - index_price.value()) / index_price.value()
}

pub fn clamp_premium(premium: Decimal, max_premium: Decimal) -> Decimal {
    premium.max(-max_premium).min(max_premium)
}

pub fn smooth_premium(current: Decimal, previous: Decimal, alpha: Decimal) -> Decimal {
    alpha * current + (Decimal::ONE - alpha) * previous
}

pub fn mark_price_from_premium(index_price: Price, premium: Decimal) -> Price {
    // |premium| <= max_premium < 1 keeps this positive
    Price::new(index_price.value() * (Decimal::ONE + premium)).unwrap_or(index_price)
}

// 13.1: one perp mark step. no mid = zero raw premium, so the smoothed premium decays
pub fn update_mark_price(
    previous_premium: Decimal,
    index_price: Price,
    mid_price: Option<Price>,
    params: &MarkPriceParams,
) -> MarkPriceState {
    let raw = mid_price.map_or(Decimal::ZERO, |mid| calculate_raw_premium(mid, index_price));
    let clamped = clamp_premium(raw, params.max_premium);
    let smoothed = smooth_premium(clamped, previous_premium, params.ema_alpha);

    MarkPriceState {
        mark_price: mark_price_from_premium(index_price, smoothed),
        premium_index: smoothed,
    }
}

// 13.2: instrument dispatch
pub fn derive_mark_price(
    kind: &InstrumentKind,
    previous_premium: Decimal,
    index_price: Price,
    mid_price: Option<Price>,
    params: &MarkPriceParams,
) -> MarkPriceState {
    match kind {
        InstrumentKind::Perpetual => update_mark_price(previous_premium, index_price, mid_price, params),
        InstrumentKind::Spot | InstrumentKind::Future { .. } | InstrumentKind::Option { .. } => MarkPriceState {
            mark_price: index_price,
            premium_index: Decimal::ZERO,
        },
    }
}
