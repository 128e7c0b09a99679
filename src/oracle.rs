// 16.0: oracle adapter. the engine is agnostic to where prices come from; anything
// implementing PriceOracle can feed it. readings are integers scaled by
// `price_decimals`, like most on-chain feeds publish them.
// 16.1 validation, 16.2 mock feed, 16.3 settlement TWAP.

use crate::types::{AssetId, Price, Timestamp};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleReading {
    pub price: u64,
    pub confidence: u64,
    pub timestamp: u64,
}

pub trait PriceOracle {
    fn get_price(&self, asset: AssetId) -> Option<OracleReading>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Fixed-point scale of `OracleReading::price`.
    pub price_decimals: u32,
    /// Readings older than this are treated as no reading at all.
    pub max_staleness_ms: u64,
    /// Readings whose confidence score is below this floor are rejected.
    pub min_confidence: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            price_decimals: 6,
            max_staleness_ms: 60_000,
            min_confidence: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("No price for {0}")]
    Unavailable(AssetId),

    #[error("Price for {asset} is {age_ms}ms old, limit {max_ms}ms")]
    Stale { asset: AssetId, age_ms: u64, max_ms: u64 },

    #[error("Confidence {confidence} for {asset} below floor {floor}")]
    LowConfidence { asset: AssetId, confidence: u64, floor: u64 },

    #[error("Non-positive price for {0}")]
    InvalidPrice(AssetId),
}

// 16.1: a reading either passes every check or the whole call aborts
pub fn validate_reading(
    asset: AssetId,
    reading: Option<OracleReading>,
    now: Timestamp,
    config: &OracleConfig,
) -> Result<(Price, Timestamp), OracleError> {
    let reading = reading.ok_or(OracleError::Unavailable(asset))?;

    let now_ms = now.as_millis().max(0) as u64;
    let age_ms = now_ms.saturating_sub(reading.timestamp);
    if age_ms > config.max_staleness_ms {
        return Err(OracleError::Stale {
            asset,
            age_ms,
            max_ms: config.max_staleness_ms,
        });
    }

    if reading.confidence < config.min_confidence {
        return Err(OracleError::LowConfidence {
            asset,
            confidence: reading.confidence,
            floor: config.min_confidence,
        });
    }

    let value = Decimal::from_i128_with_scale(reading.price as i128, config.price_decimals);
    let price = Price::new(value).ok_or(OracleError::InvalidPrice(asset))?;
    Ok((price, Timestamp::from_millis(reading.timestamp as i64)))
}

pub fn to_fixed_point(price: Decimal, decimals: u32) -> u64 {
    (price * Decimal::from(10u64.pow(decimals)))
        .trunc()
        .to_u64()
        .unwrap_or(0)
}

// 16.2: in-memory feed for tests and the simulator
#[derive(Debug, Clone, Default)]
pub struct MockOracle {
    readings: BTreeMap<AssetId, OracleReading>,
    price_decimals: u32,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            readings: BTreeMap::new(),
            price_decimals: OracleConfig::default().price_decimals,
        }
    }

    pub fn with_decimals(price_decimals: u32) -> Self {
        Self {
            readings: BTreeMap::new(),
            price_decimals,
        }
    }

    pub fn set_price(&mut self, asset: AssetId, price: Decimal, timestamp: Timestamp) {
        self.set_reading(asset, price, u64::MAX, timestamp);
    }

    pub fn set_reading(&mut self, asset: AssetId, price: Decimal, confidence: u64, timestamp: Timestamp) {
        self.readings.insert(
            asset,
            OracleReading {
                price: to_fixed_point(price, self.price_decimals),
                confidence,
                timestamp: timestamp.as_millis().max(0) as u64,
            },
        );
    }

    pub fn remove(&mut self, asset: AssetId) {
        self.readings.remove(&asset);
    }
}

impl PriceOracle for MockOracle {
    fn get_price(&self, asset: AssetId) -> Option<OracleReading> {
        self.readings.get(&asset).copied()
    }
}

// 16.3: time weighted average over samples up to `end`. each sample holds until
// the next one; the last holds until `end`. zero total weight falls back to the
// plain mean so a burst of same-millisecond samples still settles.
pub fn time_weighted_average(samples: &[(Timestamp, Price)], end: Timestamp) -> Option<Price> {
    if samples.is_empty() {
        return None;
    }

    let mut weighted_sum = Decimal::ZERO;
    let mut total_time = Decimal::ZERO;

    for (i, (ts, price)) in samples.iter().enumerate() {
        let until = samples.get(i + 1).map(|(next, _)| *next).unwrap_or(end);
        let duration = Decimal::from((until.as_millis() - ts.as_millis()).max(0));
        weighted_sum += price.value() * duration;
        total_time += duration;
    }

    if total_time > Decimal::ZERO {
        return Price::new(weighted_sum / total_time);
    }

    let sum: Decimal = samples.iter().map(|(_, p)| p.value()).sum();
    Price::new(sum / Decimal::from(samples.len() as u64))
}
