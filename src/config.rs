// 7.0 config.rs: deployment settings in one place. engine limits, oracle bounds and
// the markets to list at startup.
// 7.1 presets per environment, 7.2 validation, 7.3 json loading.

use crate::engine::EngineConfig;
use crate::market::MarketConfig;
use crate::types::{Leverage, MarketId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub engine: EngineConfig,
    pub markets: Vec<MarketConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            markets: vec![MarketConfig::btc_perp(), MarketConfig::eth_spot()],
        }
    }
}

impl CoreConfig {
    // 7.1: looser margin, free makers
    pub fn testnet() -> Self {
        let mut config = Self::default();
        for market in &mut config.markets {
            market.name = format!("{} Testnet", market.name);
            market.margin_params.maintenance_margin_rate = dec!(0.025);
            market.margin_params.initial_margin_rate = dec!(0.05);
            market.margin_params.max_leverage = Leverage::whole(20);
            market.margin_params.leverage_tiers.clear();
            market.fee_config.maker_fee_bps = 0;
            market.fee_config.taker_fee_bps = 1;
        }
        config
    }

    // conservative mainnet: fresher and more confident oracle reads, lower leverage
    pub fn mainnet_conservative() -> Self {
        let mut config = Self::default();
        config.engine.oracle.max_staleness_ms = 10_000;
        config.engine.oracle.min_confidence = 90;
        for market in &mut config.markets {
            market.margin_params.max_leverage = Leverage::whole(5);
            market.margin_params.initial_margin_rate = dec!(0.2);
            market.margin_params.maintenance_margin_rate = dec!(0.1);
            market.liquidation_params.penalty_bps = 150;
        }
        config
    }

    // 7.2: internal consistency. every market must validate and ids must be unique
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_events == 0 {
            return Err(ConfigError::InvalidEngine {
                reason: "event retention must be positive".to_string(),
            });
        }
        if self.engine.oracle.max_staleness_ms == 0 {
            return Err(ConfigError::InvalidOracle {
                reason: "staleness bound must be positive".to_string(),
            });
        }
        if self.engine.oracle.price_decimals > 18 {
            return Err(ConfigError::InvalidOracle {
                reason: "price decimals above 18".to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        for market in &self.markets {
            if !seen.insert(market.id) {
                return Err(ConfigError::DuplicateMarket(market.id));
            }
            market.validate().map_err(|e| ConfigError::InvalidMarket {
                market_id: market.id,
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    // 7.3: load + validate in one step
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn max_leverage(&self, market_id: MarketId) -> Option<Decimal> {
        self.markets
            .iter()
            .find(|m| m.id == market_id)
            .map(|m| m.margin_params.max_leverage.value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid engine config: {reason}")]
    InvalidEngine { reason: String },

    #[error("Invalid oracle config: {reason}")]
    InvalidOracle { reason: String },

    #[error("Invalid market {market_id:?}: {reason}")]
    InvalidMarket { market_id: MarketId, reason: String },

    #[error("Market {0:?} listed twice")]
    DuplicateMarket(MarketId),

    #[error("Config parse error: {0}")]
    Parse(String),
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testnet,
    Mainnet,
}

impl Environment {
    pub fn config(&self) -> CoreConfig {
        match self {
            Environment::Development => CoreConfig::default(),
            Environment::Testnet => CoreConfig::testnet(),
            Environment::Mainnet => CoreConfig::mainnet_conservative(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_presets_validate() {
        assert!(Environment::Development.config().validate().is_ok());
        assert!(Environment::Testnet.config().validate().is_ok());
        assert!(Environment::Mainnet.config().validate().is_ok());
    }

    #[test]
    fn presets_differ_where_expected() {
        let testnet = CoreConfig::testnet();
        assert_eq!(testnet.markets[0].fee_config.maker_fee_bps, 0);
        assert_eq!(testnet.max_leverage(MarketId(1)), Some(Decimal::from(20)));

        let mainnet = CoreConfig::mainnet_conservative();
        assert_eq!(mainnet.engine.oracle.min_confidence, 90);
        assert_eq!(mainnet.max_leverage(MarketId(1)), Some(Decimal::from(5)));
    }

    #[test]
    fn duplicate_market_ids_rejected() {
        let mut config = CoreConfig::default();
        config.markets.push(MarketConfig::btc_perp());
        assert_eq!(config.validate(), Err(ConfigError::DuplicateMarket(MarketId(1))));
    }

    #[test]
    fn invalid_margin_reported_per_market() {
        let mut config = CoreConfig::default();
        config.markets[0].margin_params.maintenance_margin_rate = dec!(0.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMarket { market_id: MarketId(1), .. })
        ));
    }

    #[test]
    fn json_round_trip() {
        let config = CoreConfig::mainnet_conservative();
        let json = config.to_json().unwrap();
        let back = CoreConfig::from_json(&json).unwrap();
        assert_eq!(back.markets.len(), config.markets.len());
        assert_eq!(back.engine.oracle.max_staleness_ms, 10_000);
    }

    #[test]
    fn bad_json_is_a_parse_error() {
        assert!(matches!(CoreConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
