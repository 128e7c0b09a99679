// 8.0: the engine. every public operation runs as one transaction over the
// whole state: it either commits with its ledger legs, fee routing and events,
// or fails and leaves nothing behind.

mod config;
mod core;
mod funding;
mod liquidations;
mod orders;
mod positions;
mod pricing;
mod results;
mod settlement;

pub use config::EngineConfig;
pub use core::{AdminCap, Engine, SimEngine};
pub use orders::SubmitOrder;
pub use results::{
    EngineError, FundingResult, LiquidationResult, MatchingPassResult, OrderResult, OrderStatus, RetryHint,
    SettlementResult,
};
