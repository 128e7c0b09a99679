// derivs-core: on-chain style derivatives exchange core.
// one engine hosts spot, perpetual, dated future and (barrier) option markets
// over a shared escrow vault. all computation is deterministic with no I/O:
// time, prices and fee routing come in through the engine's seams.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: ids, Side, Price, Quote, SignedSize, Bps
//   2.x  order.rs: orders, price-time book; matching.rs: fill planning
//        (FOK, post-only, self-match, expiry); fees.rs: maker/taker fees, router seam
//   3.x  margin.rs: IM/MM, leverage tiers, health factor
//   4.x  position.rs: position struct, pnl, increase/reduce/flip
//   5.x  funding.rs: periodic funding, cumulative index
//   6.x  liquidation.rs: sizing, penalty, bankruptcy value; adl.rs: auto-deleveraging
//   7.x  config.rs: environment presets, validated engine config
//   8.x  engine/: transactions over the whole state
//   9.x  settlement.rs: expiry TWAP and payout plan
//   10.x account.rs: accounts, cross/isolated aggregation
//   11.x events.rs: committed events for audit
//   12.x market.rs: market config + runtime state
//   13.x mark_price.rs: mark derivation
//   14.x instrument.rs: instrument kinds, option payoffs, barriers
//   15.x vault.rs: escrow balances, atomic ledger batches
//   16.x oracle.rs: oracle seam, reading validation, settlement TWAP

// core trading modules
pub mod account;
pub mod engine;
pub mod events;
pub mod fees;
pub mod funding;
pub mod instrument;
pub mod liquidation;
pub mod margin;
pub mod mark_price;
pub mod market;
pub mod matching;
pub mod order;
pub mod position;
pub mod types;
pub mod vault;

// risk and expiry
pub mod adl;
pub mod settlement;

// integration
pub mod config;
pub mod oracle;

// re exports for convenience
pub use account::*;
pub use adl::*;
pub use engine::*;
pub use events::*;
pub use fees::*;
pub use funding::*;
pub use instrument::*;
pub use liquidation::*;
pub use margin::*;
pub use mark_price::*;
pub use market::*;
pub use matching::*;
pub use order::*;
pub use oracle::*;
pub use position::*;
pub use settlement::*;
pub use types::*;
pub use vault::*;
pub use config::{ConfigError, CoreConfig, Environment};
