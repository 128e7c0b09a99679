// 8.0.2: result types and errors for engine operations.

use crate::config::ConfigError;
use crate::liquidation::{LiquidationTicket, PenaltySplit, RiskState};
use crate::market::MarketError;
use crate::matching::MatchError;
use crate::oracle::OracleError;
use crate::order::{BookError, Fill};
use crate::types::{AccountId, MarketId, OrderId, Price, Quote, Timestamp};
use crate::vault::{Holder, VaultError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Nothing left.
    Filled,
    /// Remainder is on the book.
    Resting,
    /// IOC or market remainder discarded.
    RemainderCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub average_price: Option<Price>,
    /// Escrow locked for the resting remainder.
    pub locked: Decimal,
    pub fills: Vec<Fill>,
}

impl OrderResult {
    pub fn is_resting(&self) -> bool {
        self.status == OrderStatus::Resting
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingPassResult {
    pub expired_orders: Vec<OrderId>,
    pub released: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingResult {
    pub market_id: MarketId,
    /// Whole periods accrued. Zero = nothing to do.
    pub periods: i64,
    pub funding_rate: Decimal,
    pub cumulative_index: Decimal,
    pub last_update: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationResult {
    pub ticket: LiquidationTicket,
    pub price: Price,
    pub penalty: PenaltySplit,
    pub insurance_used: Quote,
    pub cross_margin_used: Quote,
    /// Counterparties closed at the bankruptcy price.
    pub deleveraged: Vec<(AccountId, Decimal)>,
    /// Size the liquidator took over at the mark.
    pub liquidator_size: Decimal,
    /// Deficit nothing could absorb.
    pub socialized: Quote,
    pub outcome: RiskState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub market_id: MarketId,
    /// False when the call was a no-op.
    pub settled: bool,
    pub settlement_price: Option<Price>,
    pub positions_closed: usize,
    pub orders_released: usize,
    pub insurance_used: Quote,
    pub haircut: Quote,
}

impl SettlementResult {
    pub(super) fn noop(market_id: MarketId, settlement_price: Option<Price>) -> Self {
        Self {
            market_id,
            settled: false,
            settlement_price,
            positions_closed: 0,
            orders_released: 0,
            insurance_used: Quote::zero(),
            haircut: Quote::zero(),
        }
    }
}

/// What a caller should do about a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryHint {
    /// Transient. The same call may succeed later.
    RetryLater,
    /// The target is gone or in a terminal state.
    NeverRetry,
    /// The request itself must change.
    ChangeParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Account {account:?} needs {required} margin, has {available}")]
    InsufficientMargin {
        account: AccountId,
        required: Decimal,
        available: Decimal,
    },

    #[error("Order would leave market {0:?} crossed")]
    CrossedBookRejected(MarketId),

    #[error("Oracle unusable: {0}")]
    StaleOracle(#[from] OracleError),

    #[error("Order {0:?} not found")]
    OrderNotFound(OrderId),

    #[error("Escrow: {0}")]
    InsufficientEscrow(VaultError),

    #[error("Order {taker:?} would trade against own order {maker:?}")]
    SelfMatchRejected { taker: OrderId, maker: OrderId },

    #[error("Market {0:?} has expired")]
    MarketExpired(MarketId),

    #[error("Account {account:?} is healthy (health factor {health})")]
    AlreadyHealthy { account: AccountId, health: Decimal },

    #[error("Fill-or-kill needs {requested}, only {available} executable")]
    FillPlanIncomplete { requested: Decimal, available: Decimal },

    #[error("Market {0:?} not found")]
    MarketNotFound(MarketId),

    #[error("Market {0:?} is not active")]
    MarketNotActive(MarketId),

    #[error("Market {0:?} has no mark price yet")]
    NoMarkPrice(MarketId),

    #[error("Account {0:?} not found")]
    AccountNotFound(AccountId),

    #[error("Order {order_id:?} belongs to another account than {account:?}")]
    NotOrderOwner { order_id: OrderId, account: AccountId },

    #[error("Post-only order would take liquidity at {0}")]
    PostOnlyWouldCross(Price),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Market rule: {0}")]
    Market(#[from] MarketError),

    #[error("Admin capability does not belong to this engine")]
    Unauthorized,


    #[error("{0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn retry_hint(&self) -> RetryHint {
        match self {
            EngineError::StaleOracle(_)
            | EngineError::MarketNotActive(_)
            | EngineError::NoMarkPrice(_) => RetryHint::RetryLater,
            EngineError::OrderNotFound(_)
            | EngineError::MarketExpired(_)
            | EngineError::AlreadyHealthy { .. }
            | EngineError::MarketNotFound(_)
            | EngineError::AccountNotFound(_)
            | EngineError::NotOrderOwner { .. }
            | EngineError::Unauthorized => RetryHint::NeverRetry,
            EngineError::InsufficientMargin { .. }
            | EngineError::CrossedBookRejected(_)
            | EngineError::InsufficientEscrow(_)
            | EngineError::SelfMatchRejected { .. }
            | EngineError::FillPlanIncomplete { .. }
            | EngineError::PostOnlyWouldCross(_)
            | EngineError::InvalidOrder(_)
            | EngineError::Market(_)
            | EngineError::Config(_) => RetryHint::ChangeParameters,
        }
    }
}

impl From<MatchError> for EngineError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::SelfMatch { taker, maker } => EngineError::SelfMatchRejected { taker, maker },
            MatchError::FillPlanIncomplete { requested, available } => {
                EngineError::FillPlanIncomplete { requested, available }
            }
            MatchError::PostOnlyWouldCross(price) => EngineError::PostOnlyWouldCross(price),
            MatchError::NonPositiveQuantity(q) => EngineError::InvalidOrder(format!("quantity {} must be positive", q)),
        }
    }
}

impl From<BookError> for EngineError {
    fn from(err: BookError) -> Self {
        EngineError::InvalidOrder(err.to_string())
    }
}

impl From<VaultError> for EngineError {
    fn from(err: VaultError) -> Self {
        EngineError::InsufficientEscrow(err)
    }
}

// margined markets report a trader short on free quote as a margin problem
pub(super) fn margin_error(err: VaultError, quote: crate::types::AssetId) -> EngineError {
    match err {
        VaultError::InsufficientAvailable {
            holder: Holder::Account(account),
            asset,
            needed,
            available,
        } if asset == quote => EngineError::InsufficientMargin {
            account,
            required: needed,
            available,
        },
        other => EngineError::InsufficientEscrow(other),
    }
}
