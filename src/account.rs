//! Accounts and account-level margin.
//!
//! Free collateral lives in the vault as the account's available balance; the
//! account itself only holds its positions. Isolated accounts are risk-checked
//! one position at a time. Cross accounts sum equity and requirements over every
//! position sharing a quote asset and get a single health factor.

use crate::instrument::InstrumentKind;
use crate::margin::{position_requirement, MarginParams, MarginSnapshot};
use crate::position::Position;
use crate::types::{AccountId, AssetId, MarketId, Price, Quote, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarginMode {
    #[default]
    Isolated,
    Cross,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub margin_mode: MarginMode,
    pub positions: BTreeMap<MarketId, Position>,
    pub created_at: Timestamp,
}

impl Account {
    pub fn new(id: AccountId, margin_mode: MarginMode, timestamp: Timestamp) -> Self {
        Self {
            id,
            margin_mode,
            positions: BTreeMap::new(),
            created_at: timestamp,
        }
    }

    pub fn is_cross(&self) -> bool {
        self.margin_mode == MarginMode::Cross
    }

    pub fn get_position(&self, market_id: MarketId) -> Option<&Position> {
        self.positions.get(&market_id)
    }

    pub fn get_position_mut(&mut self, market_id: MarketId) -> Option<&mut Position> {
        self.positions.get_mut(&market_id)
    }

    pub fn set_position(&mut self, position: Position) {
        self.positions.insert(position.market_id, position);
    }

    pub fn remove_position(&mut self, market_id: MarketId) -> Option<Position> {
        self.positions.remove(&market_id)
    }

    pub fn open_markets(&self) -> Vec<MarketId> {
        self.positions
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }
}

/// What margin math needs to know about one market.
#[derive(Debug, Clone, Copy)]
pub struct MarketView<'a> {
    pub kind: &'a InstrumentKind,
    pub quote_asset: AssetId,
    pub mark: Price,
    pub funding_index: Decimal,
    pub margin_params: &'a MarginParams,
}

// 10.1: one position's equity and requirements at the market's mark
pub fn position_snapshot(position: &Position, view: &MarketView<'_>) -> MarginSnapshot {
    let value = position.unit_value(view.kind, view.mark);
    let equity = position.equity(value, view.funding_index);
    let requirement = position_requirement(
        view.kind,
        position.size,
        view.mark,
        position.barrier_touched,
        view.margin_params,
    );
    MarginSnapshot::new(equity, requirement)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountMetrics {
    pub snapshot: MarginSnapshot,
    pub unrealized_pnl: Quote,
    pub pending_funding: Quote,
    pub open_positions: usize,
}

impl AccountMetrics {
    pub fn health(&self) -> Decimal {
        self.snapshot.health()
    }
}

// 10.2: cross aggregation. positions in markets without a view (no mark yet)
// contribute their bare claim and no requirement.
pub fn calculate_account_metrics(
    account: &Account,
    views: &BTreeMap<MarketId, MarketView<'_>>,
    quote_asset: AssetId,
) -> AccountMetrics {
    let mut metrics = AccountMetrics::default();

    for (market_id, position) in &account.positions {
        match views.get(market_id) {
            Some(view) if view.quote_asset == quote_asset => {
                let value = position.unit_value(view.kind, view.mark);
                metrics.unrealized_pnl = metrics.unrealized_pnl.add(position.unrealized_pnl(value));
                metrics.pending_funding = metrics
                    .pending_funding
                    .add(position.pending_funding(view.funding_index));
                metrics.snapshot = metrics.snapshot.combine(&position_snapshot(position, view));
            }
            Some(_) => continue,
            None => {
                metrics.snapshot.equity = metrics.snapshot.equity.add(position.locked_margin);
            }
        }
        if !position.is_empty() {
            metrics.open_positions += 1;
        }
    }

    metrics
}
