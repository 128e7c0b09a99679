// 8.0 engine/core.rs: main engine. owns every market, account and the vault.
// each public mutation runs inside `transaction`: state is snapshotted up front and
// restored on any error, so a failed call leaves no trace. events and fee legs are
// buffered and only leave the engine once the call has committed.

use super::config::EngineConfig;
use super::results::EngineError;
use crate::account::{calculate_account_metrics, position_snapshot, Account, AccountMetrics, MarginMode, MarketView};
use crate::config::CoreConfig;
use crate::events::{
    DepositEvent, EventLog, EventPayload, MarketCreatedEvent, MarketStatusChangedEvent, ParametersUpdatedEvent,
    WithdrawalEvent,
};
use crate::fees::{FeeConfig, FeeRouter, RecordingFeeRouter};
use crate::funding::FundingParams;
use crate::liquidation::{classify, LiquidationParams, RiskState};
use crate::margin::{MarginParams, MarginSnapshot};
use crate::market::{MarketConfig, MarketError, MarketState, MarketStatus};
use crate::oracle::{MockOracle, PriceOracle};
use crate::position::Position;
use crate::types::{AccountId, AssetId, MarketId, Quote, Timestamp};
use crate::vault::{FeeLeg, Holder, Vault};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Proof of governance rights over one engine. Only `Engine::new` hands one out,
/// and a capability from another engine is rejected.
#[derive(Debug)]
pub struct AdminCap {
    engine_id: u64,
}

/// Everything a transaction may change. Cloned as the rollback snapshot.
#[derive(Debug, Clone, Default)]
pub(super) struct EngineState {
    pub(super) markets: BTreeMap<MarketId, MarketState>,
    pub(super) accounts: BTreeMap<AccountId, Account>,
    pub(super) vault: Vault,
    pub(super) next_order_id: u64,
    pub(super) next_account_id: u64,
    pub(super) pending_events: Vec<EventPayload>,
    pub(super) pending_fees: Vec<FeeLeg>,
}

/** 8.1: main engine struct. all mutable state lives in `state` */
#[derive(Debug)]
pub struct Engine<O: PriceOracle, R: FeeRouter> {
    pub(super) config: EngineConfig,
    pub(super) state: EngineState,
    pub(super) events: EventLog,
    pub(super) oracle: O,
    pub(super) fee_router: R,
    engine_id: u64,
    pub(super) current_time: Timestamp,
    /// Committed fee legs the router refused, oldest first.
    undelivered_fees: Vec<FeeLeg>,
}

/// Engine wired to the in-memory oracle and fee router.
pub type SimEngine = Engine<MockOracle, RecordingFeeRouter>;

impl SimEngine {
    pub fn with_mocks(config: EngineConfig) -> (Self, AdminCap) {
        Engine::new(config, MockOracle::with_decimals(6), RecordingFeeRouter::new())
    }
}

impl<O: PriceOracle, R: FeeRouter> Engine<O, R> {
    pub fn new(config: EngineConfig, oracle: O, fee_router: R) -> (Self, AdminCap) {
        let engine_id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let engine = Self {
            events: EventLog::new(config.max_events),
            config,
            state: EngineState {
                next_order_id: 1,
                next_account_id: 1,
                ..EngineState::default()
            },
            oracle,
            fee_router,
            engine_id,
            current_time: Timestamp::from_millis(0),
            undelivered_fees: Vec::new(),
        };
        (engine, AdminCap { engine_id })
    }

    /// Engine with every market of a validated deployment config listed.
    pub fn from_config(config: CoreConfig, oracle: O, fee_router: R) -> Result<(Self, AdminCap), EngineError> {
        config.validate()?;
        let (mut engine, cap) = Self::new(config.engine, oracle, fee_router);
        for market in config.markets {
            engine.create_market(&cap, market)?;
        }
        Ok((engine, cap))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_time(&mut self, timestamp: Timestamp) {
        self.current_time = timestamp;
    }

    pub fn time(&self) -> Timestamp {
        self.current_time
    }

    pub fn advance_time(&mut self, millis: i64) {
        self.current_time = self.current_time.plus_millis(millis);
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut O {
        &mut self.oracle
    }

    pub fn fee_router(&self) -> &R {
        &self.fee_router
    }

    pub fn fee_router_mut(&mut self) -> &mut R {
        &mut self.fee_router
    }

    // 8.2: all-or-nothing wrapper around one public operation
    pub(super) fn transaction<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let snapshot = self.state.clone();

        let value = match op(self) {
            Ok(value) => value,
            Err(err) => {
                self.state = snapshot;
                debug!(error = %err, retry = ?err.retry_hint(), "transaction rolled back");
                return Err(err);
            }
        };

        let legs = std::mem::take(&mut self.state.pending_fees);
        let payloads = std::mem::take(&mut self.state.pending_events);
        for payload in payloads {
            let name = payload.name();
            let id = self.events.publish(self.current_time, payload);
            debug!(event_id = id.0, event = name, "event committed");
        }

        // 8.3: routing is fire-and-forget once the state is final. one leg per
        // payer and asset; a refused leg waits for the next commit or flush
        let mut merged: BTreeMap<(Holder, AssetId), Decimal> = BTreeMap::new();
        for leg in legs {
            *merged.entry((leg.payer, leg.asset)).or_insert(Decimal::ZERO) += leg.amount;
        }
        self.undelivered_fees.extend(
            merged
                .into_iter()
                .filter(|(_, amount)| *amount > Decimal::ZERO)
                .map(|((payer, asset), amount)| FeeLeg { payer, asset, amount }),
        );
        self.flush_fees();
        Ok(value)
    }

    /// Hands every queued fee leg to the router. Returns how many it accepted;
    /// the rest stay queued in order.
    pub fn flush_fees(&mut self) -> usize {
        let queued = std::mem::take(&mut self.undelivered_fees);
        let mut delivered = 0;
        for leg in queued {
            match self.fee_router.route_fee(leg.asset, leg.amount, leg.payer) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(error = %err, payer = %leg.payer, amount = %leg.amount, "fee routing failed, leg queued");
                    self.undelivered_fees.push(leg);
                }
            }
        }
        delivered
    }

    /// Fee legs that left custody but the router has not accepted yet.
    pub fn undelivered_fees(&self) -> &[FeeLeg] {
        &self.undelivered_fees
    }

    pub(super) fn emit(&mut self, payload: EventPayload) {
        self.state.pending_events.push(payload);
    }

    pub(super) fn check_admin(&self, cap: &AdminCap) -> Result<(), EngineError> {
        if cap.engine_id != self.engine_id {
            return Err(EngineError::Unauthorized);
        }
        Ok(())
    }

    pub(super) fn market_ref(&self, market_id: MarketId) -> Result<&MarketState, EngineError> {
        self.state
            .markets
            .get(&market_id)
            .ok_or(EngineError::MarketNotFound(market_id))
    }

    pub(super) fn market_mut(&mut self, market_id: MarketId) -> Result<&mut MarketState, EngineError> {
        self.state
            .markets
            .get_mut(&market_id)
            .ok_or(EngineError::MarketNotFound(market_id))
    }

    pub(super) fn account_ref(&self, account_id: AccountId) -> Result<&Account, EngineError> {
        self.state
            .accounts
            .get(&account_id)
            .ok_or(EngineError::AccountNotFound(account_id))
    }

    pub(super) fn account_mut(&mut self, account_id: AccountId) -> Result<&mut Account, EngineError> {
        self.state
            .accounts
            .get_mut(&account_id)
            .ok_or(EngineError::AccountNotFound(account_id))
    }

    // ---- 8.3: governance ----

    pub fn create_market(&mut self, cap: &AdminCap, config: MarketConfig) -> Result<MarketId, EngineError> {
        self.check_admin(cap)?;
        self.transaction(|engine| {
            config.validate()?;
            let market_id = config.id;
            if engine.state.markets.contains_key(&market_id) {
                return Err(MarketError::InvalidConfig(format!("market {} already listed", market_id.0)).into());
            }

            let name = config.name.clone();
            let kind = config.kind.label().to_string();
            let state = MarketState::new(config, engine.current_time);
            engine.state.markets.insert(market_id, state);
            info!(market = market_id.0, %name, %kind, "market created");
            engine.emit(EventPayload::MarketCreated(MarketCreatedEvent { market_id, name, kind }));
            Ok(market_id)
        })
    }

    pub fn pause_market(&mut self, cap: &AdminCap, market_id: MarketId) -> Result<(), EngineError> {
        self.set_market_status(cap, market_id, MarketStatus::Paused)
    }

    pub fn resume_market(&mut self, cap: &AdminCap, market_id: MarketId) -> Result<(), EngineError> {
        self.set_market_status(cap, market_id, MarketStatus::Active)
    }

    fn set_market_status(&mut self, cap: &AdminCap, market_id: MarketId, status: MarketStatus) -> Result<(), EngineError> {
        self.check_admin(cap)?;
        self.transaction(|engine| {
            let market = engine.market_mut(market_id)?;
            // settled is terminal
            if market.is_settled() {
                return Err(EngineError::MarketExpired(market_id));
            }
            let old_status = market.status;
            market.status = status;
            if old_status != status {
                info!(market = market_id.0, ?old_status, new_status = ?status, "market status changed");
                engine.emit(EventPayload::MarketStatusChanged(MarketStatusChangedEvent {
                    market_id,
                    old_status,
                    new_status: status,
                }));
            }
            Ok(())
        })
    }

    pub fn update_margin_params(&mut self, cap: &AdminCap, market_id: MarketId, params: MarginParams) -> Result<(), EngineError> {
        params.validate().map_err(MarketError::InvalidConfig)?;
        self.update_params(cap, market_id, "margin", |config| config.margin_params = params)
    }

    pub fn update_fee_config(&mut self, cap: &AdminCap, market_id: MarketId, fees: FeeConfig) -> Result<(), EngineError> {
        fees.validate().map_err(|e| MarketError::InvalidConfig(e.to_string()))?;
        self.update_params(cap, market_id, "fees", |config| config.fee_config = fees)
    }

    pub fn update_funding_params(&mut self, cap: &AdminCap, market_id: MarketId, params: FundingParams) -> Result<(), EngineError> {
        params.validate().map_err(MarketError::InvalidConfig)?;
        self.update_params(cap, market_id, "funding", |config| config.funding_params = params)
    }

    pub fn update_liquidation_params(
        &mut self,
        cap: &AdminCap,
        market_id: MarketId,
        params: LiquidationParams,
    ) -> Result<(), EngineError> {
        params.validate().map_err(MarketError::InvalidConfig)?;
        self.update_params(cap, market_id, "liquidation", |config| config.liquidation_params = params)
    }

    fn update_params(
        &mut self,
        cap: &AdminCap,
        market_id: MarketId,
        parameters: &str,
        apply: impl FnOnce(&mut MarketConfig),
    ) -> Result<(), EngineError> {
        self.check_admin(cap)?;
        self.transaction(|engine| {
            let market = engine.market_mut(market_id)?;
            apply(&mut market.config);
            market.config.validate()?;
            info!(market = market_id.0, parameters, "parameters updated");
            engine.emit(EventPayload::ParametersUpdated(ParametersUpdatedEvent {
                market_id,
                parameters: parameters.to_string(),
            }));
            Ok(())
        })
    }

    pub fn withdraw_insurance(&mut self, cap: &AdminCap, market_id: MarketId, amount: Decimal) -> Result<(), EngineError> {
        self.check_admin(cap)?;
        self.transaction(|engine| {
            let quote = engine.market_ref(market_id)?.config.quote_asset;
            let holder = Holder::Insurance(market_id);
            engine.state.vault.withdraw(holder, quote, amount)?;
            let new_available = engine.state.vault.available(holder, quote);
            engine.emit(EventPayload::Withdrawal(WithdrawalEvent {
                holder,
                asset: quote,
                amount,
                new_available,
            }));
            Ok(())
        })
    }

    // ---- 8.4: accounts and custody ----

    pub fn create_account(&mut self, margin_mode: MarginMode) -> AccountId {
        let id = AccountId(self.state.next_account_id);
        self.state.next_account_id += 1;
        self.state
            .accounts
            .insert(id, Account::new(id, margin_mode, self.current_time));
        debug!(account = id.0, ?margin_mode, "account created");
        id
    }

    pub fn deposit(&mut self, account_id: AccountId, asset: AssetId, amount: Decimal) -> Result<Decimal, EngineError> {
        self.transaction(|engine| {
            engine.account_ref(account_id)?;
            let holder = Holder::Account(account_id);
            engine.state.vault.deposit(holder, asset, amount)?;
            let new_available = engine.state.vault.available(holder, asset);
            engine.emit(EventPayload::Deposit(DepositEvent {
                account_id,
                asset,
                amount,
                new_available,
            }));
            Ok(new_available)
        })
    }

    // only free collateral leaves. margin and order escrow stay locked
    pub fn withdraw(&mut self, account_id: AccountId, asset: AssetId, amount: Decimal) -> Result<Decimal, EngineError> {
        self.transaction(|engine| {
            engine.account_ref(account_id)?;
            let holder = Holder::Account(account_id);
            engine.state.vault.withdraw(holder, asset, amount)?;
            let new_available = engine.state.vault.available(holder, asset);
            engine.emit(EventPayload::Withdrawal(WithdrawalEvent {
                holder,
                asset,
                amount,
                new_available,
            }));
            Ok(new_available)
        })
    }

    /// Anyone may top up a market's insurance fund.
    pub fn fund_insurance(&mut self, market_id: MarketId, amount: Decimal) -> Result<Decimal, EngineError> {
        self.transaction(|engine| {
            let quote = engine.market_ref(market_id)?.config.quote_asset;
            engine.state.vault.deposit(Holder::Insurance(market_id), quote, amount)?;
            let balance = engine.state.vault.available(Holder::Insurance(market_id), quote);
            info!(market = market_id.0, %amount, %balance, "insurance funded");
            Ok(balance)
        })
    }

    // ---- 8.5: queries ----

    pub fn market(&self, market_id: MarketId) -> Option<&MarketState> {
        self.state.markets.get(&market_id)
    }

    pub fn markets(&self) -> impl Iterator<Item = &MarketState> {
        self.state.markets.values()
    }

    pub fn account(&self, account_id: AccountId) -> Option<&Account> {
        self.state.accounts.get(&account_id)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.state.accounts.values()
    }

    pub fn position(&self, account_id: AccountId, market_id: MarketId) -> Option<&Position> {
        self.account(account_id)?.get_position(market_id)
    }

    pub fn vault(&self) -> &Vault {
        &self.state.vault
    }

    pub fn available(&self, account_id: AccountId, asset: AssetId) -> Decimal {
        self.state.vault.available(Holder::Account(account_id), asset)
    }

    pub fn locked(&self, account_id: AccountId, asset: AssetId) -> Decimal {
        self.state.vault.locked(Holder::Account(account_id), asset)
    }

    pub fn insurance_balance(&self, market_id: MarketId) -> Decimal {
        self.market(market_id)
            .map(|m| self.state.vault.available(Holder::Insurance(market_id), m.config.quote_asset))
            .unwrap_or(Decimal::ZERO)
    }

    pub fn clearing_balance(&self, market_id: MarketId) -> Decimal {
        self.market(market_id)
            .map(|m| self.state.vault.locked(Holder::Clearing(market_id), m.config.quote_asset))
            .unwrap_or(Decimal::ZERO)
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Margin inputs of every market that has a price.
    pub(super) fn views(&self) -> BTreeMap<MarketId, MarketView<'_>> {
        self.state
            .markets
            .iter()
            .filter_map(|(id, m)| m.view().map(|v| (*id, v)))
            .collect()
    }

    /// Equity and requirements that decide this account's risk in `market_id`:
    /// the one position when isolated, every same-quote position when cross.
    pub fn margin_snapshot(&self, account_id: AccountId, market_id: MarketId) -> Result<MarginSnapshot, EngineError> {
        let account = self.account_ref(account_id)?;
        let market = self.market_ref(market_id)?;

        if account.is_cross() {
            let views = self.views();
            return Ok(calculate_account_metrics(account, &views, market.config.quote_asset).snapshot);
        }

        Ok(match (account.get_position(market_id), market.view()) {
            (Some(position), Some(view)) => position_snapshot(position, &view),
            (Some(position), None) => MarginSnapshot {
                equity: position.locked_margin,
                ..MarginSnapshot::default()
            },
            (None, _) => MarginSnapshot::default(),
        })
    }

    pub fn account_health(&self, account_id: AccountId, market_id: MarketId) -> Result<Decimal, EngineError> {
        Ok(self.margin_snapshot(account_id, market_id)?.health())
    }

    pub fn risk_state(&self, account_id: AccountId, market_id: MarketId) -> Result<RiskState, EngineError> {
        Ok(classify(&self.margin_snapshot(account_id, market_id)?))
    }

    pub fn account_metrics(&self, account_id: AccountId, quote_asset: AssetId) -> Result<AccountMetrics, EngineError> {
        let account = self.account_ref(account_id)?;
        Ok(calculate_account_metrics(account, &self.views(), quote_asset))
    }

    /// Sum of position equities minus what the clearing pool holds. Stays equal
    /// to the market's socialized deficit, up to decimal rounding.
    pub fn clearing_gap(&self, market_id: MarketId) -> Option<Decimal> {
        let market = self.market(market_id)?;
        let view = market.view()?;
        let equity: Quote = self
            .state
            .accounts
            .values()
            .filter_map(|a| a.get_position(market_id))
            .map(|p| position_snapshot(p, &view).equity)
            .sum();
        Some(equity.value() - self.clearing_balance(market_id))
    }
}
