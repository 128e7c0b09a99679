// 11.0: every committed state change produces an event for the indexer. a transaction
// buffers its payloads and they are published only if it commits, so the log never
// shows a change that was rolled back. the EventPayload enum lists all event types.

use crate::liquidation::RiskState;
use crate::market::MarketStatus;
use crate::types::{AccountId, AssetId, MarketId, OrderId, Price, Quote, Side, SignedSize, Timestamp};
use crate::vault::Holder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    // order events
    OrderPosted(OrderPostedEvent),
    OrderCancelled(OrderCancelledEvent),
    OrderExpired(OrderExpiredEvent),
    TradeExecuted(TradeExecutedEvent),

    // position events
    PositionChanged(PositionChangedEvent),

    // risk events
    PositionLiquidated(PositionLiquidatedEvent),
    AutoDeleveraged(AutoDeleveragedEvent),
    InsuranceFundUsed(InsuranceFundUsedEvent),
    InsolvencyDetected(InsolvencyDetectedEvent),

    // funding and settlement
    FundingAccrued(FundingAccruedEvent),
    FundingSettled(FundingSettledEvent),
    MarkPriceUpdated(MarkPriceUpdatedEvent),
    BarrierTouched(BarrierTouchedEvent),
    MarketSettled(MarketSettledEvent),

    // custody
    Deposit(DepositEvent),
    Withdrawal(WithdrawalEvent),

    // governance
    MarketCreated(MarketCreatedEvent),
    MarketStatusChanged(MarketStatusChangedEvent),
    ParametersUpdated(ParametersUpdatedEvent),
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::OrderPosted(_) => "order_posted",
            EventPayload::OrderCancelled(_) => "order_cancelled",
            EventPayload::OrderExpired(_) => "order_expired",
            EventPayload::TradeExecuted(_) => "trade_executed",
            EventPayload::PositionChanged(_) => "position_changed",
            EventPayload::PositionLiquidated(_) => "position_liquidated",
            EventPayload::AutoDeleveraged(_) => "auto_deleveraged",
            EventPayload::InsuranceFundUsed(_) => "insurance_fund_used",
            EventPayload::InsolvencyDetected(_) => "insolvency_detected",
            EventPayload::FundingAccrued(_) => "funding_accrued",
            EventPayload::FundingSettled(_) => "funding_settled",
            EventPayload::MarkPriceUpdated(_) => "mark_price_updated",
            EventPayload::BarrierTouched(_) => "barrier_touched",
            EventPayload::MarketSettled(_) => "market_settled",
            EventPayload::Deposit(_) => "deposit",
            EventPayload::Withdrawal(_) => "withdrawal",
            EventPayload::MarketCreated(_) => "market_created",
            EventPayload::MarketStatusChanged(_) => "market_status_changed",
            EventPayload::ParametersUpdated(_) => "parameters_updated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPostedEvent {
    pub market_id: MarketId,
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub side: Side,
    pub price: Price,
    pub quantity: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelledEvent {
    pub market_id: MarketId,
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub released: Decimal,
    pub reason: CancelReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    UserRequested,
    MarketSettled,
    /// The maker could not carry the fill it was about to receive.
    InsufficientMargin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderExpiredEvent {
    pub market_id: MarketId,
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub released: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeExecutedEvent {
    pub market_id: MarketId,
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,
    pub maker: AccountId,
    pub taker: AccountId,
    pub taker_side: Side,
    pub price: Price,
    pub quantity: Decimal,
    pub taker_fee: Decimal,
    pub maker_fee: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionChangedEvent {
    pub market_id: MarketId,
    pub account_id: AccountId,
    pub old_size: SignedSize,
    pub new_size: SignedSize,
    pub entry_price: Price,
    pub locked_margin: Quote,
    pub realized_pnl: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionLiquidatedEvent {
    pub market_id: MarketId,
    pub account_id: AccountId,
    pub liquidator: AccountId,
    pub size_closed: Decimal,
    pub price: Price,
    pub health_factor_at_trigger: Decimal,
    pub penalty: Quote,
    pub outcome: RiskState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDeleveragedEvent {
    pub market_id: MarketId,
    pub bankrupt_account: AccountId,
    pub counterparty: AccountId,
    pub size: Decimal,
    pub bankruptcy_price: Price,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsuranceFundUsedEvent {
    pub market_id: MarketId,
    pub account_id: Option<AccountId>,
    pub amount: Quote,
    pub remaining_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsolvencyDetectedEvent {
    pub market_id: MarketId,
    pub account_id: AccountId,
    pub shortfall: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingAccruedEvent {
    pub market_id: MarketId,
    pub periods: i64,
    pub funding_rate: Decimal,
    pub cumulative_index: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingSettledEvent {
    pub market_id: MarketId,
    pub account_id: AccountId,
    /// Positive = the position paid.
    pub payment: Quote,
    pub position_size: SignedSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPriceUpdatedEvent {
    pub market_id: MarketId,
    pub index_price: Price,
    pub mark_price: Price,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierTouchedEvent {
    pub market_id: MarketId,
    pub underlying: Price,
    pub at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSettledEvent {
    pub market_id: MarketId,
    pub settlement_price: Price,
    pub positions_closed: usize,
    pub orders_released: usize,
    pub insurance_used: Quote,
    pub haircut: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub account_id: AccountId,
    pub asset: AssetId,
    pub amount: Decimal,
    pub new_available: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalEvent {
    pub holder: Holder,
    pub asset: AssetId,
    pub amount: Decimal,
    pub new_available: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketCreatedEvent {
    pub market_id: MarketId,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStatusChangedEvent {
    pub market_id: MarketId,
    pub old_status: MarketStatus,
    pub new_status: MarketStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParametersUpdatedEvent {
    pub market_id: MarketId,
    pub parameters: String,
}

/// Committed events with bounded retention. Ids keep counting after old
/// events are dropped.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: VecDeque<Event>,
    next_id: u64,
    max_events: usize,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            max_events,
        }
    }

    pub fn publish(&mut self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.events.push_back(Event::new(id, timestamp, payload));
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
        id
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn recent(&self, count: usize) -> Vec<&Event> {
        let start = self.events.len().saturating_sub(count);
        self.events.iter().skip(start).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_id(&self) -> Option<EventId> {
        self.events.back().map(|e| e.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn deposit(amount: Decimal) -> EventPayload {
        EventPayload::Deposit(DepositEvent {
            account_id: AccountId(1),
            asset: AssetId::USD,
            amount,
            new_available: amount,
        })
    }

    #[test]
    fn log_assigns_increasing_ids() {
        let mut log = EventLog::new(10);
        let a = log.publish(Timestamp::from_millis(1), deposit(dec!(1)));
        let b = log.publish(Timestamp::from_millis(2), deposit(dec!(2)));
        assert!(b > a);
        assert_eq!(log.len(), 2);
        assert_eq!(log.last_id(), Some(b));
    }

    #[test]
    fn retention_drops_oldest() {
        let mut log = EventLog::new(2);
        for i in 0..5 {
            log.publish(Timestamp::from_millis(i), deposit(Decimal::from(i)));
        }
        assert_eq!(log.len(), 2);
        let ids: Vec<u64> = log.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(log.recent(1)[0].id, EventId(5));
    }

    #[test]
    fn events_serialize_for_the_indexer() {
        let payload = EventPayload::InsolvencyDetected(InsolvencyDetectedEvent {
            market_id: MarketId(1),
            account_id: AccountId(9),
            shortfall: Quote::new(dec!(12.5)),
        });
        assert_eq!(payload.name(), "insolvency_detected");
        let json = serde_json::to_string(&payload).unwrap();
        let back: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
