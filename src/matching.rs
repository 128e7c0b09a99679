// 2.1: fill planning. pure function of (taker, book, now): it never mutates the
// book, so the engine can reject an order before anything is touched.
// the commit half lives in engine/orders.rs.

use crate::order::{Order, OrderBook, TimeInForce};
use crate::types::{AccountId, OrderId, Price, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFill {
    pub maker_order_id: OrderId,
    pub maker: AccountId,
    pub price: Price,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillPlan {
    /// In execution order: best price first, then time priority.
    pub fills: Vec<PlannedFill>,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    /// Expired makers passed over during the walk. Purged on commit.
    pub expired: Vec<OrderId>,
}

impl FillPlan {
    pub fn is_empty(&self) -> bool {
        self.fills.is_empty()
    }

    pub fn notional(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity * f.price.value()).sum()
    }

    pub fn average_price(&self) -> Option<Price> {
        if self.filled_quantity.is_zero() {
            return None;
        }
        Price::new(self.notional() / self.filled_quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("Order {taker:?} would trade against own resting order {maker:?}")]
    SelfMatch { taker: OrderId, maker: OrderId },

    #[error("Fill-or-kill needs {requested}, only {available} executable")]
    FillPlanIncomplete { requested: Decimal, available: Decimal },

    #[error("Post-only order would take liquidity at {0}")]
    PostOnlyWouldCross(Price),

    #[error("Order quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),
}

/// Walk the opposite side best-first and plan fills at the makers' prices.
///
/// Stops when the taker is filled, the book is exhausted, or the next maker
/// violates the taker's limit. Expired makers are skipped. A self-match anywhere
/// in the plan rejects the whole order rather than skipping the maker.
pub fn compute_fill_plan(taker: &Order, book: &OrderBook, now: Timestamp) -> Result<FillPlan, MatchError> {
    if taker.quantity_remaining <= Decimal::ZERO {
        return Err(MatchError::NonPositiveQuantity(taker.quantity_remaining));
    }

    let mut plan = FillPlan {
        remaining_quantity: taker.quantity_remaining,
        ..FillPlan::default()
    };

    for maker in book.iter_side(taker.side.opposite()) {
        if plan.remaining_quantity.is_zero() {
            break;
        }
        if maker.is_expired(now) {
            plan.expired.push(maker.id);
            continue;
        }
        let Some(maker_price) = maker.price else { continue };
        if !taker.accepts(maker_price) {
            break;
        }
        if taker.time_in_force == TimeInForce::PostOnly {
            return Err(MatchError::PostOnlyWouldCross(maker_price));
        }
        if maker.owner == taker.owner {
            return Err(MatchError::SelfMatch {
                taker: taker.id,
                maker: maker.id,
            });
        }

        let quantity = plan.remaining_quantity.min(maker.quantity_remaining);
        plan.fills.push(PlannedFill {
            maker_order_id: maker.id,
            maker: maker.owner,
            price: maker_price,
            quantity,
        });
        plan.filled_quantity += quantity;
        plan.remaining_quantity -= quantity;
    }

    if taker.time_in_force == TimeInForce::FOK && !plan.remaining_quantity.is_zero() {
        return Err(MatchError::FillPlanIncomplete {
            requested: taker.quantity_remaining,
            available: plan.filled_quantity,
        });
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetId, MarketId, Side};
    use rust_decimal_macros::dec;

    fn order(id: u64, owner: u64, side: Side, price: Option<Decimal>, qty: Decimal, tif: TimeInForce) -> Order {
        Order::new(
            OrderId(id),
            AccountId(owner),
            MarketId(1),
            side,
            price.map(Price::new_unchecked),
            qty,
            tif,
            None,
            Timestamp::from_millis(0),
            AssetId::USD,
        )
    }

    fn book_with_asks(asks: &[(u64, u64, Decimal, Decimal)]) -> OrderBook {
        let mut book = OrderBook::new(MarketId(1));
        for (id, owner, price, qty) in asks {
            book.insert(order(*id, *owner, Side::Sell, Some(*price), *qty, TimeInForce::GTC))
                .unwrap();
        }
        book
    }

    #[test]
    fn simple_cross_fills_at_maker_price() {
        let book = book_with_asks(&[(1, 1, dec!(100), dec!(10))]);
        let taker = order(2, 2, Side::Buy, Some(dec!(101)), dec!(4), TimeInForce::GTC);

        let plan = compute_fill_plan(&taker, &book, Timestamp::from_millis(0)).unwrap();
        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.fills[0].price.value(), dec!(100));
        assert_eq!(plan.fills[0].quantity, dec!(4));
        assert_eq!(plan.remaining_quantity, Decimal::ZERO);
    }

    #[test]
    fn walks_levels_until_limit() {
        let book = book_with_asks(&[
            (1, 1, dec!(100), dec!(1)),
            (2, 1, dec!(101), dec!(1)),
            (3, 1, dec!(103), dec!(1)),
        ]);
        let taker = order(9, 2, Side::Buy, Some(dec!(102)), dec!(5), TimeInForce::GTC);

        let plan = compute_fill_plan(&taker, &book, Timestamp::from_millis(0)).unwrap();
        assert_eq!(plan.fills.len(), 2);
        assert_eq!(plan.filled_quantity, dec!(2));
        assert_eq!(plan.remaining_quantity, dec!(3));
        assert_eq!(plan.average_price().unwrap().value(), dec!(100.5));
    }

    #[test]
    fn market_order_sweeps_book() {
        let book = book_with_asks(&[(1, 1, dec!(100), dec!(1)), (2, 1, dec!(500), dec!(1))]);
        let taker = order(9, 2, Side::Buy, None, dec!(2), TimeInForce::IOC);

        let plan = compute_fill_plan(&taker, &book, Timestamp::from_millis(0)).unwrap();
        assert_eq!(plan.filled_quantity, dec!(2));
    }

    #[test]
    fn fok_rejects_when_short() {
        let book = book_with_asks(&[(1, 1, dec!(100), dec!(1)), (2, 1, dec!(101), dec!(2))]);
        let taker = order(9, 2, Side::Buy, Some(dec!(105)), dec!(5), TimeInForce::FOK);

        let err = compute_fill_plan(&taker, &book, Timestamp::from_millis(0)).unwrap_err();
        assert_eq!(
            err,
            MatchError::FillPlanIncomplete {
                requested: dec!(5),
                available: dec!(3)
            }
        );
    }

    #[test]
    fn self_match_rejects_whole_order() {
        let book = book_with_asks(&[(1, 1, dec!(100), dec!(1)), (2, 2, dec!(101), dec!(1))]);
        let taker = order(9, 2, Side::Buy, Some(dec!(105)), dec!(2), TimeInForce::GTC);

        let err = compute_fill_plan(&taker, &book, Timestamp::from_millis(0)).unwrap_err();
        assert!(matches!(err, MatchError::SelfMatch { maker: OrderId(2), .. }));
    }

    #[test]
    fn post_only_rejected_when_crossing() {
        let book = book_with_asks(&[(1, 1, dec!(100), dec!(1))]);
        let crossing = order(9, 2, Side::Buy, Some(dec!(100)), dec!(1), TimeInForce::PostOnly);
        assert!(matches!(
            compute_fill_plan(&crossing, &book, Timestamp::from_millis(0)),
            Err(MatchError::PostOnlyWouldCross(_))
        ));

        let passive = order(10, 2, Side::Buy, Some(dec!(99)), dec!(1), TimeInForce::PostOnly);
        let plan = compute_fill_plan(&passive, &book, Timestamp::from_millis(0)).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn expired_makers_are_skipped() {
        let mut book = OrderBook::new(MarketId(1));
        let mut stale = order(1, 1, Side::Sell, Some(dec!(99)), dec!(1), TimeInForce::GTC);
        stale.expiry = Some(Timestamp::from_millis(10));
        book.insert(stale).unwrap();
        book.insert(order(2, 1, Side::Sell, Some(dec!(100)), dec!(1), TimeInForce::GTC))
            .unwrap();

        let taker = order(9, 2, Side::Buy, Some(dec!(100)), dec!(1), TimeInForce::IOC);
        let plan = compute_fill_plan(&taker, &book, Timestamp::from_millis(10)).unwrap();
        assert_eq!(plan.expired, vec![OrderId(1)]);
        assert_eq!(plan.fills[0].maker_order_id, OrderId(2));
    }
}
