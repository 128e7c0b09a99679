// 6.2: auto-deleveraging. when insurance cannot cover a bankrupt position, opposing
// positions that are in profit at the bankruptcy price get closed against it at that price.
// ranked by pnl ratio * leverage: highest score gets deleveraged first.

use crate::position::Position;
use crate::types::{AccountId, Price, Quote, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdlParams {
    pub max_accounts_per_round: usize, // cap per ADL round
}

impl Default for AdlParams {
    fn default() -> Self {
        Self {
            max_accounts_per_round: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdlCandidate {
    pub account_id: AccountId,
    pub size: Decimal,
    pub score: Decimal, // higher = deleveraged first
    /// Profit at the bankruptcy price.
    pub pnl: Quote,
}

impl AdlCandidate {
    pub fn new(account_id: AccountId, position: &Position, bankruptcy_value: Decimal, unit_value: Decimal) -> Self {
        let pnl = position.unrealized_pnl(bankruptcy_value);
        let score = calculate_adl_score(position, pnl, unit_value);
        Self {
            account_id,
            size: position.size.abs(),
            score,
            pnl,
        }
    }
}

impl PartialEq for AdlCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.account_id == other.account_id
    }
}

impl Eq for AdlCandidate {}

impl PartialOrd for AdlCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AdlCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // descending score, then account id so equal scores rank deterministically
        other
            .score
            .cmp(&self.score)
            .then(self.account_id.cmp(&other.account_id))
    }
}

// score = (pnl / claim) * (notional / claim). a position with no claim left is as
// leveraged as it gets.
fn calculate_adl_score(position: &Position, pnl: Quote, unit_value: Decimal) -> Decimal {
    let claim = position.locked_margin.value();
    if claim <= Decimal::ZERO {
        return Decimal::MAX;
    }
    let pnl_ratio = pnl.value() / claim;
    let leverage = position.size.abs() * unit_value / claim;
    pnl_ratio * leverage
}

/// Opposing positions profitable at the bankruptcy value, best candidate first.
pub fn rank_adl_candidates<'a>(
    positions: impl IntoIterator<Item = (AccountId, &'a Position)>,
    target_side: Side,
    bankruptcy_value: Decimal,
    unit_value: Decimal,
) -> Vec<AdlCandidate> {
    let mut candidates: Vec<AdlCandidate> = positions
        .into_iter()
        .filter(|(_, pos)| pos.side() == Some(target_side))
        .map(|(id, pos)| AdlCandidate::new(id, pos, bankruptcy_value, unit_value))
        .filter(|c| c.pnl.is_positive())
        .collect();

    candidates.sort();
    candidates
}

/// Sizes to close from each candidate so that together they absorb `size`.
pub fn plan_adl(candidates: &[AdlCandidate], size: Decimal, params: &AdlParams) -> Vec<(AccountId, Decimal)> {
    let mut remaining = size;
    let mut plan = Vec::new();

    for candidate in candidates.iter().take(params.max_accounts_per_round) {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = candidate.size.min(remaining);
        if take > Decimal::ZERO {
            plan.push((candidate.account_id, take));
            remaining -= take;
        }
    }

    plan
}

/// Bankruptcy values can fall to zero or below for deep options losses. Fills
/// need a positive price, so the floor is one tick.
pub fn bankruptcy_fill_price(bankruptcy_value: Decimal, tick_size: Decimal) -> Price {
    Price::new(bankruptcy_value).unwrap_or_else(|| Price::new_unchecked(tick_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketId, SignedSize, Timestamp};
    use rust_decimal_macros::dec;

    fn position(owner: u64, size: Decimal, entry: Decimal, claim: Decimal) -> Position {
        let mut pos = Position::new(
            AccountId(owner),
            MarketId(1),
            Price::new_unchecked(entry),
            Decimal::ZERO,
            Timestamp::from_millis(0),
        );
        pos.size = SignedSize::new(size);
        pos.locked_margin = Quote::new(claim);
        pos
    }

    #[test]
    fn ranking_prefers_profitable_high_leverage() {
        let low = position(1, dec!(-1), dec!(110), dec!(50));
        let high = position(2, dec!(-1), dec!(110), dec!(10));
        let ranked = rank_adl_candidates(
            vec![(AccountId(1), &low), (AccountId(2), &high)],
            Side::Sell,
            dec!(100),
            dec!(100),
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].account_id, AccountId(2));
    }

    #[test]
    fn losing_and_same_side_positions_excluded() {
        let loser = position(1, dec!(-1), dec!(90), dec!(10));
        let long = position(2, dec!(1), dec!(90), dec!(10));
        let ranked = rank_adl_candidates(
            vec![(AccountId(1), &loser), (AccountId(2), &long)],
            Side::Sell,
            dec!(100),
            dec!(100),
        );
        assert!(ranked.is_empty());
    }

    #[test]
    fn ties_break_on_account_id() {
        let a = position(7, dec!(-1), dec!(110), dec!(10));
        let b = position(3, dec!(-1), dec!(110), dec!(10));
        let ranked = rank_adl_candidates(
            vec![(AccountId(7), &a), (AccountId(3), &b)],
            Side::Sell,
            dec!(100),
            dec!(100),
        );
        assert_eq!(ranked[0].account_id, AccountId(3));
    }

    #[test]
    fn plan_takes_in_rank_order() {
        let a = position(1, dec!(-4), dec!(110), dec!(10));
        let b = position(2, dec!(-4), dec!(110), dec!(40));
        let ranked = rank_adl_candidates(
            vec![(AccountId(1), &a), (AccountId(2), &b)],
            Side::Sell,
            dec!(100),
            dec!(100),
        );
        let plan = plan_adl(&ranked, dec!(6), &AdlParams::default());
        assert_eq!(plan, vec![(AccountId(1), dec!(4)), (AccountId(2), dec!(2))]);
    }

    #[test]
    fn plan_respects_round_cap() {
        let positions: Vec<Position> = (1..=20).map(|i| position(i, dec!(-1), dec!(110), dec!(10))).collect();
        let ranked = rank_adl_candidates(
            positions.iter().map(|p| (p.owner, p)),
            Side::Sell,
            dec!(100),
            dec!(100),
        );
        let params = AdlParams {
            max_accounts_per_round: 5,
        };
        assert_eq!(plan_adl(&ranked, dec!(100), &params).len(), 5);
    }

    #[test]
    fn fill_price_floors_at_tick() {
        assert_eq!(bankruptcy_fill_price(dec!(-3), dec!(0.01)).value(), dec!(0.01));
        assert_eq!(bankruptcy_fill_price(dec!(95), dec!(0.01)).value(), dec!(95));
    }
}
