// 9.1 settlement.rs: expiry cash settlement for dated markets.
// the price is fixed once, from the TWAP of oracle samples taken in the window before
// expiry. every position then closes at its payoff. losers' negative equity is a hole
// in the clearing pool: insurance fills it first, winners are haircut pro rata for
// whatever is left.

use crate::oracle::time_weighted_average;
use crate::types::{AccountId, Price, Quote, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// TWAP over the sampled window, or None if nothing was sampled.
pub fn settlement_price_from_samples(samples: &[(Timestamp, Price)], expiry: Timestamp) -> Option<Price> {
    let in_window: Vec<(Timestamp, Price)> = samples.iter().copied().filter(|(ts, _)| *ts <= expiry).collect();
    time_weighted_average(&in_window, expiry)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLeg {
    pub account_id: AccountId,
    /// Equity at the settlement payoff. Negative = the account owes the pool.
    pub equity: Quote,
    /// What the account receives. Zero for negative equity.
    pub payout: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettlementPlan {
    pub legs: Vec<SettlementLeg>,
    pub deficit: Quote,
    pub insurance_used: Quote,
    /// Deficit left after insurance, taken out of winners.
    pub haircut: Quote,
    /// Share of their equity winners actually receive. 1 without a haircut.
    pub payout_ratio: Decimal,
}

impl SettlementPlan {
    pub fn total_payout(&self) -> Quote {
        self.legs.iter().map(|l| l.payout).sum()
    }
}

// 9.2: pure payout plan. the engine executes it against the vault and sends any
// rounding dust left in the pool to insurance.
pub fn plan_settlement(equities: &[(AccountId, Quote)], insurance_balance: Decimal) -> SettlementPlan {
    let winnings: Quote = equities
        .iter()
        .map(|(_, e)| e.max_zero())
        .sum();
    let deficit: Quote = equities
        .iter()
        .filter(|(_, e)| e.is_negative())
        .map(|(_, e)| e.abs())
        .sum();

    let insurance_used = deficit.min(Quote::new(insurance_balance.max(Decimal::ZERO)));
    let haircut = deficit.sub(insurance_used).min(winnings);

    let payout_ratio = if winnings.is_positive() {
        (winnings.value() - haircut.value()) / winnings.value()
    } else {
        Decimal::ONE
    };

    let legs = equities
        .iter()
        .map(|(account_id, equity)| SettlementLeg {
            account_id: *account_id,
            equity: *equity,
            payout: equity.max_zero().mul(payout_ratio),
        })
        .collect();

    SettlementPlan {
        legs,
        deficit,
        insurance_used,
        haircut,
        payout_ratio,
    }
}
