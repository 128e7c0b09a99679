// 4.0: open position tracking. pnl = size * (value - entry), where value is the
// mark for futures and the payoff at the mark for options.
// locked_margin is the position's claim on its market's clearing pool in the vault;
// funding and losses move the claim, never the pool directly.
// 4.1 has increase/reduce/flip logic at the bottom.

use crate::instrument::InstrumentKind;
use crate::types::{AccountId, MarketId, Price, Quote, Side, SignedSize, Timestamp};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What happens to the margin a closing fill frees up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosedMargin {
    /// Paid out to the owner as part of the fill.
    Released,
    /// Kept in the claim. Liquidation settles penalty and residual afterwards.
    Retained,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub owner: AccountId,
    pub market_id: MarketId,
    pub size: SignedSize,
    pub entry_price: Price,
    pub locked_margin: Quote,
    pub realized_pnl: Quote,
    pub last_funding_index: Decimal,
    pub opened_at: Timestamp,
    pub updated_at: Timestamp,
    /// Latches once the market's barrier is touched while this position is open.
    pub barrier_touched: bool,
}

impl Position {
    /// An empty position, ready for its first fill.
    pub fn new(
        owner: AccountId,
        market_id: MarketId,
        entry_price: Price,
        funding_index: Decimal,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            owner,
            market_id,
            size: SignedSize::zero(),
            entry_price,
            locked_margin: Quote::zero(),
            realized_pnl: Quote::zero(),
            last_funding_index: funding_index,
            opened_at: timestamp,
            updated_at: timestamp,
            barrier_touched: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_zero()
    }

    pub fn side(&self) -> Option<Side> {
        self.size.side()
    }

    /// Per-unit value of the contract at the underlying mark.
    pub fn unit_value(&self, kind: &InstrumentKind, underlying_mark: Price) -> Decimal {
        kind.value_at(underlying_mark, self.barrier_touched)
    }

    // 4.1: paper gains/losses against a per-unit value
    pub fn unrealized_pnl(&self, unit_value: Decimal) -> Quote {
        Quote::new(self.size.value() * (unit_value - self.entry_price.value()))
    }

    /// Funding owed since the last touch. Positive = this position pays.
    pub fn pending_funding(&self, current_funding_index: Decimal) -> Quote {
        let funding_delta = current_funding_index - self.last_funding_index;
        Quote::new(self.size.value() * funding_delta)
    }

    // 4.2: claim + pnl - funding. this vs MM determines liquidation
    pub fn equity(&self, unit_value: Decimal, current_funding_index: Decimal) -> Quote {
        self.locked_margin
            .add(self.unrealized_pnl(unit_value))
            .sub(self.pending_funding(current_funding_index))
    }

    /// Realize pending funding into the claim. Returns what was paid.
    pub fn settle_funding(&mut self, current_funding_index: Decimal) -> Quote {
        let paid = self.pending_funding(current_funding_index);
        self.locked_margin = self.locked_margin.sub(paid);
        self.last_funding_index = current_funding_index;
        paid
    }

    // 4.3: applies a signed fill. same direction averages the entry; opposite
    // direction closes first and opens any remainder at the fill price.
    // the caller settles funding before calling this.
    pub fn apply_fill(
        &mut self,
        delta: Decimal,
        fill_price: Price,
        mode: ClosedMargin,
        timestamp: Timestamp,
    ) -> FillOutcome {
        let mut outcome = FillOutcome::default();
        if delta.is_zero() {
            return outcome;
        }

        let same_direction = self.is_empty() || (delta > Decimal::ZERO) == self.size.is_long();
        if same_direction {
            self.increase(delta, fill_price, timestamp);
            outcome.opened = delta.abs();
            return outcome;
        }

        let close_amount = delta.abs().min(self.size.abs());
        let (realized, released) = self.reduce(close_amount, fill_price, mode, timestamp);
        outcome.realized_pnl = realized;
        outcome.released = released;
        outcome.closed = close_amount;

        let remainder = delta.abs() - close_amount;
        if remainder > Decimal::ZERO {
            self.increase(delta.signum() * remainder, fill_price, timestamp);
            outcome.opened = remainder;
        }
        outcome
    }

    fn increase(&mut self, delta: Decimal, fill_price: Price, timestamp: Timestamp) {
        if self.is_empty() {
            self.entry_price = fill_price;
            self.opened_at = timestamp;
            self.barrier_touched = false;
        } else {
            // weighted average entry price
            let old_abs = self.size.abs();
            let new_abs = old_abs + delta.abs();
            let weighted = old_abs * self.entry_price.value() + delta.abs() * fill_price.value();
            self.entry_price = Price::new_unchecked(weighted / new_abs);
        }
        self.size = self.size.add(delta);
        self.updated_at = timestamp;
    }

    fn reduce(
        &mut self,
        amount: Decimal,
        fill_price: Price,
        mode: ClosedMargin,
        timestamp: Timestamp,
    ) -> (Quote, Quote) {
        let abs_size = self.size.abs();
        let sign = self.size.value().signum();
        let realized = calculate_realized_pnl(
            SignedSize::new(sign * amount),
            self.entry_price,
            fill_price,
        );
        let full_close = amount >= abs_size;

        // claim backing the closed part, proportional to size
        let fraction = if full_close {
            self.locked_margin
        } else {
            self.locked_margin.mul(amount / abs_size)
        };

        let released = match mode {
            ClosedMargin::Retained => {
                self.locked_margin = self.locked_margin.add(realized);
                Quote::zero()
            }
            ClosedMargin::Released if full_close => {
                self.locked_margin = Quote::zero();
                fraction.add(realized)
            }
            ClosedMargin::Released => {
                let payout = fraction.add(realized);
                if payout.is_negative() {
                    // the rest of the position absorbs the loss
                    self.locked_margin = self.locked_margin.add(realized);
                    Quote::zero()
                } else {
                    self.locked_margin = self.locked_margin.sub(fraction);
                    payout
                }
            }
        };

        self.size = if full_close {
            SignedSize::zero()
        } else {
            SignedSize::new(sign * (abs_size - amount))
        };
        self.realized_pnl = self.realized_pnl.add(realized);
        self.updated_at = timestamp;
        (realized, released)
    }
}

/// Result of applying one fill to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FillOutcome {
    pub realized_pnl: Quote,
    /// Margin owed to the owner. Negative only on a full close whose loss
    /// exceeds its claim: the owner must cover it.
    pub released: Quote,
    pub closed: Decimal,
    pub opened: Decimal,
}

pub fn calculate_unrealized_pnl(size: SignedSize, entry_price: Price, mark_price: Price) -> Quote {
    let pnl = size.value() * (mark_price.value() - entry_price.value());
    Quote::new(pnl)
}

pub fn calculate_realized_pnl(close_size: SignedSize, entry_price: Price, exit_price: Price) -> Quote {
    let pnl = close_size.value() * (exit_price.value() - entry_price.value());
    Quote::new(pnl)
}
