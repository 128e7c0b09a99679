//! Escrow vault.
//!
//! Every unit of value the engine custodies lives here, keyed by (holder, asset)
//! and split into an `available` and a `locked` bucket. Value only moves between
//! holders through a `LedgerOp::TransferLocked` leg of a crate-private batch. The
//! matching commit, liquidation and settlement paths are its only callers.
//!
//! Multi-leg settlement goes through [`Vault::apply_batch`]. The batch is applied
//! to a scratch copy of the touched balances and written back only if every leg
//! succeeds, so a fill's principal, fee and rebate legs land together or not at all.

use crate::types::{AccountId, AssetId, MarketId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Who owns a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Holder {
    /// A trader.
    Account(AccountId),
    /// Per-market pool backing every open position's margin claim.
    Clearing(MarketId),
    /// Per-market insurance fund. Lives in the available bucket.
    Insurance(MarketId),
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::Account(id) => write!(f, "account#{}", id.0),
            Holder::Clearing(id) => write!(f, "clearing#{}", id.0),
            Holder::Insurance(id) => write!(f, "insurance#{}", id.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bucket {
    Available,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub owner: Holder,
    pub asset_id: AssetId,
    pub available_balance: Decimal,
    pub locked_balance: Decimal,
}

impl EscrowAccount {
    fn empty(owner: Holder, asset_id: AssetId) -> Self {
        Self {
            owner,
            asset_id,
            available_balance: Decimal::ZERO,
            locked_balance: Decimal::ZERO,
        }
    }

    pub fn total(&self) -> Decimal {
        self.available_balance + self.locked_balance
    }
}

/// One leg of an atomic settlement batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerOp {
    Lock {
        holder: Holder,
        asset: AssetId,
        amount: Decimal,
    },
    Release {
        holder: Holder,
        asset: AssetId,
        amount: Decimal,
    },
    /// Debits `from`'s locked bucket and credits `to` in the chosen bucket.
    TransferLocked {
        from: Holder,
        to: Holder,
        asset: AssetId,
        amount: Decimal,
        into: Bucket,
    },
    /// Debits `payer`'s locked bucket. The amount leaves custody and is handed
    /// to the fee router once the surrounding transaction commits.
    RouteFee {
        payer: Holder,
        asset: AssetId,
        amount: Decimal,
    },
}

/// A fee amount that left custody and still has to be routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeLeg {
    pub payer: Holder,
    pub asset: AssetId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    #[error("Amount must not be negative: {0}")]
    NegativeAmount(Decimal),

    #[error("{holder} has {available} {asset} available, needs {needed}")]
    InsufficientAvailable {
        holder: Holder,
        asset: AssetId,
        needed: Decimal,
        available: Decimal,
    },

    #[error("{holder} has {locked} {asset} locked, needs {needed}")]
    InsufficientLocked {
        holder: Holder,
        asset: AssetId,
        needed: Decimal,
        locked: Decimal,
    },

    #[error("Conservation violated for {asset}: balances {balances}, custodied {custodied}")]
    ConservationViolated {
        asset: AssetId,
        balances: Decimal,
        custodied: Decimal,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vault {
    balances: BTreeMap<(Holder, AssetId), EscrowAccount>,
    custodied: BTreeMap<AssetId, Decimal>,
    fees_routed: BTreeMap<AssetId, Decimal>,
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    // 15.1: external value entering / leaving custody. only these change `custodied`
    // (plus fee legs, which leave custody by definition).
    pub fn deposit(&mut self, holder: Holder, asset: AssetId, amount: Decimal) -> Result<(), VaultError> {
        check_amount(amount)?;
        self.entry_mut(holder, asset).available_balance += amount;
        *self.custodied.entry(asset).or_insert(Decimal::ZERO) += amount;
        Ok(())
    }

    pub fn withdraw(&mut self, holder: Holder, asset: AssetId, amount: Decimal) -> Result<(), VaultError> {
        check_amount(amount)?;
        let entry = self.entry_mut(holder, asset);
        if entry.available_balance < amount {
            return Err(VaultError::InsufficientAvailable {
                holder,
                asset,
                needed: amount,
                available: entry.available_balance,
            });
        }
        entry.available_balance -= amount;
        *self.custodied.entry(asset).or_insert(Decimal::ZERO) -= amount;
        Ok(())
    }

    // 15.2: single-party primitives
    pub fn lock(&mut self, holder: Holder, asset: AssetId, amount: Decimal) -> Result<(), VaultError> {
        self.apply_batch(&[LedgerOp::Lock { holder, asset, amount }]).map(|_| ())
    }

    pub fn release(&mut self, holder: Holder, asset: AssetId, amount: Decimal) -> Result<(), VaultError> {
        self.apply_batch(&[LedgerOp::Release { holder, asset, amount }]).map(|_| ())
    }

    // 15.3: all or nothing. legs run in order against a scratch copy of the
    // touched entries, so a later leg can spend what an earlier one released.
    pub(crate) fn apply_batch(&mut self, ops: &[LedgerOp]) -> Result<Vec<FeeLeg>, VaultError> {
        let mut scratch: BTreeMap<(Holder, AssetId), EscrowAccount> = BTreeMap::new();
        let mut fees = Vec::new();

        for op in ops {
            match op {
                LedgerOp::Lock { holder, asset, amount } => {
                    check_amount(*amount)?;
                    let entry = self.scratch_entry(&mut scratch, *holder, *asset);
                    if entry.available_balance < *amount {
                        return Err(VaultError::InsufficientAvailable {
                            holder: *holder,
                            asset: *asset,
                            needed: *amount,
                            available: entry.available_balance,
                        });
                    }
                    entry.available_balance -= *amount;
                    entry.locked_balance += *amount;
                }
                LedgerOp::Release { holder, asset, amount } => {
                    check_amount(*amount)?;
                    let entry = self.scratch_entry(&mut scratch, *holder, *asset);
                    debit_locked(entry, *amount)?;
                    entry.available_balance += *amount;
                }
                LedgerOp::TransferLocked {
                    from,
                    to,
                    asset,
                    amount,
                    into,
                } => {
                    check_amount(*amount)?;
                    debit_locked(self.scratch_entry(&mut scratch, *from, *asset), *amount)?;
                    let dest = self.scratch_entry(&mut scratch, *to, *asset);
                    match into {
                        Bucket::Available => dest.available_balance += *amount,
                        Bucket::Locked => dest.locked_balance += *amount,
                    }
                }
                LedgerOp::RouteFee { payer, asset, amount } => {
                    check_amount(*amount)?;
                    debit_locked(self.scratch_entry(&mut scratch, *payer, *asset), *amount)?;
                    if !amount.is_zero() {
                        fees.push(FeeLeg {
                            payer: *payer,
                            asset: *asset,
                            amount: *amount,
                        });
                    }
                }
            }
        }

        for (key, entry) in scratch {
            self.balances.insert(key, entry);
        }
        for leg in &fees {
            *self.custodied.entry(leg.asset).or_insert(Decimal::ZERO) -= leg.amount;
            *self.fees_routed.entry(leg.asset).or_insert(Decimal::ZERO) += leg.amount;
        }
        Ok(fees)
    }

    pub fn balance(&self, holder: Holder, asset: AssetId) -> EscrowAccount {
        self.balances
            .get(&(holder, asset))
            .cloned()
            .unwrap_or_else(|| EscrowAccount::empty(holder, asset))
    }

    pub fn available(&self, holder: Holder, asset: AssetId) -> Decimal {
        self.balance(holder, asset).available_balance
    }

    pub fn locked(&self, holder: Holder, asset: AssetId) -> Decimal {
        self.balance(holder, asset).locked_balance
    }

    pub fn custodied(&self, asset: AssetId) -> Decimal {
        self.custodied.get(&asset).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn fees_routed(&self, asset: AssetId) -> Decimal {
        self.fees_routed.get(&asset).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn assets(&self) -> impl Iterator<Item = &AssetId> {
        self.custodied.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = &EscrowAccount> {
        self.balances.values()
    }

    // 15.4: sum of every bucket equals what came in minus what went out.
    pub fn check_conservation(&self) -> Result<(), VaultError> {
        for (asset, custodied) in &self.custodied {
            let balances: Decimal = self
                .balances
                .iter()
                .filter(|((_, a), _)| a == asset)
                .map(|(_, e)| e.total())
                .sum();
            if balances != *custodied {
                return Err(VaultError::ConservationViolated {
                    asset: *asset,
                    balances,
                    custodied: *custodied,
                });
            }
        }
        Ok(())
    }

    fn entry_mut(&mut self, holder: Holder, asset: AssetId) -> &mut EscrowAccount {
        self.balances
            .entry((holder, asset))
            .or_insert_with(|| EscrowAccount::empty(holder, asset))
    }

    fn scratch_entry<'a>(
        &self,
        scratch: &'a mut BTreeMap<(Holder, AssetId), EscrowAccount>,
        holder: Holder,
        asset: AssetId,
    ) -> &'a mut EscrowAccount {
        scratch
            .entry((holder, asset))
            .or_insert_with(|| self.balance(holder, asset))
    }
}

fn check_amount(amount: Decimal) -> Result<(), VaultError> {
    if amount < Decimal::ZERO {
        return Err(VaultError::NegativeAmount(amount));
    }
    Ok(())
}

fn debit_locked(entry: &mut EscrowAccount, amount: Decimal) -> Result<(), VaultError> {
    if entry.locked_balance < amount {
        return Err(VaultError::InsufficientLocked {
            holder: entry.owner,
            asset: entry.asset_id,
            needed: amount,
            locked: entry.locked_balance,
        });
    }
    entry.locked_balance -= amount;
    Ok(())
}
