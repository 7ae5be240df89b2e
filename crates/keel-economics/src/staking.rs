// crates/keel-economics/src/staking.rs
//
// Per-layer staking ledger with delayed unbonding.
//
// One generic ledger serves both registries. A `StakePolicy` supplies the
// difference between them: candidate operators may not leave their own bond
// below the registry minimum unless they exit to zero, sequencer stakers
// have no floor.
//
// Balances are held in shares of the global rebase index. Unstaking freezes
// the principal at the current index and queues it for `delay_blocks`;
// pending principal earns nothing. Withdraw sweeps every matured entry.
//
// Share totals are checkpointed lazily against snapshot ids: before the
// first mutation after a snapshot, the pre-mutation value is recorded under
// that snapshot id.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use keel_core::error::KeelError;
use keel_core::traits::TokenLedger;
use keel_core::{Address, Amount, LayerIndex, LayerKind};

use crate::fixed::shares_to_principal;
use crate::rebase::RebaseIndex;

/// Read access to the layer registry needed by the ledgers.
pub trait LayerDirectory {
    /// The layer exists (active or not).
    fn exists(&self, kind: LayerKind, index: LayerIndex) -> bool;

    fn is_active(&self, kind: LayerKind, index: LayerIndex) -> bool;

    /// The registered owner (sequencer) or operator (candidate).
    fn owner_of(&self, kind: LayerKind, index: LayerIndex) -> Option<Address>;

    fn minimum_deposit(&self, kind: LayerKind) -> Amount;

    /// Unbonding delay applied to new pending withdrawals.
    fn delay_blocks(&self) -> u64;
}

/// Floor rule applied to the remainder of an unstake.
pub trait StakePolicy {
    fn kind(&self) -> LayerKind;

    /// Check the principal an account would keep in `entry` after unstaking.
    fn check_remaining(
        &self,
        layers: &dyn LayerDirectory,
        entry: LayerIndex,
        account: &Address,
        remaining_principal: Amount,
    ) -> Result<(), KeelError>;
}

/// Sequencer layers: no floor on stakers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequencerPolicy;

impl StakePolicy for SequencerPolicy {
    fn kind(&self) -> LayerKind {
        LayerKind::Sequencer
    }

    fn check_remaining(
        &self,
        _layers: &dyn LayerDirectory,
        _entry: LayerIndex,
        _account: &Address,
        _remaining_principal: Amount,
    ) -> Result<(), KeelError> {
        Ok(())
    }
}

/// Candidate operators: the operator's own bond is floor-protected.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidatePolicy;

impl StakePolicy for CandidatePolicy {
    fn kind(&self) -> LayerKind {
        LayerKind::Candidate
    }

    fn check_remaining(
        &self,
        layers: &dyn LayerDirectory,
        entry: LayerIndex,
        account: &Address,
        remaining_principal: Amount,
    ) -> Result<(), KeelError> {
        if layers.owner_of(LayerKind::Candidate, entry) != Some(*account) {
            return Ok(());
        }
        let minimum = layers.minimum_deposit(LayerKind::Candidate);
        if remaining_principal != 0 && remaining_principal < minimum {
            return Err(KeelError::BelowMinimumFloor {
                remaining: remaining_principal,
                minimum,
            });
        }
        Ok(())
    }
}

/// A queued unbonding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub amount: Amount,
    pub release_block: u64,
}

/// Aggregate of an account's pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PendingSummary {
    pub amount: Amount,
    pub len: usize,
    pub next_release_block: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeReceipt {
    pub principal: Amount,
    pub shares: Amount,
    pub balance_after: Amount,
    pub entry_total_after: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstakeReceipt {
    pub shares: Amount,
    pub principal: Amount,
    pub release_block: u64,
    pub balance_after: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawReceipt {
    pub amount: Amount,
    pub released: usize,
}

/// OpenZeppelin-style lazy checkpoints: `values[i]` is the value in force
/// when snapshot `ids[i]` was taken.
#[derive(Debug, Clone, Default)]
struct Checkpoints {
    ids: Vec<u64>,
    values: Vec<Amount>,
}

impl Checkpoints {
    fn record(&mut self, snapshot_id: u64, current: Amount) {
        if snapshot_id == 0 {
            return;
        }
        if self.ids.last().copied().unwrap_or(0) < snapshot_id {
            self.ids.push(snapshot_id);
            self.values.push(current);
        }
    }

    fn value_at(&self, snapshot_id: u64, current: Amount) -> Amount {
        let pos = self.ids.partition_point(|id| *id < snapshot_id);
        self.values.get(pos).copied().unwrap_or(current)
    }
}

#[derive(Debug, Clone, Default)]
struct EntryBook {
    shares: BTreeMap<Address, Amount>,
    total_shares: Amount,
    pending: BTreeMap<Address, VecDeque<PendingWithdrawal>>,
    debt: BTreeMap<Address, Amount>,
    total_debt: Amount,
    account_history: BTreeMap<Address, Checkpoints>,
    total_history: Checkpoints,
}

/// A staking ledger for one registry kind.
#[derive(Debug, Clone)]
pub struct StakingLedger<P: StakePolicy> {
    policy: P,
    vault: Address,
    entries: BTreeMap<LayerIndex, EntryBook>,
    total_shares: Amount,
    total_history: Checkpoints,
    stake_accounts: Vec<Address>,
    known_accounts: BTreeSet<Address>,
}

impl<P: StakePolicy> StakingLedger<P> {
    /// Create an empty ledger whose staked principal is held by `vault`.
    pub fn new(policy: P, vault: Address) -> Self {
        Self {
            policy,
            vault,
            entries: BTreeMap::new(),
            total_shares: 0,
            total_history: Checkpoints::default(),
            stake_accounts: Vec::new(),
            known_accounts: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.policy.kind()
    }

    pub fn vault(&self) -> Address {
        self.vault
    }

    /// Pull `principal` from `account` via allowance and stake it into `entry`.
    pub fn stake(
        &mut self,
        layers: &dyn LayerDirectory,
        rebase: &RebaseIndex,
        token: &mut dyn TokenLedger,
        entry: LayerIndex,
        account: &Address,
        principal: Amount,
    ) -> Result<StakeReceipt, KeelError> {
        let shares = self.check_stake(layers, rebase, entry, principal)?;
        token.transfer_from(&self.vault, account, &self.vault, principal)?;
        self.credit(rebase, entry, account, principal, shares)
    }

    /// Single-call path where the token itself forwards the caller's funds,
    /// so no prior allowance is needed.
    pub fn pull_and_stake(
        &mut self,
        layers: &dyn LayerDirectory,
        rebase: &RebaseIndex,
        token: &mut dyn TokenLedger,
        entry: LayerIndex,
        account: &Address,
        principal: Amount,
    ) -> Result<StakeReceipt, KeelError> {
        let shares = self.check_stake(layers, rebase, entry, principal)?;
        token.transfer(account, &self.vault, principal)?;
        self.credit(rebase, entry, account, principal, shares)
    }

    /// Credit shares worth `principal` without a token pull. The principal
    /// must already be held by the vault.
    pub fn credit_shares(
        &mut self,
        layers: &dyn LayerDirectory,
        rebase: &RebaseIndex,
        entry: LayerIndex,
        account: &Address,
        principal: Amount,
    ) -> Result<StakeReceipt, KeelError> {
        let shares = self.check_credit(layers, rebase, entry, principal)?;
        self.credit(rebase, entry, account, principal, shares)
    }

    /// Shares [`credit_shares`](Self::credit_shares) would add for
    /// `principal`, or the error it would fail with.
    pub fn check_credit(
        &self,
        layers: &dyn LayerDirectory,
        rebase: &RebaseIndex,
        entry: LayerIndex,
        principal: Amount,
    ) -> Result<Amount, KeelError> {
        if !layers.exists(self.kind(), entry) {
            return Err(KeelError::NonRegisteredLayer {
                kind: self.kind(),
                index: entry,
            });
        }
        let shares = rebase.principal_to_shares(principal)?;
        self.total_shares
            .checked_add(shares)
            .ok_or_else(|| KeelError::ArithmeticOverflow("total shares".to_string()))?;
        Ok(shares)
    }

    /// Move `shares` out of the account's balance into the pending queue.
    pub fn unstake(
        &mut self,
        layers: &dyn LayerDirectory,
        rebase: &RebaseIndex,
        entry: LayerIndex,
        account: &Address,
        shares: Amount,
        current_block: u64,
    ) -> Result<UnstakeReceipt, KeelError> {
        if shares == 0 {
            return Err(KeelError::ZeroAmount);
        }
        let balance = self.shares_of(entry, account);
        if shares > balance {
            return Err(KeelError::InsufficientShares {
                balance,
                requested: shares,
            });
        }

        let remaining_shares = balance - shares;
        let remaining_principal = rebase.shares_to_principal(remaining_shares)?;
        self.policy
            .check_remaining(layers, entry, account, remaining_principal)?;

        let debt = self.debt_of(entry, account);
        if remaining_principal < debt {
            return Err(KeelError::DebtOutstanding {
                remaining: remaining_principal,
                debt,
            });
        }

        let principal = rebase.shares_to_principal(shares)?;
        let release_block = current_block.saturating_add(layers.delay_blocks());
        let snapshot_id = rebase.current_snapshot_id();

        self.checkpoint(snapshot_id, entry, account);
        self.total_shares -= shares;
        let book = self.entries.entry(entry).or_default();
        book.total_shares -= shares;
        book.shares.insert(*account, remaining_shares);
        book.pending
            .entry(*account)
            .or_default()
            .push_back(PendingWithdrawal {
                amount: principal,
                release_block,
            });

        info!(
            kind = %self.kind(),
            entry,
            account = %account,
            shares,
            principal,
            release_block,
            "unstaked"
        );

        Ok(UnstakeReceipt {
            shares,
            principal,
            release_block,
            balance_after: remaining_shares,
        })
    }

    /// Pay out every matured pending entry.
    ///
    /// # Errors
    /// Returns `KeelError::NothingToWithdraw` if no entry has matured.
    pub fn withdraw(
        &mut self,
        token: &mut dyn TokenLedger,
        entry: LayerIndex,
        account: &Address,
        current_block: u64,
    ) -> Result<WithdrawReceipt, KeelError> {
        let (amount, released) = self.available_withdraw(entry, account, current_block);
        if released == 0 {
            return Err(KeelError::NothingToWithdraw);
        }

        token.transfer(&self.vault, account, amount)?;

        if let Some(queue) = self
            .entries
            .get_mut(&entry)
            .and_then(|book| book.pending.get_mut(account))
        {
            queue.retain(|p| p.release_block > current_block);
        }

        info!(kind = %self.kind(), entry, account = %account, amount, released, "withdrawn");
        Ok(WithdrawReceipt { amount, released })
    }

    /// Matured principal and the number of matured entries.
    pub fn available_withdraw(
        &self,
        entry: LayerIndex,
        account: &Address,
        current_block: u64,
    ) -> (Amount, usize) {
        self.pending_of(entry, account)
            .filter(|p| p.release_block <= current_block)
            .fold((0, 0), |(amount, count), p| (amount + p.amount, count + 1))
    }

    pub fn amount_of_pendings(&self, entry: LayerIndex, account: &Address) -> PendingSummary {
        self.pending_of(entry, account)
            .fold(PendingSummary::default(), |summary, p| PendingSummary {
                amount: summary.amount + p.amount,
                len: summary.len + 1,
                next_release_block: Some(
                    summary
                        .next_release_block
                        .map_or(p.release_block, |b| b.min(p.release_block)),
                ),
            })
    }

    pub fn pending_withdrawals(&self, entry: LayerIndex, account: &Address) -> Vec<PendingWithdrawal> {
        self.pending_of(entry, account).copied().collect()
    }

    fn pending_of<'a>(
        &'a self,
        entry: LayerIndex,
        account: &Address,
    ) -> impl Iterator<Item = &'a PendingWithdrawal> + 'a {
        self.entries
            .get(&entry)
            .and_then(|book| book.pending.get(account))
            .into_iter()
            .flatten()
    }

    /// Record principal the provider has fronted from this entry.
    pub fn add_debt(&mut self, entry: LayerIndex, provider: &Address, amount: Amount) -> Result<Amount, KeelError> {
        let (next, total) = self.check_debt(entry, provider, amount)?;
        let book = self.entries.entry(entry).or_default();
        book.debt.insert(*provider, next);
        book.total_debt = total;
        Ok(next)
    }

    /// Provider debt and entry total after adding `amount`.
    pub fn check_debt(
        &self,
        entry: LayerIndex,
        provider: &Address,
        amount: Amount,
    ) -> Result<(Amount, Amount), KeelError> {
        let next = self
            .debt_of(entry, provider)
            .checked_add(amount)
            .ok_or_else(|| KeelError::ArithmeticOverflow("provider debt".to_string()))?;
        let total = self
            .total_debt(entry)
            .checked_add(amount)
            .ok_or_else(|| KeelError::ArithmeticOverflow("entry debt".to_string()))?;
        Ok((next, total))
    }

    pub fn reduce_debt(&mut self, entry: LayerIndex, provider: &Address, amount: Amount) -> Result<Amount, KeelError> {
        let current = self.debt_of(entry, provider);
        if amount > current {
            return Err(KeelError::Invariant(format!(
                "debt repayment {} exceeds debt {} of {} in entry {}",
                amount, current, provider, entry
            )));
        }
        let book = self.entries.entry(entry).or_default();
        let next = current - amount;
        if next == 0 {
            book.debt.remove(provider);
        } else {
            book.debt.insert(*provider, next);
        }
        book.total_debt -= amount;
        Ok(next)
    }

    /// Provider principal in `entry` minus outstanding debt.
    pub fn available_liquidity(
        &self,
        rebase: &RebaseIndex,
        entry: LayerIndex,
        provider: &Address,
    ) -> Result<Amount, KeelError> {
        let principal = self.principal_of(rebase, entry, provider)?;
        Ok(principal.saturating_sub(self.debt_of(entry, provider)))
    }

    pub fn debt_of(&self, entry: LayerIndex, provider: &Address) -> Amount {
        self.entries
            .get(&entry)
            .and_then(|book| book.debt.get(provider))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_debt(&self, entry: LayerIndex) -> Amount {
        self.entries.get(&entry).map(|b| b.total_debt).unwrap_or(0)
    }

    pub fn shares_of(&self, entry: LayerIndex, account: &Address) -> Amount {
        self.entries
            .get(&entry)
            .and_then(|book| book.shares.get(account))
            .copied()
            .unwrap_or(0)
    }

    /// Principal-equivalent balance at the current index.
    pub fn principal_of(&self, rebase: &RebaseIndex, entry: LayerIndex, account: &Address) -> Result<Amount, KeelError> {
        rebase.shares_to_principal(self.shares_of(entry, account))
    }

    pub fn total_shares_of(&self, entry: LayerIndex) -> Amount {
        self.entries.get(&entry).map(|b| b.total_shares).unwrap_or(0)
    }

    pub fn total_shares(&self) -> Amount {
        self.total_shares
    }

    pub fn total_staked(&self, rebase: &RebaseIndex, entry: LayerIndex) -> Result<Amount, KeelError> {
        rebase.shares_to_principal(self.total_shares_of(entry))
    }

    /// Sum of every account balance in `entry`. Equal to
    /// `total_shares_of(entry)` at all times.
    pub fn sum_of_balances(&self, entry: LayerIndex) -> Amount {
        self.entries
            .get(&entry)
            .map(|book| book.shares.values().sum())
            .unwrap_or(0)
    }

    /// Every account that has ever staked, in first-stake order.
    pub fn stake_account_list(&self) -> &[Address] {
        &self.stake_accounts
    }

    pub fn total_stake_accounts(&self) -> usize {
        self.stake_accounts.len()
    }

    /// Principal balance of `account` in `entry` when snapshot `snapshot_id` was taken.
    pub fn balance_of_at(
        &self,
        rebase: &RebaseIndex,
        entry: LayerIndex,
        account: &Address,
        snapshot_id: u64,
    ) -> Result<Amount, KeelError> {
        let index = rebase.index_at(snapshot_id)?;
        let current = self.shares_of(entry, account);
        let shares = self
            .entries
            .get(&entry)
            .and_then(|book| book.account_history.get(account))
            .map(|h| h.value_at(snapshot_id, current))
            .unwrap_or(current);
        shares_to_principal(shares, index)
    }

    /// Principal staked in `entry` when snapshot `snapshot_id` was taken.
    pub fn total_staked_at(&self, rebase: &RebaseIndex, entry: LayerIndex, snapshot_id: u64) -> Result<Amount, KeelError> {
        let index = rebase.index_at(snapshot_id)?;
        let current = self.total_shares_of(entry);
        let shares = self
            .entries
            .get(&entry)
            .map(|book| book.total_history.value_at(snapshot_id, current))
            .unwrap_or(current);
        shares_to_principal(shares, index)
    }

    /// Principal staked across all entries when snapshot `snapshot_id` was taken.
    pub fn total_staked_global_at(&self, rebase: &RebaseIndex, snapshot_id: u64) -> Result<Amount, KeelError> {
        let index = rebase.index_at(snapshot_id)?;
        let shares = self.total_history.value_at(snapshot_id, self.total_shares);
        shares_to_principal(shares, index)
    }

    fn check_stake(
        &self,
        layers: &dyn LayerDirectory,
        rebase: &RebaseIndex,
        entry: LayerIndex,
        principal: Amount,
    ) -> Result<Amount, KeelError> {
        let kind = self.kind();
        if !layers.exists(kind, entry) {
            return Err(KeelError::NonRegisteredLayer { kind, index: entry });
        }
        if !layers.is_active(kind, entry) {
            return Err(KeelError::InactiveLayer { kind, index: entry });
        }
        if principal == 0 {
            return Err(KeelError::ZeroAmount);
        }
        let shares = rebase.principal_to_shares(principal)?;
        if shares == 0 {
            debug!(principal, index = rebase.index(), "stake rounds to zero shares");
            return Err(KeelError::ZeroAmount);
        }
        Ok(shares)
    }

    fn credit(
        &mut self,
        rebase: &RebaseIndex,
        entry: LayerIndex,
        account: &Address,
        principal: Amount,
        shares: Amount,
    ) -> Result<StakeReceipt, KeelError> {
        let total = self
            .total_shares
            .checked_add(shares)
            .ok_or_else(|| KeelError::ArithmeticOverflow("total shares".to_string()))?;

        self.checkpoint(rebase.current_snapshot_id(), entry, account);
        self.total_shares = total;
        let book = self.entries.entry(entry).or_default();
        let balance_after = book.shares.get(account).copied().unwrap_or(0) + shares;
        book.shares.insert(*account, balance_after);
        book.total_shares += shares;
        let entry_total_after = book.total_shares;

        if self.known_accounts.insert(*account) {
            self.stake_accounts.push(*account);
        }

        info!(
            kind = %self.kind(),
            entry,
            account = %account,
            principal,
            shares,
            "staked"
        );

        Ok(StakeReceipt {
            principal,
            shares,
            balance_after,
            entry_total_after,
        })
    }

    fn checkpoint(&mut self, snapshot_id: u64, entry: LayerIndex, account: &Address) {
        self.total_history.record(snapshot_id, self.total_shares);
        let book = self.entries.entry(entry).or_default();
        let balance = book.shares.get(account).copied().unwrap_or(0);
        book.account_history
            .entry(*account)
            .or_default()
            .record(snapshot_id, balance);
        book.total_history.record(snapshot_id, book.total_shares);
    }
}
