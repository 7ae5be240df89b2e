// crates/keel-protocol/src/context.rs
//
// One ledger state: token, registry, both staking ledgers, the rebase
// index and the fast-withdraw settlement table, driven by a simulated block
// environment.
//
// Every state-changing call appends a `LedgerEvent` once it has succeeded.
// A failed call appends nothing.

use serde::Serialize;
use tracing::{debug, info};

use keel_core::error::KeelError;
use keel_core::events::{EventLog, LedgerEvent};
use keel_core::traits::TokenLedger;
use keel_core::{Address, Amount, LayerIndex, LayerKind};
use keel_economics::params::ProtocolParams;
use keel_economics::rebase::{DividendSplit, IssuanceResult, RebaseIndex, Snapshot};
use keel_economics::registry::{
    CandidateIdentity, DepositChange, DistributionResult, LayerRecord, LayerRegistry,
    SequencerIdentity,
};
use keel_economics::staking::{
    CandidatePolicy, LayerDirectory, PendingSummary, SequencerPolicy, StakeReceipt,
    StakingLedger, UnstakeReceipt, WithdrawReceipt,
};
use keel_economics::token::InMemoryToken;
use keel_fastwithdraw::{FastWithdrawProtocol, InMemoryAttestation, InMemoryMessenger};

/// Holds staked principal and pending withdrawals for both ledgers.
pub fn staking_vault() -> Address {
    Address::from_label("keel/staking-vault")
}

/// Holds security deposits and the layer reward pool.
pub fn registry_vault() -> Address {
    Address::from_label("keel/registry-vault")
}

/// Receives bridged funds for fast-withdraw settlement.
pub fn fast_withdraw_account() -> Address {
    Address::from_label("keel/fast-withdraw")
}

/// Simulated block height and time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BlockEnv {
    pub number: u64,
    /// Unix seconds.
    pub timestamp: u64,
}

impl BlockEnv {
    pub fn new(number: u64, timestamp: u64) -> Self {
        Self { number, timestamp }
    }
}

/// Point-in-time totals for logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub block: BlockEnv,
    pub index: u128,
    pub total_supply: Amount,
    pub sequencer_shares: Amount,
    pub candidate_shares: Amount,
    pub total_security_deposit: Amount,
    pub total_external_deposits: Amount,
    pub undistributed_rewards: Amount,
    pub sequencers: usize,
    pub candidates: usize,
    pub confirmed_messages: usize,
    pub events: usize,
}

pub struct StakingContext {
    pub(crate) block: BlockEnv,
    pub(crate) token: InMemoryToken,
    pub(crate) attestation: InMemoryAttestation,
    pub(crate) messenger: InMemoryMessenger,
    pub(crate) rebase: RebaseIndex,
    pub(crate) registry: LayerRegistry,
    pub(crate) sequencer_ledger: StakingLedger<SequencerPolicy>,
    pub(crate) candidate_ledger: StakingLedger<CandidatePolicy>,
    pub(crate) fast_withdraw: FastWithdrawProtocol,
    pub(crate) events: EventLog,
    pub(crate) next_nonce: u64,
}

impl StakingContext {
    /// Build an empty ledger state from validated parameters, with issuance
    /// counted from `genesis`.
    pub fn new(params: &ProtocolParams, genesis: BlockEnv) -> Result<Self, KeelError> {
        let rebase = RebaseIndex::from_params(params, genesis.number)?;
        info!(
            block = genesis.number,
            rate = params.issuance_rate_per_block,
            interval = params.min_block_interval,
            "ledger state initialised"
        );
        Ok(Self {
            block: genesis,
            token: InMemoryToken::new(),
            attestation: InMemoryAttestation::new(),
            messenger: InMemoryMessenger::new(),
            rebase,
            registry: LayerRegistry::new(registry_vault(), params),
            sequencer_ledger: StakingLedger::new(SequencerPolicy, staking_vault()),
            candidate_ledger: StakingLedger::new(CandidatePolicy, staking_vault()),
            fast_withdraw: FastWithdrawProtocol::new(fast_withdraw_account()),
            events: EventLog::new(),
            next_nonce: 0,
        })
    }

    // --- block environment ---

    pub fn block(&self) -> BlockEnv {
        self.block
    }

    /// Move the chain forward by `blocks`, `seconds_per_block` apart.
    pub fn advance(&mut self, blocks: u64, seconds_per_block: u64) {
        self.block.number = self.block.number.saturating_add(blocks);
        self.block.timestamp = self
            .block
            .timestamp
            .saturating_add(blocks.saturating_mul(seconds_per_block));
        debug!(block = self.block.number, timestamp = self.block.timestamp, "advanced");
    }

    // --- collaborators ---

    pub fn token(&self) -> &InMemoryToken {
        &self.token
    }

    /// Direct token access for funding accounts and setting allowances.
    pub fn token_mut(&mut self) -> &mut InMemoryToken {
        &mut self.token
    }

    pub fn attestation_mut(&mut self) -> &mut InMemoryAttestation {
        &mut self.attestation
    }

    pub fn messenger(&self) -> &InMemoryMessenger {
        &self.messenger
    }

    pub fn rebase(&self) -> &RebaseIndex {
        &self.rebase
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    pub fn sequencer_ledger(&self) -> &StakingLedger<SequencerPolicy> {
        &self.sequencer_ledger
    }

    pub fn candidate_ledger(&self) -> &StakingLedger<CandidatePolicy> {
        &self.candidate_ledger
    }

    pub fn fast_withdraw(&self) -> &FastWithdrawProtocol {
        &self.fast_withdraw
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub(crate) fn record(&mut self, event: LedgerEvent) {
        self.events.push(self.block.number, event);
    }

    // --- registry ---

    pub fn create_sequencer(
        &mut self,
        caller: &Address,
        identity: SequencerIdentity,
        deposit: Amount,
    ) -> Result<LayerRecord, KeelError> {
        let record = self.registry.create_sequencer(
            &self.attestation,
            &mut self.token,
            caller,
            identity,
            deposit,
        )?;
        self.record(LedgerEvent::LayerCreated {
            index: record.index,
            key: record.key,
            owner: record.owner,
            deposit,
            total_security_deposit: self.registry.total_security_deposit(),
        });
        Ok(record)
    }

    /// Register a candidate; its deposit is staked from the operator, which
    /// needs an allowance to the staking vault.
    pub fn create_candidate(
        &mut self,
        identity: CandidateIdentity,
        commission: u16,
        deposit: Amount,
    ) -> Result<LayerRecord, KeelError> {
        let (record, receipt) = self.registry.create_candidate(
            &mut self.candidate_ledger,
            &self.rebase,
            &mut self.token,
            identity,
            commission,
            deposit,
        )?;
        self.record(LedgerEvent::CandidateCreated {
            index: record.index,
            key: record.key,
            operator: record.owner,
            sequencer_index: identity.sequencer_index,
            commission,
            deposit,
        });
        self.record_staked(LayerKind::Candidate, record.index, &record.owner, &receipt);
        Ok(record)
    }

    pub fn increase_security_deposit(
        &mut self,
        caller: &Address,
        index: LayerIndex,
        amount: Amount,
    ) -> Result<DepositChange, KeelError> {
        let change = self
            .registry
            .increase_security_deposit(&mut self.token, caller, index, amount)?;
        self.record_deposit_change(index, caller, change);
        Ok(change)
    }

    pub fn decrease_security_deposit(
        &mut self,
        caller: &Address,
        index: LayerIndex,
        amount: Amount,
    ) -> Result<DepositChange, KeelError> {
        let change = self
            .registry
            .decrease_security_deposit(&mut self.token, caller, index, amount)?;
        self.record_deposit_change(index, caller, change);
        Ok(change)
    }

    fn record_deposit_change(&mut self, index: LayerIndex, caller: &Address, change: DepositChange) {
        self.record(LedgerEvent::SecurityDepositChanged {
            index,
            caller: *caller,
            before: change.before,
            after: change.after,
            total_security_deposit: self.registry.total_security_deposit(),
        });
    }

    pub fn deactivate_sequencer(&mut self, caller: &Address, index: LayerIndex) -> Result<Amount, KeelError> {
        let returned = self
            .registry
            .deactivate_sequencer(&mut self.token, caller, index)?;
        self.record(LedgerEvent::LayerDeactivated {
            kind: LayerKind::Sequencer,
            index,
            returned,
        });
        Ok(returned)
    }

    // --- staking ---

    /// Stake through an allowance to the staking vault.
    pub fn stake(
        &mut self,
        kind: LayerKind,
        entry: LayerIndex,
        account: &Address,
        principal: Amount,
    ) -> Result<StakeReceipt, KeelError> {
        let receipt = match kind {
            LayerKind::Sequencer => self.sequencer_ledger.stake(
                &self.registry,
                &self.rebase,
                &mut self.token,
                entry,
                account,
                principal,
            )?,
            LayerKind::Candidate => self.candidate_ledger.stake(
                &self.registry,
                &self.rebase,
                &mut self.token,
                entry,
                account,
                principal,
            )?,
        };
        self.record_staked(kind, entry, account, &receipt);
        Ok(receipt)
    }

    /// Stake in one call without a prior allowance.
    pub fn pull_and_stake(
        &mut self,
        kind: LayerKind,
        entry: LayerIndex,
        account: &Address,
        principal: Amount,
    ) -> Result<StakeReceipt, KeelError> {
        let receipt = match kind {
            LayerKind::Sequencer => self.sequencer_ledger.pull_and_stake(
                &self.registry,
                &self.rebase,
                &mut self.token,
                entry,
                account,
                principal,
            )?,
            LayerKind::Candidate => self.candidate_ledger.pull_and_stake(
                &self.registry,
                &self.rebase,
                &mut self.token,
                entry,
                account,
                principal,
            )?,
        };
        self.record_staked(kind, entry, account, &receipt);
        Ok(receipt)
    }

    fn record_staked(&mut self, kind: LayerKind, entry: LayerIndex, account: &Address, receipt: &StakeReceipt) {
        self.record(LedgerEvent::Staked {
            kind,
            entry,
            account: *account,
            principal: receipt.principal,
            shares: receipt.shares,
            balance_after: receipt.balance_after,
            entry_total_after: receipt.entry_total_after,
        });
    }

    /// Queue `shares` for withdrawal after the unbonding delay.
    ///
    /// A candidate operator that unstakes its whole bond deactivates the
    /// candidate.
    pub fn unstake(
        &mut self,
        kind: LayerKind,
        entry: LayerIndex,
        account: &Address,
        shares: Amount,
    ) -> Result<UnstakeReceipt, KeelError> {
        let block = self.block.number;
        let receipt = match kind {
            LayerKind::Sequencer => self.sequencer_ledger.unstake(
                &self.registry,
                &self.rebase,
                entry,
                account,
                shares,
                block,
            )?,
            LayerKind::Candidate => self.candidate_ledger.unstake(
                &self.registry,
                &self.rebase,
                entry,
                account,
                shares,
                block,
            )?,
        };
        self.record(LedgerEvent::Unstaked {
            kind,
            entry,
            account: *account,
            shares: receipt.shares,
            principal: receipt.principal,
            release_block: receipt.release_block,
            balance_after: receipt.balance_after,
        });

        let operator_exit = kind == LayerKind::Candidate
            && receipt.balance_after == 0
            && self.registry.owner_of(kind, entry) == Some(*account)
            && self.registry.is_active(kind, entry);
        if operator_exit {
            self.registry.deactivate_candidate(entry)?;
            self.record(LedgerEvent::LayerDeactivated {
                kind,
                index: entry,
                returned: 0,
            });
        }
        Ok(receipt)
    }

    /// Pay out every matured pending withdrawal.
    pub fn withdraw(
        &mut self,
        kind: LayerKind,
        entry: LayerIndex,
        account: &Address,
    ) -> Result<WithdrawReceipt, KeelError> {
        let block = self.block.number;
        let pending_before = self.amount_of_pendings(kind, entry, account).amount;
        let receipt = match kind {
            LayerKind::Sequencer => self
                .sequencer_ledger
                .withdraw(&mut self.token, entry, account, block)?,
            LayerKind::Candidate => self
                .candidate_ledger
                .withdraw(&mut self.token, entry, account, block)?,
        };
        self.record(LedgerEvent::Withdrawn {
            kind,
            entry,
            account: *account,
            amount: receipt.amount,
            released: receipt.released,
            pending_before,
            pending_after: self.amount_of_pendings(kind, entry, account).amount,
        });
        Ok(receipt)
    }

    pub fn shares_of(&self, kind: LayerKind, entry: LayerIndex, account: &Address) -> Amount {
        match kind {
            LayerKind::Sequencer => self.sequencer_ledger.shares_of(entry, account),
            LayerKind::Candidate => self.candidate_ledger.shares_of(entry, account),
        }
    }

    pub fn principal_of(&self, kind: LayerKind, entry: LayerIndex, account: &Address) -> Result<Amount, KeelError> {
        self.rebase.shares_to_principal(self.shares_of(kind, entry, account))
    }

    pub fn amount_of_pendings(&self, kind: LayerKind, entry: LayerIndex, account: &Address) -> PendingSummary {
        match kind {
            LayerKind::Sequencer => self.sequencer_ledger.amount_of_pendings(entry, account),
            LayerKind::Candidate => self.candidate_ledger.amount_of_pendings(entry, account),
        }
    }

    pub fn available_withdraw(&self, kind: LayerKind, entry: LayerIndex, account: &Address) -> (Amount, usize) {
        let block = self.block.number;
        match kind {
            LayerKind::Sequencer => self.sequencer_ledger.available_withdraw(entry, account, block),
            LayerKind::Candidate => self.candidate_ledger.available_withdraw(entry, account, block),
        }
    }

    /// Shares outstanding across both ledgers.
    pub fn total_shares(&self) -> Amount {
        self.sequencer_ledger.total_shares() + self.candidate_ledger.total_shares()
    }

    // --- issuance and rewards ---

    /// Apply issuance for the blocks elapsed since the last update and mint
    /// each bucket to its holder. Unassigned principal is not minted.
    ///
    /// The index only moves once every mint has gone through; a failure
    /// leaves index, interval, supply and reward pool as they were.
    pub fn update_issuance(&mut self) -> Result<IssuanceResult, KeelError> {
        let current_block = self.block.number;
        let result = self.rebase.preview_issuance(
            current_block,
            self.total_shares(),
            self.registry.layer_basis(),
        )?;
        if result.is_skipped() {
            return Ok(result);
        }

        let supply_before = self.token.total_supply();
        let credited = result.minted - result.unassigned;
        supply_before
            .checked_add(credited)
            .ok_or_else(|| KeelError::ArithmeticOverflow("total supply".to_string()))?;
        self.registry
            .total_undistributed_rewards()
            .checked_add(result.to_layers)
            .ok_or_else(|| KeelError::ArithmeticOverflow("undistributed rewards".to_string()))?;

        if result.to_stakers > 0 {
            self.token.mint(&staking_vault(), result.to_stakers)?;
        }
        if result.to_layers > 0 {
            self.token.mint(&registry_vault(), result.to_layers)?;
            self.registry.add_rewards(result.to_layers)?;
        }
        if let Some(treasury) = result.treasury.filter(|_| result.to_treasury > 0) {
            self.token.mint(&treasury, result.to_treasury)?;
        }
        if let Some(secondary) = result.secondary.filter(|_| result.to_secondary > 0) {
            self.token.mint(&secondary, result.to_secondary)?;
        }
        self.rebase.apply_issuance(current_block, &result);

        self.record(LedgerEvent::IssuanceUpdated {
            elapsed_blocks: result.elapsed_blocks,
            minted: result.minted,
            to_stakers: result.to_stakers,
            to_layers: result.to_layers,
            to_treasury: result.to_treasury,
            to_secondary: result.to_secondary,
            unassigned: result.unassigned,
            index_before: result.index_before,
            index_after: result.index_after,
            supply_before,
            supply_after: self.token.total_supply(),
            undistributed_after: self.registry.total_undistributed_rewards(),
        });
        Ok(result)
    }

    pub fn take_snapshot(&mut self) -> Snapshot {
        let snapshot = self.rebase.take_snapshot(self.block.timestamp);
        self.record(LedgerEvent::SnapshotTaken {
            snapshot_id: snapshot.id,
            index: snapshot.index,
            timestamp: snapshot.timestamp,
        });
        snapshot
    }

    /// Split the undistributed layer reward pool. Records an event only when
    /// something moved.
    pub fn distribute(&mut self) -> Result<DistributionResult, KeelError> {
        let result = self.registry.distribute()?;
        if result.distributed > 0 {
            self.record(LedgerEvent::RewardsDistributed {
                distributed: result.distributed,
                pool_before: result.pool_before,
                pool_after: result.pool_after,
                layers: result.credits.len(),
            });
        }
        Ok(result)
    }

    pub fn claim(&mut self, index: LayerIndex) -> Result<(Address, Amount), KeelError> {
        let (owner, amount) = self.registry.claim(&mut self.token, index)?;
        self.record(LedgerEvent::RewardsClaimed {
            index,
            owner,
            amount,
        });
        Ok((owner, amount))
    }

    // --- parameters ---

    fn record_param(&mut self, name: &str, before: String, after: String) {
        info!(name, before = %before, after = %after, "parameter changed");
        self.record(LedgerEvent::ParametersChanged {
            name: name.to_string(),
            before,
            after,
        });
    }

    pub fn set_issuance_rate(&mut self, rate: Amount) -> Result<(), KeelError> {
        let before = self.rebase.issuance_rate_per_block();
        self.rebase.set_issuance_rate(rate)?;
        self.record_param("issuance_rate_per_block", before.to_string(), rate.to_string());
        Ok(())
    }

    pub fn set_min_block_interval(&mut self, interval: u64) -> Result<(), KeelError> {
        let before = self.rebase.min_block_interval();
        self.rebase.set_min_block_interval(interval)?;
        self.record_param("min_block_interval", before.to_string(), interval.to_string());
        Ok(())
    }

    pub fn set_dividend_rates(&mut self, split: DividendSplit) -> Result<(), KeelError> {
        let before = self.rebase.dividend();
        self.rebase.set_dividend_rates(split)?;
        self.record_param("dividend", format!("{:?}", before), format!("{:?}", split));
        Ok(())
    }

    pub fn set_payout_addresses(
        &mut self,
        treasury: Option<Address>,
        secondary: Option<Address>,
    ) -> Result<(), KeelError> {
        let before = self.rebase.payout_addresses();
        self.rebase.set_payout_addresses(treasury, secondary)?;
        let after = self.rebase.payout_addresses();
        self.record_param("payout_addresses", format!("{:?}", before), format!("{:?}", after));
        Ok(())
    }

    pub fn set_max_layer_count(&mut self, max: u32) -> Result<(), KeelError> {
        let before = self.registry.max_layer_count();
        self.registry.set_max_layer_count(max)?;
        self.record_param("max_layer_count", before.to_string(), max.to_string());
        Ok(())
    }

    pub fn set_minimum_deposit_for_sequencer(&mut self, amount: Amount) -> Result<(), KeelError> {
        let before = self.registry.minimum_deposit_for_sequencer();
        self.registry.set_minimum_deposit_for_sequencer(amount)?;
        self.record_param("minimum_deposit_for_sequencer", before.to_string(), amount.to_string());
        Ok(())
    }

    pub fn set_minimum_deposit_for_candidate(&mut self, amount: Amount) -> Result<(), KeelError> {
        let before = self.registry.minimum_deposit_for_candidate();
        self.registry.set_minimum_deposit_for_candidate(amount)?;
        self.record_param("minimum_deposit_for_candidate", before.to_string(), amount.to_string());
        Ok(())
    }

    pub fn set_delay_blocks_for_withdraw(&mut self, blocks: u64) -> Result<(), KeelError> {
        let before = self.registry.delay_blocks_for_withdraw();
        self.registry.set_delay_blocks_for_withdraw(blocks)?;
        self.record_param("delay_blocks_for_withdraw", before.to_string(), blocks.to_string());
        Ok(())
    }

    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            block: self.block,
            index: self.rebase.index(),
            total_supply: self.token.total_supply(),
            sequencer_shares: self.sequencer_ledger.total_shares(),
            candidate_shares: self.candidate_ledger.total_shares(),
            total_security_deposit: self.registry.total_security_deposit(),
            total_external_deposits: self.registry.total_external_deposits(),
            undistributed_rewards: self.registry.total_undistributed_rewards(),
            sequencers: self.registry.all_sequencers().len(),
            candidates: self.registry.all_candidates().len(),
            confirmed_messages: self.messenger.confirmed_count(),
            events: self.events.len(),
        }
    }

    pub fn summary_json(&self) -> Result<String, KeelError> {
        Ok(serde_json::to_string(&self.summary())?)
    }
}
