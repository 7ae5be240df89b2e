// crates/keel-economics/src/registry.rs
//
// Layer registry: sequencer layers and the candidate operators bonded under
// them.
//
// Records are stored by index (sequencers and candidates each count from 1).
// The content hash of a record's identifying attributes is kept as a
// derived, externally verifiable key that makes registration idempotent.
//
// The registry vault holds every security deposit and the reward pool.
// Rewards flow in from the issuance layer bucket, are split across active
// sequencer layers by their share of externally bridged deposits, and are
// claimed by each layer's owner. Integer-division dust stays in the pool.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use keel_core::crypto::hash_concat;
use keel_core::error::KeelError;
use keel_core::traits::{SequencerAttestation, TokenLedger};
use keel_core::{Address, Amount, LayerIndex, LayerKey, LayerKind};

use crate::fixed::mul_div;
use crate::params::ProtocolParams;
use crate::rebase::RebaseIndex;
use crate::staking::{CandidatePolicy, LayerDirectory, StakeReceipt, StakingLedger};

/// Identifying attributes of a sequencer layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerIdentity {
    pub name: String,
    /// Record consulted for the attested sequencer.
    pub address_manager: Address,
    pub l1_bridge: Address,
    /// Only this bridge may originate fast-withdraw messages for the layer.
    pub l2_bridge: Address,
    pub l2_token: Address,
}

impl SequencerIdentity {
    /// SHA-256 over the four address fields in declaration order.
    pub fn key(&self) -> LayerKey {
        LayerKey(hash_concat(&[
            self.address_manager.as_bytes(),
            self.l1_bridge.as_bytes(),
            self.l2_bridge.as_bytes(),
            self.l2_token.as_bytes(),
        ]))
    }
}

/// Identifying attributes of a candidate operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateIdentity {
    pub operator: Address,
    pub sequencer_index: LayerIndex,
    pub salt: u64,
}

impl CandidateIdentity {
    pub fn key(&self) -> LayerKey {
        LayerKey(hash_concat(&[
            self.operator.as_bytes(),
            &self.sequencer_index.to_be_bytes(),
            &self.salt.to_be_bytes(),
        ]))
    }
}

/// A registered layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub index: LayerIndex,
    pub key: LayerKey,
    pub kind: LayerKind,
    pub owner: Address,
    /// Locked by a sequencer's owner. Candidate bonds live in the candidate ledger.
    pub security_deposit: Amount,
    pub external_deposit_total: Amount,
    pub reward_holdings: Amount,
    pub parent_sequencer: Option<LayerIndex>,
    /// Basis points; stored for an external reward-split calculator.
    pub commission: u16,
    pub active: bool,
    pub identity: Option<SequencerIdentity>,
}

/// Result of [`LayerRegistry::distribute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionResult {
    pub distributed: Amount,
    pub pool_before: Amount,
    pub pool_after: Amount,
    /// (layer index, amount credited) for every layer that received rewards.
    pub credits: Vec<(LayerIndex, Amount)>,
}

/// Before and after of a deposit change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositChange {
    pub before: Amount,
    pub after: Amount,
}

#[derive(Debug, Clone)]
pub struct LayerRegistry {
    vault: Address,
    sequencers: BTreeMap<LayerIndex, LayerRecord>,
    candidates: BTreeMap<LayerIndex, LayerRecord>,
    keys: BTreeMap<LayerKey, (LayerKind, LayerIndex)>,
    total_security_deposit: Amount,
    total_external_deposits: Amount,
    total_undistributed_rewards: Amount,
    minimum_deposit_for_sequencer: Amount,
    minimum_deposit_for_candidate: Amount,
    delay_blocks_for_withdraw: u64,
    max_layer_count: u32,
}

impl LayerRegistry {
    pub fn new(vault: Address, params: &ProtocolParams) -> Self {
        Self {
            vault,
            sequencers: BTreeMap::new(),
            candidates: BTreeMap::new(),
            keys: BTreeMap::new(),
            total_security_deposit: 0,
            total_external_deposits: 0,
            total_undistributed_rewards: 0,
            minimum_deposit_for_sequencer: params.minimum_deposit_for_sequencer,
            minimum_deposit_for_candidate: params.minimum_deposit_for_candidate,
            delay_blocks_for_withdraw: params.delay_blocks_for_withdraw,
            max_layer_count: params.max_layer_count,
        }
    }

    pub fn vault(&self) -> Address {
        self.vault
    }

    /// Register a sequencer layer and pull its security deposit.
    ///
    /// # Errors
    /// - `NotAttestedSequencer` if `caller` is not the attested sequencer of
    ///   `identity.address_manager`.
    /// - `InsufficientDeposit` below the sequencer minimum.
    /// - `LayerLimitReached` at `max_layer_count` sequencer layers.
    /// - `DuplicateLayerKey` if the identity is already registered.
    pub fn create_sequencer(
        &mut self,
        attestation: &dyn SequencerAttestation,
        token: &mut dyn TokenLedger,
        caller: &Address,
        identity: SequencerIdentity,
        deposit: Amount,
    ) -> Result<LayerRecord, KeelError> {
        if attestation.attested_sequencer(&identity.address_manager) != Some(*caller) {
            return Err(KeelError::NotAttestedSequencer(*caller));
        }
        if deposit < self.minimum_deposit_for_sequencer {
            return Err(KeelError::InsufficientDeposit {
                amount: deposit,
                minimum: self.minimum_deposit_for_sequencer,
            });
        }
        if self.sequencers.len() as u32 >= self.max_layer_count {
            return Err(KeelError::LayerLimitReached {
                max: self.max_layer_count,
            });
        }
        let key = identity.key();
        if self.keys.contains_key(&key) {
            return Err(KeelError::DuplicateLayerKey(key.to_string()));
        }
        let total = self
            .total_security_deposit
            .checked_add(deposit)
            .ok_or_else(|| KeelError::ArithmeticOverflow("total security deposit".to_string()))?;

        token.transfer_from(&self.vault, caller, &self.vault, deposit)?;

        let index = self.sequencers.len() as LayerIndex + 1;
        let record = LayerRecord {
            index,
            key,
            kind: LayerKind::Sequencer,
            owner: *caller,
            security_deposit: deposit,
            external_deposit_total: 0,
            reward_holdings: 0,
            parent_sequencer: None,
            commission: 0,
            active: true,
            identity: Some(identity),
        };
        self.sequencers.insert(index, record.clone());
        self.keys.insert(key, (LayerKind::Sequencer, index));
        self.total_security_deposit = total;

        info!(index, key = %key, owner = %caller, deposit, "sequencer layer created");
        Ok(record)
    }

    /// Register a candidate operator under an active sequencer layer and
    /// stake its deposit into the candidate ledger as the operator's bond.
    pub fn create_candidate(
        &mut self,
        ledger: &mut StakingLedger<CandidatePolicy>,
        rebase: &RebaseIndex,
        token: &mut dyn TokenLedger,
        identity: CandidateIdentity,
        commission: u16,
        deposit: Amount,
    ) -> Result<(LayerRecord, StakeReceipt), KeelError> {
        let parent = identity.sequencer_index;
        self.require_active(LayerKind::Sequencer, parent)?;
        if deposit < self.minimum_deposit_for_candidate {
            return Err(KeelError::InsufficientDeposit {
                amount: deposit,
                minimum: self.minimum_deposit_for_candidate,
            });
        }
        let key = identity.key();
        if self.keys.contains_key(&key) {
            return Err(KeelError::DuplicateLayerKey(key.to_string()));
        }

        let index = self.candidates.len() as LayerIndex + 1;
        let record = LayerRecord {
            index,
            key,
            kind: LayerKind::Candidate,
            owner: identity.operator,
            security_deposit: 0,
            external_deposit_total: 0,
            reward_holdings: 0,
            parent_sequencer: Some(parent),
            commission,
            active: true,
            identity: None,
        };
        self.candidates.insert(index, record.clone());
        self.keys.insert(key, (LayerKind::Candidate, index));

        match ledger.stake(&*self, rebase, token, index, &identity.operator, deposit) {
            Ok(receipt) => {
                info!(
                    index,
                    key = %key,
                    operator = %identity.operator,
                    sequencer = parent,
                    deposit,
                    "candidate operator created"
                );
                Ok((record, receipt))
            }
            Err(e) => {
                self.candidates.remove(&index);
                self.keys.remove(&key);
                Err(e)
            }
        }
    }

    /// Add to a sequencer layer's security deposit. Anyone may pay in.
    pub fn increase_security_deposit(
        &mut self,
        token: &mut dyn TokenLedger,
        caller: &Address,
        index: LayerIndex,
        amount: Amount,
    ) -> Result<DepositChange, KeelError> {
        if amount == 0 {
            return Err(KeelError::ZeroAmount);
        }
        self.require_active(LayerKind::Sequencer, index)?;
        token.transfer_from(&self.vault, caller, &self.vault, amount)?;

        let record = self.sequencer_mut(index)?;
        let before = record.security_deposit;
        record.security_deposit += amount;
        let after = record.security_deposit;
        self.total_security_deposit += amount;
        info!(index, caller = %caller, before, after, "security deposit increased");
        Ok(DepositChange { before, after })
    }

    /// Return part of a sequencer layer's deposit to its owner, keeping at
    /// least the sequencer minimum.
    pub fn decrease_security_deposit(
        &mut self,
        token: &mut dyn TokenLedger,
        caller: &Address,
        index: LayerIndex,
        amount: Amount,
    ) -> Result<DepositChange, KeelError> {
        if amount == 0 {
            return Err(KeelError::ZeroAmount);
        }
        self.require_active(LayerKind::Sequencer, index)?;
        let minimum = self.minimum_deposit_for_sequencer;
        let record = self.sequencer(index)?;
        if record.owner != *caller {
            return Err(KeelError::Unauthorized {
                caller: *caller,
                expected: record.owner,
            });
        }
        let before = record.security_deposit;
        let remaining = before.checked_sub(amount).ok_or(KeelError::InsufficientDeposit {
            amount: 0,
            minimum,
        })?;
        if remaining < minimum {
            return Err(KeelError::InsufficientDeposit {
                amount: remaining,
                minimum,
            });
        }

        token.transfer(&self.vault, caller, amount)?;

        self.sequencer_mut(index)?.security_deposit = remaining;
        self.total_security_deposit -= amount;
        info!(index, before, after = remaining, "security deposit decreased");
        Ok(DepositChange {
            before,
            after: remaining,
        })
    }

    /// Deactivate a sequencer layer and return its whole deposit to the
    /// owner. Its external deposits stop counting toward distribution; reward
    /// holdings stay claimable.
    pub fn deactivate_sequencer(
        &mut self,
        token: &mut dyn TokenLedger,
        caller: &Address,
        index: LayerIndex,
    ) -> Result<Amount, KeelError> {
        self.require_active(LayerKind::Sequencer, index)?;
        let record = self.sequencer(index)?;
        if record.owner != *caller {
            return Err(KeelError::Unauthorized {
                caller: *caller,
                expected: record.owner,
            });
        }
        let returned = record.security_deposit;
        let external = record.external_deposit_total;
        if returned > 0 {
            token.transfer(&self.vault, caller, returned)?;
        }

        let record = self.sequencer_mut(index)?;
        record.security_deposit = 0;
        record.active = false;
        self.total_security_deposit -= returned;
        self.total_external_deposits -= external;
        info!(index, returned, "sequencer layer deactivated");
        Ok(returned)
    }

    /// Mark a candidate inactive after its operator fully exits.
    pub fn deactivate_candidate(&mut self, index: LayerIndex) -> Result<(), KeelError> {
        self.require_active(LayerKind::Candidate, index)?;
        if let Some(record) = self.candidates.get_mut(&index) {
            record.active = false;
        }
        info!(index, "candidate operator deactivated");
        Ok(())
    }

    /// Apply net bridged deposit activity reported for a sequencer layer.
    pub fn record_external_deposit(&mut self, index: LayerIndex, delta: i128) -> Result<DepositChange, KeelError> {
        self.require_active(LayerKind::Sequencer, index)?;
        let record = self.sequencer(index)?;
        let before = record.external_deposit_total;
        let magnitude = delta.unsigned_abs();
        let after = if delta >= 0 {
            before
                .checked_add(magnitude)
                .ok_or_else(|| KeelError::ArithmeticOverflow("external deposits".to_string()))?
        } else {
            before.checked_sub(magnitude).ok_or_else(|| {
                KeelError::Invariant(format!(
                    "withdrawal of {} exceeds external deposits {} of layer {}",
                    magnitude, before, index
                ))
            })?
        };

        self.sequencer_mut(index)?.external_deposit_total = after;
        self.total_external_deposits = self.total_external_deposits - before + after;
        debug!(index, delta, before, after, "external deposit recorded");
        Ok(DepositChange { before, after })
    }

    /// Credit the undistributed pool. The matching principal must already be
    /// held by the registry vault.
    pub fn add_rewards(&mut self, amount: Amount) -> Result<(), KeelError> {
        self.total_undistributed_rewards = self
            .total_undistributed_rewards
            .checked_add(amount)
            .ok_or_else(|| KeelError::ArithmeticOverflow("undistributed rewards".to_string()))?;
        Ok(())
    }

    /// Split the undistributed pool across active sequencer layers by their
    /// external deposits. With no weight at all the pool is left untouched.
    pub fn distribute(&mut self) -> Result<DistributionResult, KeelError> {
        let pool_before = self.total_undistributed_rewards;
        let total_weight = self.total_external_deposits;
        if pool_before == 0 || total_weight == 0 {
            debug!(pool = pool_before, total_weight, "nothing to distribute");
            return Ok(DistributionResult {
                distributed: 0,
                pool_before,
                pool_after: pool_before,
                credits: Vec::new(),
            });
        }

        let mut credits = Vec::new();
        for record in self.sequencers.values() {
            if !record.active || record.external_deposit_total == 0 {
                continue;
            }
            let share = mul_div(pool_before, record.external_deposit_total, total_weight)?;
            if share > 0 {
                credits.push((record.index, share));
            }
        }

        let distributed: Amount = credits.iter().map(|(_, amount)| *amount).sum();
        for (index, amount) in &credits {
            self.sequencer_mut(*index)?.reward_holdings += *amount;
        }
        self.total_undistributed_rewards = pool_before - distributed;

        info!(
            distributed,
            pool_after = self.total_undistributed_rewards,
            layers = credits.len(),
            "rewards distributed"
        );
        Ok(DistributionResult {
            distributed,
            pool_before,
            pool_after: self.total_undistributed_rewards,
            credits,
        })
    }

    /// Pay a layer's reward holdings to its owner. Anyone may trigger it.
    pub fn claim(&mut self, token: &mut dyn TokenLedger, index: LayerIndex) -> Result<(Address, Amount), KeelError> {
        let record = self.sequencer(index)?;
        let amount = record.reward_holdings;
        let owner = record.owner;
        if amount == 0 {
            return Err(KeelError::NothingToClaim(index));
        }
        token.transfer(&self.vault, &owner, amount)?;
        self.sequencer_mut(index)?.reward_holdings = 0;
        info!(index, owner = %owner, amount, "rewards claimed");
        Ok((owner, amount))
    }

    pub fn set_max_layer_count(&mut self, max: u32) -> Result<(), KeelError> {
        if max == self.max_layer_count {
            return Err(KeelError::SameValue("max_layer_count".to_string()));
        }
        self.max_layer_count = max;
        Ok(())
    }

    pub fn set_minimum_deposit_for_sequencer(&mut self, amount: Amount) -> Result<(), KeelError> {
        if amount == self.minimum_deposit_for_sequencer {
            return Err(KeelError::SameValue("minimum_deposit_for_sequencer".to_string()));
        }
        self.minimum_deposit_for_sequencer = amount;
        Ok(())
    }

    pub fn set_minimum_deposit_for_candidate(&mut self, amount: Amount) -> Result<(), KeelError> {
        if amount == self.minimum_deposit_for_candidate {
            return Err(KeelError::SameValue("minimum_deposit_for_candidate".to_string()));
        }
        self.minimum_deposit_for_candidate = amount;
        Ok(())
    }

    pub fn set_delay_blocks_for_withdraw(&mut self, blocks: u64) -> Result<(), KeelError> {
        if blocks == self.delay_blocks_for_withdraw {
            return Err(KeelError::SameValue("delay_blocks_for_withdraw".to_string()));
        }
        self.delay_blocks_for_withdraw = blocks;
        Ok(())
    }

    pub fn sequencer(&self, index: LayerIndex) -> Result<&LayerRecord, KeelError> {
        self.sequencers.get(&index).ok_or(KeelError::NonRegisteredLayer {
            kind: LayerKind::Sequencer,
            index,
        })
    }

    pub fn candidate(&self, index: LayerIndex) -> Result<&LayerRecord, KeelError> {
        self.candidates.get(&index).ok_or(KeelError::NonRegisteredLayer {
            kind: LayerKind::Candidate,
            index,
        })
    }

    pub fn record(&self, kind: LayerKind, index: LayerIndex) -> Result<&LayerRecord, KeelError> {
        match kind {
            LayerKind::Sequencer => self.sequencer(index),
            LayerKind::Candidate => self.candidate(index),
        }
    }

    fn sequencer_mut(&mut self, index: LayerIndex) -> Result<&mut LayerRecord, KeelError> {
        self.sequencers.get_mut(&index).ok_or(KeelError::NonRegisteredLayer {
            kind: LayerKind::Sequencer,
            index,
        })
    }

    fn require_active(&self, kind: LayerKind, index: LayerIndex) -> Result<(), KeelError> {
        if self.record(kind, index)?.active {
            Ok(())
        } else {
            Err(KeelError::InactiveLayer { kind, index })
        }
    }

    pub fn layer_key_exists(&self, key: &LayerKey) -> bool {
        self.keys.contains_key(key)
    }

    /// Resolve a content key back to the record it identifies.
    pub fn lookup_key(&self, key: &LayerKey) -> Option<(LayerKind, LayerIndex)> {
        self.keys.get(key).copied()
    }

    pub fn sequencer_key(&self, index: LayerIndex) -> Option<LayerKey> {
        self.sequencers.get(&index).map(|r| r.key)
    }

    pub fn candidate_key(&self, index: LayerIndex) -> Option<LayerKey> {
        self.candidates.get(&index).map(|r| r.key)
    }

    pub fn all_sequencers(&self) -> Vec<LayerIndex> {
        self.sequencers.keys().copied().collect()
    }

    pub fn all_candidates(&self) -> Vec<LayerIndex> {
        self.candidates.keys().copied().collect()
    }

    pub fn sequencer_count(&self) -> usize {
        self.sequencers.len()
    }

    pub fn total_security_deposit(&self) -> Amount {
        self.total_security_deposit
    }

    pub fn total_external_deposits(&self) -> Amount {
        self.total_external_deposits
    }

    /// Weighting basis for the issuance layer bucket.
    pub fn layer_basis(&self) -> Amount {
        self.total_security_deposit
            .saturating_add(self.total_external_deposits)
    }

    pub fn total_undistributed_rewards(&self) -> Amount {
        self.total_undistributed_rewards
    }

    /// Security deposits plus reward holdings plus the undistributed pool.
    /// Never exceeds the registry vault's token balance.
    pub fn total_obligations(&self) -> Amount {
        let holdings: Amount = self.sequencers.values().map(|r| r.reward_holdings).sum();
        self.total_security_deposit + holdings + self.total_undistributed_rewards
    }

    pub fn minimum_deposit_for_sequencer(&self) -> Amount {
        self.minimum_deposit_for_sequencer
    }

    pub fn minimum_deposit_for_candidate(&self) -> Amount {
        self.minimum_deposit_for_candidate
    }

    pub fn delay_blocks_for_withdraw(&self) -> u64 {
        self.delay_blocks_for_withdraw
    }

    pub fn max_layer_count(&self) -> u32 {
        self.max_layer_count
    }
}

impl LayerDirectory for LayerRegistry {
    fn exists(&self, kind: LayerKind, index: LayerIndex) -> bool {
        self.record(kind, index).is_ok()
    }

    fn is_active(&self, kind: LayerKind, index: LayerIndex) -> bool {
        self.record(kind, index).map(|r| r.active).unwrap_or(false)
    }

    fn owner_of(&self, kind: LayerKind, index: LayerIndex) -> Option<Address> {
        self.record(kind, index).ok().map(|r| r.owner)
    }

    fn minimum_deposit(&self, kind: LayerKind) -> Amount {
        match kind {
            LayerKind::Sequencer => self.minimum_deposit_for_sequencer,
            LayerKind::Candidate => self.minimum_deposit_for_candidate,
        }
    }

    fn delay_blocks(&self) -> u64 {
        self.delay_blocks_for_withdraw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebase::DividendSplit;
    use crate::token::InMemoryToken;

    struct Attest(Address);

    impl SequencerAttestation for Attest {
        fn attested_sequencer(&self, _address_manager: &Address) -> Option<Address> {
            Some(self.0)
        }
    }

    fn params() -> ProtocolParams {
        ProtocolParams {
            minimum_deposit_for_sequencer: 100,
            minimum_deposit_for_candidate: 200,
            max_layer_count: 3,
            ..ProtocolParams::default()
        }
    }

    fn identity(tag: &str) -> SequencerIdentity {
        SequencerIdentity {
            name: tag.to_string(),
            address_manager: Address::from_label(&format!("{}/am", tag)),
            l1_bridge: Address::from_label(&format!("{}/l1", tag)),
            l2_bridge: Address::from_label(&format!("{}/l2", tag)),
            l2_token: Address::from_label(&format!("{}/token", tag)),
        }
    }

    struct Fixture {
        registry: LayerRegistry,
        token: InMemoryToken,
        seq: Address,
    }

    fn fixture() -> Fixture {
        let vault = Address::from_label("keel/registry-vault");
        let seq = Address::from_label("sequencer");
        let mut token = InMemoryToken::new();
        token.mint(&seq, 10_000).unwrap();
        token.approve(&seq, &vault, 10_000);
        Fixture {
            registry: LayerRegistry::new(vault, &params()),
            token,
            seq,
        }
    }

    #[test]
    fn test_create_sequencer() {
        let mut f = fixture();
        let record = f
            .registry
            .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 150)
            .unwrap();
        assert_eq!(record.index, 1);
        assert!(f.registry.layer_key_exists(&identity("a").key()));
        assert_eq!(f.registry.sequencer_key(1), Some(identity("a").key()));
        assert_eq!(f.registry.total_security_deposit(), 150);
        assert_eq!(f.token.balance_of(&f.registry.vault()), 150);
    }

    #[test]
    fn test_create_sequencer_guards() {
        let mut f = fixture();
        let stranger = Address::from_label("stranger");
        assert_eq!(
            f.registry
                .create_sequencer(&Attest(stranger), &mut f.token, &f.seq, identity("a"), 150),
            Err(KeelError::NotAttestedSequencer(f.seq))
        );
        assert_eq!(
            f.registry
                .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 99),
            Err(KeelError::InsufficientDeposit {
                amount: 99,
                minimum: 100
            })
        );
        f.registry
            .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 100)
            .unwrap();
        assert!(matches!(
            f.registry
                .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 100),
            Err(KeelError::DuplicateLayerKey(_))
        ));
        f.registry.set_max_layer_count(1).unwrap();
        assert_eq!(
            f.registry
                .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("b"), 100),
            Err(KeelError::LayerLimitReached { max: 1 })
        );
    }

    #[test]
    fn test_deposit_increase_and_decrease() {
        let mut f = fixture();
        f.registry
            .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 100)
            .unwrap();

        let funder = Address::from_label("funder");
        f.token.mint(&funder, 50).unwrap();
        f.token.approve(&funder, &f.registry.vault(), 50);
        let change = f
            .registry
            .increase_security_deposit(&mut f.token, &funder, 1, 50)
            .unwrap();
        assert_eq!(change, DepositChange { before: 100, after: 150 });

        assert!(matches!(
            f.registry.decrease_security_deposit(&mut f.token, &funder, 1, 10),
            Err(KeelError::Unauthorized { .. })
        ));
        assert_eq!(
            f.registry.decrease_security_deposit(&mut f.token, &f.seq, 1, 51),
            Err(KeelError::InsufficientDeposit {
                amount: 99,
                minimum: 100
            })
        );
        let seq = f.seq;
        let before = f.token.balance_of(&seq);
        f.registry
            .decrease_security_deposit(&mut f.token, &seq, 1, 50)
            .unwrap();
        assert_eq!(f.token.balance_of(&seq), before + 50);
        assert_eq!(f.registry.total_security_deposit(), 100);
    }

    #[test]
    fn test_deactivate_returns_deposit() {
        let mut f = fixture();
        f.registry
            .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 300)
            .unwrap();
        f.registry.record_external_deposit(1, 40).unwrap();
        let seq = f.seq;
        assert_eq!(f.registry.deactivate_sequencer(&mut f.token, &seq, 1).unwrap(), 300);
        assert!(!f.registry.is_active(LayerKind::Sequencer, 1));
        assert_eq!(f.registry.total_security_deposit(), 0);
        assert_eq!(f.registry.total_external_deposits(), 0);
        assert!(matches!(
            f.registry.record_external_deposit(1, 1),
            Err(KeelError::InactiveLayer { .. })
        ));
    }

    #[test]
    fn test_external_deposit_tracking() {
        let mut f = fixture();
        f.registry
            .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 100)
            .unwrap();
        f.registry.record_external_deposit(1, 500).unwrap();
        let change = f.registry.record_external_deposit(1, -200).unwrap();
        assert_eq!(change, DepositChange { before: 500, after: 300 });
        assert!(matches!(
            f.registry.record_external_deposit(1, -301),
            Err(KeelError::Invariant(_))
        ));
        assert_eq!(f.registry.total_external_deposits(), 300);
        assert_eq!(f.registry.layer_basis(), 400);
    }

    #[test]
    fn test_distribute_weights_by_external_deposits() {
        let mut f = fixture();
        for tag in ["a", "b", "c"] {
            f.registry
                .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity(tag), 100)
                .unwrap();
        }
        f.registry.record_external_deposit(1, 100).unwrap();
        f.registry.record_external_deposit(2, 200).unwrap();

        f.token.mint(&f.registry.vault(), 1_000).unwrap();
        f.registry.add_rewards(1_000).unwrap();
        let result = f.registry.distribute().unwrap();
        assert_eq!(result.credits, vec![(1, 333), (2, 666)]);
        assert_eq!(result.pool_after, 1);
        assert_eq!(f.registry.total_undistributed_rewards(), 1);
        assert_eq!(f.registry.sequencer(3).unwrap().reward_holdings, 0);

        let vault = f.registry.vault();
        assert!(f.registry.total_obligations() <= f.token.balance_of(&vault));
    }

    #[test]
    fn test_distribute_without_weight_keeps_pool() {
        let mut f = fixture();
        f.registry
            .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 100)
            .unwrap();
        f.registry.add_rewards(500).unwrap();
        let result = f.registry.distribute().unwrap();
        assert_eq!(result.distributed, 0);
        assert_eq!(f.registry.total_undistributed_rewards(), 500);
    }

    #[test]
    fn test_claim() {
        let mut f = fixture();
        f.registry
            .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 100)
            .unwrap();
        assert_eq!(f.registry.claim(&mut f.token, 1), Err(KeelError::NothingToClaim(1)));

        f.registry.record_external_deposit(1, 10).unwrap();
        f.token.mint(&f.registry.vault(), 70).unwrap();
        f.registry.add_rewards(70).unwrap();
        f.registry.distribute().unwrap();

        let seq = f.seq;
        let before = f.token.balance_of(&seq);
        assert_eq!(f.registry.claim(&mut f.token, 1).unwrap(), (seq, 70));
        assert_eq!(f.token.balance_of(&seq), before + 70);
        assert_eq!(f.registry.claim(&mut f.token, 1), Err(KeelError::NothingToClaim(1)));
    }

    #[test]
    fn test_create_candidate_stakes_bond() {
        let mut f = fixture();
        f.registry
            .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 100)
            .unwrap();
        let staking_vault = Address::from_label("keel/staking-vault");
        let operator = Address::from_label("operator");
        f.token.mint(&operator, 500).unwrap();
        f.token.approve(&operator, &staking_vault, 500);

        let rebase = RebaseIndex::new(10, 300, DividendSplit::default(), 0).unwrap();
        let mut ledger = StakingLedger::new(CandidatePolicy, staking_vault);
        let candidate = CandidateIdentity {
            operator,
            sequencer_index: 1,
            salt: 0,
        };

        assert!(matches!(
            f.registry.create_candidate(&mut ledger, &rebase, &mut f.token, candidate, 0, 199),
            Err(KeelError::InsufficientDeposit { .. })
        ));
        assert!(matches!(
            f.registry.create_candidate(
                &mut ledger,
                &rebase,
                &mut f.token,
                CandidateIdentity { sequencer_index: 2, ..candidate },
                0,
                200
            ),
            Err(KeelError::NonRegisteredLayer { .. })
        ));

        let (record, receipt) = f
            .registry
            .create_candidate(&mut ledger, &rebase, &mut f.token, candidate, 500, 200)
            .unwrap();
        assert_eq!(record.index, 1);
        assert_eq!(record.parent_sequencer, Some(1));
        assert_eq!(receipt.shares, 200);
        assert_eq!(ledger.shares_of(1, &operator), 200);
        assert_eq!(f.registry.all_candidates(), vec![1]);
        assert_eq!(f.registry.candidate_key(1), Some(candidate.key()));
    }

    #[test]
    fn test_failed_candidate_bond_rolls_back() {
        let mut f = fixture();
        f.registry
            .create_sequencer(&Attest(f.seq), &mut f.token, &f.seq, identity("a"), 100)
            .unwrap();
        let operator = Address::from_label("broke-operator");
        let rebase = RebaseIndex::new(10, 300, DividendSplit::default(), 0).unwrap();
        let mut ledger = StakingLedger::new(CandidatePolicy, Address::from_label("keel/staking-vault"));
        let candidate = CandidateIdentity {
            operator,
            sequencer_index: 1,
            salt: 7,
        };
        assert!(matches!(
            f.registry.create_candidate(&mut ledger, &rebase, &mut f.token, candidate, 0, 200),
            Err(KeelError::Token(_))
        ));
        assert!(!f.registry.layer_key_exists(&candidate.key()));
        assert!(f.registry.all_candidates().is_empty());
    }

    #[test]
    fn test_setters_reject_same_value() {
        let mut f = fixture();
        assert!(f.registry.set_max_layer_count(3).is_err());
        assert!(f.registry.set_minimum_deposit_for_sequencer(100).is_err());
        assert!(f.registry.set_minimum_deposit_for_candidate(200).is_err());
        assert!(f.registry.set_delay_blocks_for_withdraw(300).is_err());
        assert!(f.registry.set_delay_blocks_for_withdraw(10).is_ok());
        assert_eq!(f.registry.delay_blocks(), 10);
    }
}
