// crates/keel-fastwithdraw/src/receipt.rs
//
// Fast-withdraw settlement state machine.
//
// Per message key:
//
//   UNSEEN -> NORMAL_WITHDRAWAL
//   UNSEEN -> PROVIDE_LIQUIDITY -> FINALIZED
//   UNSEEN -> CANCELED -> CANCEL_WITHDRAWAL
//
// The settlement table is the only arbitration point between providers,
// requesters and the finalizing bridge relay. Every entry point runs all of
// its guards before the first balance mutation and sets the key's status as
// part of the same call, so a failed attempt leaves nothing behind.
//
// Bridged funds are released to this protocol's account before
// finalization; the protocol then routes them to whoever the key's status
// designates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_core::error::KeelError;
use keel_core::traits::{BridgeMessenger, TokenLedger};
use keel_core::{Address, Amount, FwStatus, LayerIndex, LayerKind, MessageKey};
use keel_economics::rebase::RebaseIndex;
use keel_economics::registry::LayerRegistry;
use keel_economics::staking::{
    CandidatePolicy, LayerDirectory, SequencerPolicy, StakePolicy, StakingLedger,
};

use crate::message::{RelayedMessage, WithdrawMessage};

/// The ledger entry a provider fronts liquidity from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquiditySource {
    pub kind: LayerKind,
    pub entry: LayerIndex,
}

impl LiquiditySource {
    pub fn sequencer(entry: LayerIndex) -> Self {
        Self {
            kind: LayerKind::Sequencer,
            entry,
        }
    }

    pub fn candidate(entry: LayerIndex) -> Self {
        Self {
            kind: LayerKind::Candidate,
            entry,
        }
    }
}

/// Recorded outcome for one message key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub key: MessageKey,
    pub status: FwStatus,
    /// `None` when the message never decoded.
    pub requestor: Option<Address>,
    pub amount: Amount,
    pub fee: Amount,
    pub provided: Amount,
    pub provider: Option<Address>,
    pub source: Option<LiquiditySource>,
    pub canceler: Option<Address>,
}

impl Settlement {
    fn opened(msg: &WithdrawMessage, status: FwStatus) -> Self {
        Self {
            key: msg.key,
            status,
            requestor: Some(msg.requestor()),
            amount: msg.amount(),
            fee: msg.fee(),
            provided: msg.provide_amount(),
            provider: None,
            source: None,
            canceler: None,
        }
    }

    fn rejected(key: MessageKey, status: FwStatus) -> Self {
        Self {
            key,
            status,
            requestor: None,
            amount: 0,
            fee: 0,
            provided: 0,
            provider: None,
            source: None,
            canceler: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvideReceipt {
    pub key: MessageKey,
    pub requestor: Address,
    pub provider: Address,
    pub source: LiquiditySource,
    pub amount: Amount,
    pub fee: Amount,
    pub provided: Amount,
    pub debt_after: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReceipt {
    pub key: MessageKey,
    pub requestor: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReceipt {
    pub key: MessageKey,
    pub status: FwStatus,
    /// Who received the bridged amount. `None` when nothing was paid out.
    pub recipient: Option<Address>,
    pub paid: Amount,
    pub fee_credited: Amount,
    pub fee_shares: Amount,
    pub debt_after: Amount,
}

/// Mutable views the settlement paths need for one call.
pub struct SettlementContext<'a> {
    pub registry: &'a LayerRegistry,
    pub rebase: &'a RebaseIndex,
    pub sequencer_ledger: &'a mut StakingLedger<SequencerPolicy>,
    pub candidate_ledger: &'a mut StakingLedger<CandidatePolicy>,
    pub token: &'a mut dyn TokenLedger,
}

impl SettlementContext<'_> {
    /// Provider principal in the source entry minus outstanding debt.
    pub fn available_liquidity(
        &self,
        source: LiquiditySource,
        provider: &Address,
    ) -> Result<Amount, KeelError> {
        match source.kind {
            LayerKind::Sequencer => {
                self.sequencer_ledger
                    .available_liquidity(self.rebase, source.entry, provider)
            }
            LayerKind::Candidate => {
                self.candidate_ledger
                    .available_liquidity(self.rebase, source.entry, provider)
            }
        }
    }

    fn vault(&self, kind: LayerKind) -> Address {
        match kind {
            LayerKind::Sequencer => self.sequencer_ledger.vault(),
            LayerKind::Candidate => self.candidate_ledger.vault(),
        }
    }

    fn debt_of(&self, source: LiquiditySource, provider: &Address) -> Amount {
        match source.kind {
            LayerKind::Sequencer => self.sequencer_ledger.debt_of(source.entry, provider),
            LayerKind::Candidate => self.candidate_ledger.debt_of(source.entry, provider),
        }
    }

    fn check_debt(
        &self,
        source: LiquiditySource,
        provider: &Address,
        amount: Amount,
    ) -> Result<Amount, KeelError> {
        let (next, _) = match source.kind {
            LayerKind::Sequencer => self.sequencer_ledger.check_debt(source.entry, provider, amount)?,
            LayerKind::Candidate => self.candidate_ledger.check_debt(source.entry, provider, amount)?,
        };
        Ok(next)
    }

    /// Fee shares [`repay`](Self::repay) would credit, or the error it
    /// would fail with.
    fn check_repay(
        &self,
        source: LiquiditySource,
        provider: &Address,
        fee: Amount,
        provided: Amount,
    ) -> Result<Amount, KeelError> {
        let debt = self.debt_of(source, provider);
        if debt < provided {
            return Err(KeelError::Invariant(format!(
                "provider {} debt {} is below fronted {}",
                provider, debt, provided
            )));
        }
        if fee == 0 {
            return Ok(0);
        }
        match source.kind {
            LayerKind::Sequencer => {
                self.sequencer_ledger
                    .check_credit(self.registry, self.rebase, source.entry, fee)
            }
            LayerKind::Candidate => {
                self.candidate_ledger
                    .check_credit(self.registry, self.rebase, source.entry, fee)
            }
        }
    }

    fn add_debt(
        &mut self,
        source: LiquiditySource,
        provider: &Address,
        amount: Amount,
    ) -> Result<Amount, KeelError> {
        match source.kind {
            LayerKind::Sequencer => self.sequencer_ledger.add_debt(source.entry, provider, amount),
            LayerKind::Candidate => self.candidate_ledger.add_debt(source.entry, provider, amount),
        }
    }

    /// Credit the fee as shares and release the fronted principal from debt.
    fn repay(
        &mut self,
        source: LiquiditySource,
        provider: &Address,
        fee: Amount,
        provided: Amount,
    ) -> Result<(Amount, Amount), KeelError> {
        match source.kind {
            LayerKind::Sequencer => repay(
                &mut *self.sequencer_ledger,
                self.registry,
                self.rebase,
                source.entry,
                provider,
                fee,
                provided,
            ),
            LayerKind::Candidate => repay(
                &mut *self.candidate_ledger,
                self.registry,
                self.rebase,
                source.entry,
                provider,
                fee,
                provided,
            ),
        }
    }
}

fn repay<P: StakePolicy>(
    ledger: &mut StakingLedger<P>,
    layers: &dyn LayerDirectory,
    rebase: &RebaseIndex,
    entry: LayerIndex,
    provider: &Address,
    fee: Amount,
    provided: Amount,
) -> Result<(Amount, Amount), KeelError> {
    let shares = if fee > 0 {
        ledger
            .credit_shares(layers, rebase, entry, provider, fee)?
            .shares
    } else {
        0
    };
    let debt_after = ledger.reduce_debt(entry, provider, provided)?;
    Ok((shares, debt_after))
}

/// Settlement table for fast withdrawals routed to `address`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FastWithdrawProtocol {
    address: Address,
    settlements: BTreeMap<MessageKey, Settlement>,
}

impl FastWithdrawProtocol {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            settlements: BTreeMap::new(),
        }
    }

    /// The account relay envelopes must be addressed to.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn status_of(&self, key: &MessageKey) -> FwStatus {
        self.settlements
            .get(key)
            .map(|s| s.status)
            .unwrap_or(FwStatus::Unseen)
    }

    pub fn settlement(&self, key: &MessageKey) -> Option<&Settlement> {
        self.settlements.get(key)
    }

    pub fn settlements(&self) -> impl Iterator<Item = &Settlement> {
        self.settlements.values()
    }

    pub fn validate(
        &self,
        registry: &LayerRegistry,
        message: &RelayedMessage,
    ) -> Result<WithdrawMessage, FwStatus> {
        WithdrawMessage::validate(message, registry, &self.address)
    }

    /// Front the requester `amount - fee` out of the provider's stake.
    ///
    /// # Errors
    /// `InvalidMessage`, `AmountMismatch`, `AlreadyProcessed`, `SelfDealing`,
    /// `PastDeadline`, `NonRegisteredLayer` and `InsufficientLiquidity`, in
    /// that order. Token failures surface as `Token`.
    pub fn provide_liquidity(
        &mut self,
        cx: &mut SettlementContext<'_>,
        message: &RelayedMessage,
        provider: &Address,
        amount: Amount,
        source: LiquiditySource,
        now: u64,
    ) -> Result<ProvideReceipt, KeelError> {
        let msg = self
            .validate(cx.registry, message)
            .map_err(KeelError::InvalidMessage)?;
        if amount != msg.amount() {
            return Err(KeelError::AmountMismatch {
                message: msg.amount(),
                supplied: amount,
            });
        }
        if self.status_of(&msg.key) != FwStatus::Unseen {
            return Err(KeelError::AlreadyProcessed(msg.key));
        }
        let requestor = msg.requestor();
        if *provider == requestor {
            return Err(KeelError::SelfDealing);
        }
        if now > msg.deadline() {
            return Err(KeelError::PastDeadline {
                deadline: msg.deadline(),
                now,
            });
        }
        if !cx.registry.exists(source.kind, source.entry) {
            return Err(KeelError::NonRegisteredLayer {
                kind: source.kind,
                index: source.entry,
            });
        }
        let provided = msg.provide_amount();
        let available = cx.available_liquidity(source, provider)?;
        if available < provided {
            return Err(KeelError::InsufficientLiquidity {
                available,
                required: provided,
            });
        }

        cx.check_debt(source, provider, provided)?;

        // The transfer is the only effect left that can fail.
        if provided > 0 {
            let vault = cx.vault(source.kind);
            cx.token.transfer(&vault, &requestor, provided)?;
        }
        let debt_after = cx.add_debt(source, provider, provided)?;

        let mut settlement = Settlement::opened(&msg, FwStatus::ProvideLiquidity);
        settlement.provider = Some(*provider);
        settlement.source = Some(source);
        self.settlements.insert(msg.key, settlement);

        info!(
            key = %msg.key,
            requestor = %requestor,
            provider = %provider,
            source = %source.kind,
            entry = source.entry,
            provided,
            fee = msg.fee(),
            debt_after,
            "liquidity provided"
        );

        Ok(ProvideReceipt {
            key: msg.key,
            requestor,
            provider: *provider,
            source,
            amount,
            fee: msg.fee(),
            provided,
            debt_after,
        })
    }

    /// Withdraw an unseen request so no provider can take it.
    pub fn cancel_request(
        &mut self,
        registry: &LayerRegistry,
        message: &RelayedMessage,
        caller: &Address,
    ) -> Result<CancelReceipt, KeelError> {
        let msg = self
            .validate(registry, message)
            .map_err(KeelError::InvalidMessage)?;
        let requestor = msg.requestor();
        if *caller != requestor {
            return Err(KeelError::Unauthorized {
                caller: *caller,
                expected: requestor,
            });
        }
        if self.status_of(&msg.key) != FwStatus::Unseen {
            return Err(KeelError::AlreadyProcessed(msg.key));
        }

        let mut settlement = Settlement::opened(&msg, FwStatus::Canceled);
        settlement.canceler = Some(*caller);
        self.settlements.insert(msg.key, settlement);

        info!(key = %msg.key, requestor = %requestor, "request canceled");
        Ok(CancelReceipt {
            key: msg.key,
            requestor,
        })
    }

    /// Route the bridged amount once the bridge has confirmed the message.
    ///
    /// An invalid message on an unseen key does not fail: its status is
    /// recorded against the key and returned so the stranded funds are
    /// visible.
    pub fn finalize_fast_withdraw(
        &mut self,
        cx: &mut SettlementContext<'_>,
        messenger: &dyn BridgeMessenger,
        message: &RelayedMessage,
    ) -> Result<FinalizeReceipt, KeelError> {
        if !messenger.is_message_confirmed(&message.key) {
            return Err(KeelError::UnconfirmedMessage(message.key));
        }
        let status = self.status_of(&message.key);
        if status.is_terminal() || status.is_invalid() {
            return Err(KeelError::AlreadyProcessed(message.key));
        }

        let msg = match self.validate(cx.registry, message) {
            Ok(msg) => msg,
            Err(invalid) if status == FwStatus::Unseen => {
                self.settlements
                    .insert(message.key, Settlement::rejected(message.key, invalid));
                warn!(key = %message.key, status = %invalid, "invalid withdraw message finalized");
                return Ok(FinalizeReceipt {
                    key: message.key,
                    status: invalid,
                    recipient: None,
                    paid: 0,
                    fee_credited: 0,
                    fee_shares: 0,
                    debt_after: 0,
                });
            }
            Err(invalid) => return Err(KeelError::InvalidMessage(invalid)),
        };

        let amount = msg.amount();
        let receipt = match status {
            FwStatus::Unseen => {
                let requestor = msg.requestor();
                cx.token.transfer(&self.address, &requestor, amount)?;
                self.settlements
                    .insert(msg.key, Settlement::opened(&msg, FwStatus::NormalWithdrawal));
                FinalizeReceipt {
                    key: msg.key,
                    status: FwStatus::NormalWithdrawal,
                    recipient: Some(requestor),
                    paid: amount,
                    fee_credited: 0,
                    fee_shares: 0,
                    debt_after: 0,
                }
            }
            FwStatus::ProvideLiquidity => self.finalize_provided(cx, &msg)?,
            FwStatus::Canceled => {
                let canceler = self
                    .settlements
                    .get(&msg.key)
                    .and_then(|s| s.canceler)
                    .unwrap_or_else(|| msg.requestor());
                cx.token.transfer(&self.address, &canceler, amount)?;
                self.mark(&msg.key, FwStatus::CancelWithdrawal);
                FinalizeReceipt {
                    key: msg.key,
                    status: FwStatus::CancelWithdrawal,
                    recipient: Some(canceler),
                    paid: amount,
                    fee_credited: 0,
                    fee_shares: 0,
                    debt_after: 0,
                }
            }
            other => {
                return Err(KeelError::Invariant(format!(
                    "unexpected settlement status {} for {}",
                    other, msg.key
                )))
            }
        };

        info!(
            key = %receipt.key,
            status = %receipt.status,
            paid = receipt.paid,
            fee_credited = receipt.fee_credited,
            "fast withdraw finalized"
        );
        Ok(receipt)
    }

    fn finalize_provided(
        &mut self,
        cx: &mut SettlementContext<'_>,
        msg: &WithdrawMessage,
    ) -> Result<FinalizeReceipt, KeelError> {
        let (provider, source, fee, provided) = match self.settlements.get(&msg.key) {
            Some(Settlement {
                provider: Some(provider),
                source: Some(source),
                fee,
                provided,
                ..
            }) => (*provider, *source, *fee, *provided),
            _ => {
                return Err(KeelError::Invariant(format!(
                    "provided settlement {} has no provider",
                    msg.key
                )))
            }
        };
        cx.check_repay(source, &provider, fee, provided)?;

        let vault = cx.vault(source.kind);
        cx.token.transfer(&self.address, &vault, msg.amount())?;
        let (fee_shares, debt_after) = cx.repay(source, &provider, fee, provided)?;
        self.mark(&msg.key, FwStatus::Finalized);

        debug!(key = %msg.key, provider = %provider, fee, fee_shares, debt_after, "provider repaid");
        Ok(FinalizeReceipt {
            key: msg.key,
            status: FwStatus::Finalized,
            recipient: Some(provider),
            paid: msg.amount(),
            fee_credited: fee,
            fee_shares,
            debt_after,
        })
    }

    fn mark(&mut self, key: &MessageKey, status: FwStatus) {
        if let Some(settlement) = self.settlements.get_mut(key) {
            settlement.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RelayEnvelope, WithdrawRequest};
    use crate::mock::{InMemoryAttestation, InMemoryMessenger};
    use keel_economics::params::ProtocolParams;
    use keel_economics::rebase::DividendSplit;
    use keel_economics::registry::SequencerIdentity;
    use keel_economics::token::InMemoryToken;
    use proptest::prelude::*;

    const DEADLINE: u32 = 1_000;

    struct World {
        registry: LayerRegistry,
        rebase: RebaseIndex,
        sequencer_ledger: StakingLedger<SequencerPolicy>,
        candidate_ledger: StakingLedger<CandidatePolicy>,
        token: InMemoryToken,
        messenger: InMemoryMessenger,
        protocol: FastWithdrawProtocol,
    }

    impl World {
        fn cx(&mut self) -> SettlementContext<'_> {
            SettlementContext {
                registry: &self.registry,
                rebase: &self.rebase,
                sequencer_ledger: &mut self.sequencer_ledger,
                candidate_ledger: &mut self.candidate_ledger,
                token: &mut self.token,
            }
        }

        fn provide(&mut self, msg: &RelayedMessage, provider: &Address, amount: Amount, now: u64) -> Result<ProvideReceipt, KeelError> {
            let mut protocol = std::mem::take(&mut self.protocol);
            let result = protocol.provide_liquidity(
                &mut self.cx(),
                msg,
                provider,
                amount,
                LiquiditySource::sequencer(1),
                now,
            );
            self.protocol = protocol;
            result
        }

        fn finalize(&mut self, msg: &RelayedMessage) -> Result<FinalizeReceipt, KeelError> {
            let mut protocol = std::mem::take(&mut self.protocol);
            let messenger = self.messenger.clone();
            let result = protocol.finalize_fast_withdraw(&mut self.cx(), &messenger, msg);
            self.protocol = protocol;
            result
        }

        fn cancel(&mut self, msg: &RelayedMessage, caller: &Address) -> Result<CancelReceipt, KeelError> {
            self.protocol.cancel_request(&self.registry, msg, caller)
        }

        /// Confirm the message and park the bridged amount at the protocol account.
        fn release(&mut self, msg: &RelayedMessage, amount: Amount) {
            self.messenger.confirm(msg.key);
            self.token.mint(&self.protocol.address(), amount).unwrap();
        }
    }

    fn identity() -> SequencerIdentity {
        SequencerIdentity {
            name: "layer".to_string(),
            address_manager: Address::from_label("am"),
            l1_bridge: Address::from_label("l1-bridge"),
            l2_bridge: Address::from_label("l2-bridge"),
            l2_token: Address::from_label("l2-token"),
        }
    }

    fn provider() -> Address {
        Address::from_label("provider")
    }

    fn requestor() -> Address {
        Address::from_label("requestor")
    }

    fn world() -> World {
        let staking_vault = Address::from_label("keel/staking-vault");
        let registry_vault = Address::from_label("keel/registry-vault");
        let seq = Address::from_label("sequencer");
        let params = ProtocolParams {
            minimum_deposit_for_sequencer: 100,
            ..ProtocolParams::default()
        };
        let mut token = InMemoryToken::new();
        let mut attestation = InMemoryAttestation::new();
        attestation.attest(identity().address_manager, seq);

        let mut registry = LayerRegistry::new(registry_vault, &params);
        token.mint(&seq, 100).unwrap();
        token.approve(&seq, &registry_vault, 100);
        registry
            .create_sequencer(&attestation, &mut token, &seq, identity(), 100)
            .unwrap();

        let rebase = RebaseIndex::new(10, 300, DividendSplit::default(), 0).unwrap();
        let mut sequencer_ledger = StakingLedger::new(SequencerPolicy, staking_vault);
        token.mint(&provider(), 1_000).unwrap();
        sequencer_ledger
            .pull_and_stake(&registry, &rebase, &mut token, 1, &provider(), 1_000)
            .unwrap();

        World {
            registry,
            rebase,
            sequencer_ledger,
            candidate_ledger: StakingLedger::new(CandidatePolicy, staking_vault),
            token,
            messenger: InMemoryMessenger::new(),
            protocol: FastWithdrawProtocol::new(Address::from_label("keel/fast-withdraw")),
        }
    }

    fn message(amount: Amount, fee_rate_bps: u16, nonce: u64) -> RelayedMessage {
        RelayedMessage::from_envelope(&RelayEnvelope {
            target: identity().l1_bridge,
            sender: identity().l2_bridge,
            l1_token: Address::from_label("l1-token"),
            l2_token: identity().l2_token,
            from: requestor(),
            to: Address::from_label("keel/fast-withdraw"),
            amount,
            nonce,
            request: WithdrawRequest::new(fee_rate_bps, DEADLINE, 1),
        })
    }

    #[test]
    fn test_provide_then_finalize_repays_provider() {
        let mut w = world();
        let msg = message(500, 1_000, 0);

        let provided = w.provide(&msg, &provider(), 500, 10).unwrap();
        assert_eq!(provided.provided, 450);
        assert_eq!(provided.debt_after, 450);
        assert_eq!(w.token.balance_of(&requestor()), 450);
        assert_eq!(w.sequencer_ledger.shares_of(1, &provider()), 1_000);
        assert_eq!(w.protocol.status_of(&msg.key), FwStatus::ProvideLiquidity);

        w.release(&msg, 500);
        let finalized = w.finalize(&msg).unwrap();
        assert_eq!(finalized.status, FwStatus::Finalized);
        assert_eq!(finalized.fee_credited, 50);
        assert_eq!(finalized.debt_after, 0);
        assert_eq!(w.sequencer_ledger.shares_of(1, &provider()), 1_050);
        assert_eq!(w.sequencer_ledger.debt_of(1, &provider()), 0);
        assert_eq!(w.token.balance_of(&w.sequencer_ledger.vault()), 1_050);
        assert_eq!(w.token.balance_of(&w.protocol.address()), 0);
    }

    #[test]
    fn test_failed_provide_transfer_leaves_no_trace() {
        let mut w = world();
        // Index rises with no tokens behind it: principal 4000, vault 1000.
        w.rebase.update_issuance(300, 1_000, 0).unwrap();
        let msg = message(2_000, 0, 0);
        let vault = w.sequencer_ledger.vault();

        assert!(matches!(
            w.provide(&msg, &provider(), 2_000, 10),
            Err(KeelError::Token(_))
        ));
        assert_eq!(w.protocol.status_of(&msg.key), FwStatus::Unseen);
        assert_eq!(w.sequencer_ledger.debt_of(1, &provider()), 0);
        assert_eq!(w.token.balance_of(&vault), 1_000);
        assert_eq!(w.token.balance_of(&requestor()), 0);
    }

    #[test]
    fn test_failed_finalize_transfer_keeps_settlement_open() {
        let mut w = world();
        let msg = message(500, 1_000, 0);
        w.provide(&msg, &provider(), 500, 10).unwrap();

        // Bridge released less than the message amount.
        w.release(&msg, 200);
        assert!(matches!(w.finalize(&msg), Err(KeelError::Token(_))));
        assert_eq!(w.protocol.status_of(&msg.key), FwStatus::ProvideLiquidity);
        assert_eq!(w.sequencer_ledger.debt_of(1, &provider()), 450);
        assert_eq!(w.sequencer_ledger.shares_of(1, &provider()), 1_000);
        assert_eq!(w.token.balance_of(&w.protocol.address()), 200);

        w.token.mint(&w.protocol.address(), 300).unwrap();
        let receipt = w.finalize(&msg).unwrap();
        assert_eq!(receipt.status, FwStatus::Finalized);
        assert_eq!(receipt.debt_after, 0);
    }

    #[test]
    fn test_finalize_without_liquidity_pays_requestor() {
        let mut w = world();
        let msg = message(300, 1_000, 0);
        w.release(&msg, 300);
        let receipt = w.finalize(&msg).unwrap();
        assert_eq!(receipt.status, FwStatus::NormalWithdrawal);
        assert_eq!(receipt.recipient, Some(requestor()));
        assert_eq!(w.token.balance_of(&requestor()), 300);
        assert_eq!(
            w.provide(&msg, &provider(), 300, 10),
            Err(KeelError::AlreadyProcessed(msg.key))
        );
    }

    #[test]
    fn test_cancel_blocks_providers_and_routes_to_canceler() {
        let mut w = world();
        let msg = message(300, 1_000, 0);
        assert_eq!(
            w.cancel(&msg, &provider()),
            Err(KeelError::Unauthorized {
                caller: provider(),
                expected: requestor()
            })
        );
        w.cancel(&msg, &requestor()).unwrap();
        assert_eq!(
            w.provide(&msg, &provider(), 300, 10),
            Err(KeelError::AlreadyProcessed(msg.key))
        );
        assert_eq!(
            w.cancel(&msg, &requestor()),
            Err(KeelError::AlreadyProcessed(msg.key))
        );

        w.release(&msg, 300);
        let receipt = w.finalize(&msg).unwrap();
        assert_eq!(receipt.status, FwStatus::CancelWithdrawal);
        assert_eq!(w.token.balance_of(&requestor()), 300);
    }

    #[test]
    fn test_provide_guards_leave_no_state() {
        let mut w = world();
        let msg = message(500, 1_000, 0);
        assert_eq!(
            w.provide(&msg, &provider(), 499, 10),
            Err(KeelError::AmountMismatch {
                message: 500,
                supplied: 499
            })
        );
        assert_eq!(w.provide(&msg, &requestor(), 500, 10), Err(KeelError::SelfDealing));
        assert_eq!(
            w.provide(&msg, &provider(), 500, DEADLINE as u64 + 1),
            Err(KeelError::PastDeadline {
                deadline: DEADLINE as u64,
                now: DEADLINE as u64 + 1
            })
        );
        let big = message(2_000, 1_000, 1);
        assert_eq!(
            w.provide(&big, &provider(), 2_000, 10),
            Err(KeelError::InsufficientLiquidity {
                available: 1_000,
                required: 1_800
            })
        );
        assert_eq!(w.protocol.status_of(&msg.key), FwStatus::Unseen);
        assert_eq!(w.sequencer_ledger.debt_of(1, &provider()), 0);
        assert_eq!(w.token.balance_of(&requestor()), 0);
    }

    #[test]
    fn test_debt_reduces_available_liquidity() {
        let mut w = world();
        w.provide(&message(500, 0, 0), &provider(), 500, 10).unwrap();
        assert_eq!(
            w.cx().available_liquidity(LiquiditySource::sequencer(1), &provider()),
            Ok(500)
        );
        assert_eq!(
            w.provide(&message(600, 0, 1), &provider(), 600, 10),
            Err(KeelError::InsufficientLiquidity {
                available: 500,
                required: 600
            })
        );
    }

    #[test]
    fn test_finalize_requires_confirmation() {
        let mut w = world();
        let msg = message(300, 0, 0);
        assert_eq!(w.finalize(&msg), Err(KeelError::UnconfirmedMessage(msg.key)));
    }

    #[test]
    fn test_invalid_message_is_recorded_on_finalize() {
        let mut w = world();
        let mut payload = message(300, 0, 0).payload;
        payload[crate::message::ENVELOPE_FIXED_LEN] = 9;
        let bad = RelayedMessage::from_payload(payload);
        assert_eq!(
            w.provide(&bad, &provider(), 300, 10),
            Err(KeelError::InvalidMessage(FwStatus::UnknownVersion))
        );

        w.release(&bad, 300);
        let receipt = w.finalize(&bad).unwrap();
        assert_eq!(receipt.status, FwStatus::UnknownVersion);
        assert_eq!(receipt.paid, 0);
        assert_eq!(w.protocol.status_of(&bad.key), FwStatus::UnknownVersion);
        assert_eq!(w.finalize(&bad), Err(KeelError::AlreadyProcessed(bad.key)));
    }

    #[test]
    fn test_tampered_payload_cannot_overwrite_settlement() {
        let mut w = world();
        let msg = message(500, 1_000, 0);
        w.provide(&msg, &provider(), 500, 10).unwrap();
        let mut payload = msg.payload.clone();
        payload[130] ^= 1;
        let forged = RelayedMessage::new(msg.key, payload);
        w.release(&msg, 500);
        assert_eq!(
            w.finalize(&forged),
            Err(KeelError::InvalidMessage(FwStatus::HashMismatch))
        );
        assert_eq!(w.protocol.status_of(&msg.key), FwStatus::ProvideLiquidity);
    }

    #[derive(Debug, Clone)]
    enum Action {
        Provide,
        Cancel,
        Finalize,
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_single_terminal_outcome(actions in prop::collection::vec(
            prop_oneof![Just(Action::Provide), Just(Action::Cancel), Just(Action::Finalize)],
            1..8,
        )) {
            let mut w = world();
            let msg = message(400, 500, 0);
            w.release(&msg, 400);
            let mut terminal = None;
            for action in actions {
                let before = w.protocol.status_of(&msg.key);
                let result = match action {
                    Action::Provide => w.provide(&msg, &provider(), 400, 10).map(|_| ()),
                    Action::Cancel => w.cancel(&msg, &requestor()).map(|_| ()),
                    Action::Finalize => w.finalize(&msg).map(|_| ()),
                };
                let after = w.protocol.status_of(&msg.key);
                if result.is_err() {
                    prop_assert_eq!(before, after);
                }
                if before.is_terminal() {
                    prop_assert_eq!(before, after);
                }
                if after.is_terminal() {
                    if let Some(first) = terminal {
                        prop_assert_eq!(first, after);
                    }
                    terminal = Some(after);
                }
            }
            let paid_out = w.token.balance_of(&requestor());
            prop_assert!(paid_out <= 400);
        }
    }
}
