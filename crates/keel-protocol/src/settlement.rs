// crates/keel-protocol/src/settlement.rs
//
// Bridge simulation and fast-withdraw entry points on the ledger state.
//
// A sequencer layer's base-layer bridge escrows deposits; the escrowed
// total is reported to the registry as the layer's external deposits. On
// the way out, the bridge confirms the relayed message and releases the
// amount to the fast-withdraw account, which then settles it.

use tracing::info;

use keel_core::error::KeelError;
use keel_core::events::LedgerEvent;
use keel_core::traits::TokenLedger;
use keel_core::{Address, Amount, FwStatus, LayerIndex, LayerKind};
use keel_economics::registry::DepositChange;
use keel_economics::staking::LayerDirectory;
use keel_fastwithdraw::{
    CancelReceipt, FinalizeReceipt, LiquiditySource, ProvideReceipt, RelayEnvelope,
    RelayedMessage, SettlementContext, WithdrawRequest,
};

use crate::context::{fast_withdraw_account, StakingContext};

impl StakingContext {
    /// Escrow `amount` from `account` in the layer's base-layer bridge.
    pub fn bridge_deposit(
        &mut self,
        layer: LayerIndex,
        account: &Address,
        amount: Amount,
    ) -> Result<DepositChange, KeelError> {
        let bridge = self.l1_bridge_of(layer)?;
        let delta = i128::try_from(amount)
            .map_err(|_| KeelError::ArithmeticOverflow("bridge deposit".to_string()))?;
        self.require_active(layer)?;
        self.token.transfer(account, &bridge, amount)?;
        let change = self.registry.record_external_deposit(layer, delta)?;
        self.record(LedgerEvent::ExternalDepositRecorded {
            index: layer,
            delta,
            before: change.before,
            after: change.after,
            total_external_deposits: self.registry.total_external_deposits(),
        });
        Ok(change)
    }

    /// Build the relayed message for a withdrawal intent addressed to the
    /// fast-withdraw account. Nonces are allocated per ledger state.
    pub fn withdrawal_message(
        &mut self,
        layer: LayerIndex,
        requestor: &Address,
        amount: Amount,
        request: WithdrawRequest,
    ) -> Result<RelayedMessage, KeelError> {
        let identity = self
            .registry
            .sequencer(layer)?
            .identity
            .clone()
            .ok_or_else(|| KeelError::Invariant(format!("sequencer {} has no identity", layer)))?;
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        let envelope = RelayEnvelope {
            target: identity.l1_bridge,
            sender: identity.l2_bridge,
            l1_token: self.token_address(),
            l2_token: identity.l2_token,
            from: *requestor,
            to: fast_withdraw_account(),
            amount,
            nonce,
            request,
        };
        Ok(RelayedMessage::from_envelope(&envelope))
    }

    /// Confirm the message and release `amount` of the layer's escrow to the
    /// fast-withdraw account.
    pub fn bridge_release(
        &mut self,
        layer: LayerIndex,
        message: &RelayedMessage,
        amount: Amount,
    ) -> Result<DepositChange, KeelError> {
        let bridge = self.l1_bridge_of(layer)?;
        let delta = i128::try_from(amount)
            .map_err(|_| KeelError::ArithmeticOverflow("bridge release".to_string()))?;
        self.require_active(layer)?;
        let escrowed = self.registry.sequencer(layer)?.external_deposit_total;
        if escrowed < amount {
            return Err(KeelError::Invariant(format!(
                "release of {} exceeds escrow {} of layer {}",
                amount, escrowed, layer
            )));
        }
        self.token.transfer(&bridge, &fast_withdraw_account(), amount)?;
        let change = self.registry.record_external_deposit(layer, -delta)?;
        self.messenger.confirm(message.key);
        self.record(LedgerEvent::ExternalDepositRecorded {
            index: layer,
            delta: -delta,
            before: change.before,
            after: change.after,
            total_external_deposits: self.registry.total_external_deposits(),
        });
        info!(layer, key = %message.key, amount, "bridge released withdrawal");
        Ok(change)
    }

    /// Front a withdrawal out of the provider's stake in `source`. The
    /// deadline is checked against the current block timestamp.
    pub fn provide_liquidity(
        &mut self,
        message: &RelayedMessage,
        provider: &Address,
        amount: Amount,
        source: LiquiditySource,
    ) -> Result<ProvideReceipt, KeelError> {
        let now = self.block.timestamp;
        let mut cx = SettlementContext {
            registry: &self.registry,
            rebase: &self.rebase,
            sequencer_ledger: &mut self.sequencer_ledger,
            candidate_ledger: &mut self.candidate_ledger,
            token: &mut self.token,
        };
        let receipt = self
            .fast_withdraw
            .provide_liquidity(&mut cx, message, provider, amount, source, now)?;
        self.record(LedgerEvent::LiquidityProvided {
            key: receipt.key,
            requestor: receipt.requestor,
            provider: receipt.provider,
            source: receipt.source.kind,
            entry: receipt.source.entry,
            amount: receipt.amount,
            fee: receipt.fee,
            provided: receipt.provided,
            debt_after: receipt.debt_after,
            status: FwStatus::ProvideLiquidity,
        });
        Ok(receipt)
    }

    pub fn cancel_request(
        &mut self,
        message: &RelayedMessage,
        caller: &Address,
    ) -> Result<CancelReceipt, KeelError> {
        let receipt = self
            .fast_withdraw
            .cancel_request(&self.registry, message, caller)?;
        self.record(LedgerEvent::RequestCanceled {
            key: receipt.key,
            requestor: receipt.requestor,
            status: FwStatus::Canceled,
        });
        Ok(receipt)
    }

    /// Settle a confirmed message. A provider repayment also records the
    /// fee shares credited to the provider.
    pub fn finalize_fast_withdraw(&mut self, message: &RelayedMessage) -> Result<FinalizeReceipt, KeelError> {
        let mut cx = SettlementContext {
            registry: &self.registry,
            rebase: &self.rebase,
            sequencer_ledger: &mut self.sequencer_ledger,
            candidate_ledger: &mut self.candidate_ledger,
            token: &mut self.token,
        };
        let receipt = self
            .fast_withdraw
            .finalize_fast_withdraw(&mut cx, &self.messenger, message)?;

        let recipient = match receipt.recipient {
            Some(recipient) => recipient,
            None => {
                self.record(LedgerEvent::InvalidWithdrawMessage {
                    key: receipt.key,
                    status: receipt.status,
                });
                return Ok(receipt);
            }
        };

        if receipt.fee_shares > 0 {
            let source = self
                .fast_withdraw
                .settlement(&receipt.key)
                .and_then(|s| s.source)
                .ok_or_else(|| KeelError::Invariant(format!("settlement {} has no source", receipt.key)))?;
            let balance_after = self.shares_of(source.kind, source.entry, &recipient);
            self.record(LedgerEvent::SharesCredited {
                kind: source.kind,
                entry: source.entry,
                account: recipient,
                principal: receipt.fee_credited,
                shares: receipt.fee_shares,
                balance_after,
            });
        }
        self.record(LedgerEvent::FastWithdrawSettled {
            key: receipt.key,
            status: receipt.status,
            recipient,
            paid: receipt.paid,
            fee_credited: receipt.fee_credited,
            debt_after: receipt.debt_after,
        });
        Ok(receipt)
    }

    /// Provider principal in `source` minus outstanding debt.
    pub fn available_liquidity(&self, source: LiquiditySource, provider: &Address) -> Result<Amount, KeelError> {
        match source.kind {
            LayerKind::Sequencer => {
                self.sequencer_ledger
                    .available_liquidity(&self.rebase, source.entry, provider)
            }
            LayerKind::Candidate => {
                self.candidate_ledger
                    .available_liquidity(&self.rebase, source.entry, provider)
            }
        }
    }

    pub fn status_of(&self, message: &RelayedMessage) -> FwStatus {
        self.fast_withdraw.status_of(&message.key)
    }

    /// Base-layer token address quoted in relay envelopes.
    pub fn token_address(&self) -> Address {
        Address::from_label("keel/token")
    }

    fn require_active(&self, layer: LayerIndex) -> Result<(), KeelError> {
        if self.registry.is_active(LayerKind::Sequencer, layer) {
            Ok(())
        } else if self.registry.exists(LayerKind::Sequencer, layer) {
            Err(KeelError::InactiveLayer {
                kind: LayerKind::Sequencer,
                index: layer,
            })
        } else {
            Err(KeelError::NonRegisteredLayer {
                kind: LayerKind::Sequencer,
                index: layer,
            })
        }
    }

    fn l1_bridge_of(&self, layer: LayerIndex) -> Result<Address, KeelError> {
        self.registry
            .sequencer(layer)?
            .identity
            .as_ref()
            .map(|identity| identity.l1_bridge)
            .ok_or_else(|| KeelError::Invariant(format!("sequencer {} has no identity", layer)))
    }
}
