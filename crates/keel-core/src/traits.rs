// crates/keel-core/src/traits.rs

use crate::error::KeelError;
use crate::identity::{Address, Amount, MessageKey};

/// Capability over the principal token.
///
/// The ledger only calls into this; allowance bookkeeping belongs to the
/// implementation. Implemented by `keel_economics::token::InMemoryToken`.
pub trait TokenLedger {
    fn balance_of(&self, account: &Address) -> Amount;

    /// Move `amount` from `from` to `to`, authorised by `from` itself.
    fn transfer(&mut self, from: &Address, to: &Address, amount: Amount) -> Result<(), KeelError>;

    /// Move `amount` from `from` to `to` on behalf of `spender`, consuming allowance.
    fn transfer_from(
        &mut self,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), KeelError>;

    /// Create new supply credited to `to`.
    fn mint(&mut self, to: &Address, amount: Amount) -> Result<(), KeelError>;

    fn total_supply(&self) -> Amount;
}

/// Lookup of the currently attested sequencer for an address-manager record.
///
/// Consulted when a sequencer layer is created to authorise the caller.
pub trait SequencerAttestation {
    fn attested_sequencer(&self, address_manager: &Address) -> Option<Address>;
}

/// Bridge messenger confirmation of base-layer withdrawal messages.
pub trait BridgeMessenger {
    /// Whether the fully wrapped message identified by `key` has been relayed
    /// and confirmed. An unconfirmed message is a hard failure for callers.
    fn is_message_confirmed(&self, key: &MessageKey) -> bool;
}
