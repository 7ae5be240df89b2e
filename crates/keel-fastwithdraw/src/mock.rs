// crates/keel-fastwithdraw/src/mock.rs
//
// In-memory bridge collaborators for tests and the simulated daemon chain.

use std::collections::{BTreeMap, BTreeSet};

use keel_core::traits::{BridgeMessenger, SequencerAttestation};
use keel_core::{Address, MessageKey};

/// Bridge messenger whose confirmations are set by hand.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessenger {
    confirmed: BTreeSet<MessageKey>,
}

impl InMemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirm(&mut self, key: MessageKey) {
        self.confirmed.insert(key);
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }
}

impl BridgeMessenger for InMemoryMessenger {
    fn is_message_confirmed(&self, key: &MessageKey) -> bool {
        self.confirmed.contains(key)
    }
}

/// Address-manager records mapped to their attested sequencer.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAttestation {
    sequencers: BTreeMap<Address, Address>,
}

impl InMemoryAttestation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attest(&mut self, address_manager: Address, sequencer: Address) {
        self.sequencers.insert(address_manager, sequencer);
    }

    #[cfg(test)]
    pub fn revoke(&mut self, address_manager: &Address) -> Option<Address> {
        self.sequencers.remove(address_manager)
    }
}

impl SequencerAttestation for InMemoryAttestation {
    fn attested_sequencer(&self, address_manager: &Address) -> Option<Address> {
        self.sequencers.get(address_manager).copied()
    }
}
