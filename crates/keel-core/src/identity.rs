// crates/keel-core/src/identity.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::hash_bytes;
use crate::error::KeelError;

/// Principal and share amounts. 18-decimal fixed point, like the base token.
pub type Amount = u128;

/// Index of a layer record. Sequencers and candidates are numbered in
/// separate spaces, both starting at 1; index 0 is never valid.
pub type LayerIndex = u32;

/// A 20-byte account address on the base ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The unset address.
    pub const ZERO: Address = Address([0u8; 20]);

    /// Derive a deterministic address from a label.
    ///
    /// Used for module-owned vault accounts (e.g. `"keel/registry"`) and in
    /// tests for named parties. Takes the last 20 bytes of SHA-256(label).
    pub fn from_label(label: &str) -> Self {
        let digest = hash_bytes(label.as_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Address(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = KeelError;

    /// Parse a `0x`-prefixed (or bare) 40-character hex string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(trimmed)
            .map_err(|e| KeelError::Configuration(format!("invalid address {}: {}", s, e)))?;
        let array: [u8; 20] = bytes.try_into().map_err(|_| {
            KeelError::Configuration(format!("address {} must be exactly 20 bytes", s))
        })?;
        Ok(Address(array))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Which registry a layer record (and its staking ledger) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LayerKind {
    /// A secondary execution layer run by a sequencer.
    Sequencer,
    /// An operator bonded under a sequencer layer.
    Candidate,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Sequencer => write!(f, "sequencer"),
            LayerKind::Candidate => write!(f, "candidate"),
        }
    }
}

/// Content hash identifying a layer record. Derived from the record's
/// identifying attributes; a back-reference only, never an ownership path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerKey(pub [u8; 32]);

impl fmt::Display for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LayerKey({})", self)
    }
}

/// Canonical hash of a fully wrapped withdrawal-intent message.
/// The deduplication unit of the fast-withdraw protocol.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey(pub [u8; 32]);

impl MessageKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageKey({})", self)
    }
}
