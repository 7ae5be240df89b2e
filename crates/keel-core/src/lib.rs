// crates/keel-core/src/lib.rs
//
// keel-core: Core types, traits, and hashing primitives for the Keel
// staking and fast-withdrawal ledger.
//
// This is the leaf crate that all other crates in the workspace depend on.
// It defines addresses and layer identifiers, the protocol-wide error
// taxonomy, settlement status codes, the structured event records, and the
// trait interfaces of the external collaborators (token, sequencer
// attestation, bridge messenger).

pub mod crypto;
pub mod error;
pub mod events;
pub mod identity;
pub mod status;
pub mod traits;

// Re-export key types for ergonomic access from downstream crates.
// Usage: `use keel_core::Address;`

// Identity types
pub use identity::{Address, Amount, LayerIndex, LayerKey, LayerKind, MessageKey};

// Status codes
pub use status::FwStatus;

// Events
pub use events::{EventLog, EventRecord, LedgerEvent};

// Error type
pub use error::{ErrorCategory, KeelError};

// Traits
pub use traits::{BridgeMessenger, SequencerAttestation, TokenLedger};
