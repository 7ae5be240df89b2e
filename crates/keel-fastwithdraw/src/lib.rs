// crates/keel-fastwithdraw/src/lib.rs
//
// keel-fastwithdraw: early settlement of secondary-layer withdrawals by
// third-party liquidity providers.
//
// A withdrawal intent travels inside the bridge's relay envelope. Its
// message key is the hash of the fully wrapped bytes. Three independent
// paths act on a key (liquidity provision, requester cancellation, and
// base-layer finalization) and the settlement table arbitrates them so
// each key reaches exactly one terminal outcome.

pub mod message;
pub mod mock;
pub mod receipt;

pub use message::{
    RelayEnvelope, RelayedMessage, RequestVersion, WithdrawMessage, WithdrawRequest,
    FEE_RATE_DENOMINATOR,
};
pub use mock::{InMemoryAttestation, InMemoryMessenger};
pub use receipt::{
    CancelReceipt, FastWithdrawProtocol, FinalizeReceipt, LiquiditySource, ProvideReceipt,
    Settlement, SettlementContext,
};
