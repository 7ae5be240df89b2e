// crates/keel-economics/src/lib.rs
//
// keel-economics: the rebase index, the per-layer staking ledgers, the
// layer registry and its reward distribution, token amounts and the
// protocol parameters of the Keel staking ledger.
//
// All monetary values are tracked in base units (18 decimals).
// 1 token = 1,000,000,000,000,000,000 base units (10^18).

pub mod fixed;
pub mod params;
pub mod rebase;
pub mod registry;
pub mod staking;
pub mod token;

// Re-export key types for ergonomic access from downstream crates.
pub use fixed::{mul_div, principal_to_shares, shares_to_principal, INDEX_PRECISION};
pub use params::ProtocolParams;
pub use rebase::{DividendSplit, IssuanceResult, IssuanceStatus, RebaseIndex, Snapshot};
pub use registry::{
    CandidateIdentity, DepositChange, DistributionResult, LayerRecord, LayerRegistry,
    SequencerIdentity,
};
pub use staking::{
    CandidatePolicy, LayerDirectory, PendingSummary, PendingWithdrawal, SequencerPolicy,
    StakePolicy, StakeReceipt, StakingLedger, UnstakeReceipt, WithdrawReceipt,
};
pub use token::{InMemoryToken, TokenAmount, UNIT};
