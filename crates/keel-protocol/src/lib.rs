// crates/keel-protocol/src/lib.rs
//
// keel-protocol: the ledger state that ties registry, staking, issuance and
// fast-withdraw settlement together and records every change as an event.

pub mod context;
pub mod replay;
pub mod settlement;

pub use context::{
    fast_withdraw_account, registry_vault, staking_vault, BlockEnv, LedgerSummary,
    StakingContext,
};
pub use replay::{check_totals, replay_shares, ShareKey};
