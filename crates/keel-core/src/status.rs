// crates/keel-core/src/status.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status code of a fast-withdraw message.
///
/// Codes below 10 are lifecycle states of a valid message; codes from 10 up
/// are validation failures. The numeric codes are stable and appear in the
/// event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FwStatus {
    /// Valid and never touched.
    Unseen,
    /// Finalized without prior liquidity; the requestor was paid in full.
    NormalWithdrawal,
    /// A provider fronted the funds; awaiting finalization.
    ProvideLiquidity,
    /// The requestor canceled; awaiting finalization.
    Canceled,
    /// Finalized after liquidity was provided.
    Finalized,
    /// Finalized after cancellation.
    CancelWithdrawal,

    Malformed,
    UnknownVersion,
    HashMismatch,
    InvalidLayerIndex,
    ZeroAmount,
    UnknownLayer,
    BridgeMismatch,
    WrongTarget,
    FeeTooHigh,
}

impl FwStatus {
    pub fn code(&self) -> u8 {
        match self {
            FwStatus::Unseen => 0,
            FwStatus::NormalWithdrawal => 1,
            FwStatus::ProvideLiquidity => 2,
            FwStatus::Canceled => 3,
            FwStatus::Finalized => 4,
            FwStatus::CancelWithdrawal => 5,
            FwStatus::Malformed => 10,
            FwStatus::UnknownVersion => 11,
            FwStatus::HashMismatch => 12,
            FwStatus::InvalidLayerIndex => 13,
            FwStatus::ZeroAmount => 14,
            FwStatus::UnknownLayer => 15,
            FwStatus::BridgeMismatch => 16,
            FwStatus::WrongTarget => 17,
            FwStatus::FeeTooHigh => 18,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let status = match code {
            0 => FwStatus::Unseen,
            1 => FwStatus::NormalWithdrawal,
            2 => FwStatus::ProvideLiquidity,
            3 => FwStatus::Canceled,
            4 => FwStatus::Finalized,
            5 => FwStatus::CancelWithdrawal,
            10 => FwStatus::Malformed,
            11 => FwStatus::UnknownVersion,
            12 => FwStatus::HashMismatch,
            13 => FwStatus::InvalidLayerIndex,
            14 => FwStatus::ZeroAmount,
            15 => FwStatus::UnknownLayer,
            16 => FwStatus::BridgeMismatch,
            17 => FwStatus::WrongTarget,
            18 => FwStatus::FeeTooHigh,
            _ => return None,
        };
        Some(status)
    }

    /// True for validation failures.
    pub fn is_invalid(&self) -> bool {
        self.code() >= 10
    }

    /// True for states no further call can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FwStatus::NormalWithdrawal | FwStatus::Finalized | FwStatus::CancelWithdrawal
        )
    }

    /// Failures caused by the bytes themselves rather than the fields they carry.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FwStatus::Malformed
                | FwStatus::UnknownVersion
                | FwStatus::HashMismatch
                | FwStatus::BridgeMismatch
                | FwStatus::WrongTarget
        )
    }
}

impl fmt::Display for FwStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FwStatus::Unseen => "UNSEEN",
            FwStatus::NormalWithdrawal => "NORMAL_WITHDRAWAL",
            FwStatus::ProvideLiquidity => "PROVIDE_LIQUIDITY",
            FwStatus::Canceled => "CANCELED",
            FwStatus::Finalized => "FINALIZED",
            FwStatus::CancelWithdrawal => "CANCEL_WITHDRAWAL",
            FwStatus::Malformed => "MALFORMED",
            FwStatus::UnknownVersion => "UNKNOWN_VERSION",
            FwStatus::HashMismatch => "HASH_MISMATCH",
            FwStatus::InvalidLayerIndex => "INVALID_LAYERINDEX",
            FwStatus::ZeroAmount => "ZERO_AMOUNT",
            FwStatus::UnknownLayer => "UNKNOWN_LAYER",
            FwStatus::BridgeMismatch => "BRIDGE_MISMATCH",
            FwStatus::WrongTarget => "WRONG_TARGET",
            FwStatus::FeeTooHigh => "FEE_TOO_HIGH",
        };
        write!(f, "{} ({})", name, self.code())
    }
}
