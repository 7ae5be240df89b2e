// crates/keel-core/src/error.rs

use thiserror::Error;

use crate::identity::{Address, Amount, LayerIndex, LayerKind, MessageKey};
use crate::status::FwStatus;

/// Protocol-wide error types for the Keel staking ledger.
///
/// Every failure is surfaced synchronously with enough data to tell its
/// cause apart. Nothing in the ledger retries on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeelError {
    /// The caller is not the party allowed to perform this action.
    #[error("Unauthorized: caller {caller} is not {expected}")]
    Unauthorized { caller: Address, expected: Address },

    /// The caller is not the attested sequencer for the identity record.
    #[error("Unauthorized: {0} is not the attested sequencer")]
    NotAttestedSequencer(Address),

    /// A liquidity provider tried to settle their own request.
    #[error("The requester and provider cannot be the same")]
    SelfDealing,

    /// The layer index does not name a registered layer.
    #[error("Non-registered {kind} layer: {index}")]
    NonRegisteredLayer { kind: LayerKind, index: LayerIndex },

    /// The layer exists but has been deactivated.
    #[error("Inactive {kind} layer: {index}")]
    InactiveLayer { kind: LayerKind, index: LayerIndex },

    #[error("Zero amount")]
    ZeroAmount,

    #[error("Past deadline: deadline {deadline}, now {now}")]
    PastDeadline { deadline: u64, now: u64 },

    /// The message key has already reached a state that forbids this call.
    #[error("Already processed: {0}")]
    AlreadyProcessed(MessageKey),

    #[error("Zero available withdrawal amount")]
    NothingToWithdraw,

    #[error("No amount to claim for layer {0}")]
    NothingToClaim(LayerIndex),

    /// A setter was called with the value already in place.
    #[error("Same value: {0}")]
    SameValue(String),

    /// A layer with the same content key is already registered.
    #[error("Duplicate layer key: {0}")]
    DuplicateLayerKey(String),

    #[error("Invalid snapshot id: {0}")]
    InvalidSnapshot(u64),

    #[error("Liquidity is insufficient: available {available}, required {required}")]
    InsufficientLiquidity { available: Amount, required: Amount },

    /// A deposit is below the registry minimum.
    #[error("Insufficient deposit: {amount} is below minimum {minimum}")]
    InsufficientDeposit { amount: Amount, minimum: Amount },

    /// An operator tried to leave a non-zero bond below the minimum.
    #[error("Minimum deposit floor: remaining {remaining} is below {minimum}")]
    BelowMinimumFloor { remaining: Amount, minimum: Amount },

    /// Unstaking would leave less principal than the provider's open debt.
    #[error("Debt outstanding: remaining {remaining} is below debt {debt}")]
    DebtOutstanding { remaining: Amount, debt: Amount },

    #[error("Insufficient shares: balance {balance}, requested {requested}")]
    InsufficientShares { balance: Amount, requested: Amount },

    #[error("Layer limit reached: max {max}")]
    LayerLimitReached { max: u32 },

    /// The withdrawal message failed validation.
    #[error("Invalid withdraw message: {0}")]
    InvalidMessage(FwStatus),

    /// The amount supplied by the caller differs from the amount in the message.
    #[error("Amount mismatch: message carries {message}, caller supplied {supplied}")]
    AmountMismatch { message: Amount, supplied: Amount },

    /// The bridge has not confirmed the underlying withdrawal.
    #[error("Unconfirmed message: {0}")]
    UnconfirmedMessage(MessageKey),

    /// The token collaborator rejected a transfer or mint.
    #[error("Token error: {0}")]
    Token(String),

    #[error("Arithmetic overflow: {0}")]
    ArithmeticOverflow(String),

    /// An internal bookkeeping inconsistency.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Invalid dividend rates: {0}")]
    InvalidDividendRates(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Remediation class of a [`KeelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Wrong caller. Never retryable.
    Authorization,
    /// Bad input or state for this call. The caller may retry with corrected input.
    Precondition,
    /// The amount asked for exceeds what is available; a smaller amount may succeed.
    Capacity,
    /// Malformed or inconsistent data. Never retryable with the same bytes.
    Invariant,
    /// A failure reported by an external collaborator (token, bridge).
    Collaborator,
    Configuration,
}

impl KeelError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            KeelError::Unauthorized { .. }
            | KeelError::NotAttestedSequencer(_)
            | KeelError::SelfDealing => ErrorCategory::Authorization,

            KeelError::NonRegisteredLayer { .. }
            | KeelError::InactiveLayer { .. }
            | KeelError::ZeroAmount
            | KeelError::PastDeadline { .. }
            | KeelError::AlreadyProcessed(_)
            | KeelError::NothingToWithdraw
            | KeelError::NothingToClaim(_)
            | KeelError::SameValue(_)
            | KeelError::DuplicateLayerKey(_)
            | KeelError::InvalidSnapshot(_) => ErrorCategory::Precondition,

            KeelError::InsufficientLiquidity { .. }
            | KeelError::InsufficientDeposit { .. }
            | KeelError::BelowMinimumFloor { .. }
            | KeelError::DebtOutstanding { .. }
            | KeelError::InsufficientShares { .. }
            | KeelError::LayerLimitReached { .. } => ErrorCategory::Capacity,

            KeelError::InvalidMessage(status) => {
                if status.is_structural() {
                    ErrorCategory::Invariant
                } else {
                    ErrorCategory::Precondition
                }
            }

            KeelError::AmountMismatch { .. }
            | KeelError::ArithmeticOverflow(_)
            | KeelError::Invariant(_)
            | KeelError::Serialization(_) => ErrorCategory::Invariant,

            KeelError::UnconfirmedMessage(_) | KeelError::Token(_) => ErrorCategory::Collaborator,

            KeelError::InvalidDividendRates(_) | KeelError::Configuration(_) => {
                ErrorCategory::Configuration
            }
        }
    }

    /// Whether reducing the requested amount could let the same call succeed.
    pub fn is_adjustable(&self) -> bool {
        self.category() == ErrorCategory::Capacity
    }

    /// Retries are caller-driven; no error is retryable as-is.
    pub fn is_retryable_with_same_input(&self) -> bool {
        false
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(e: serde_json::Error) -> Self {
        KeelError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(KeelError::SelfDealing.category(), ErrorCategory::Authorization);
        assert_eq!(KeelError::ZeroAmount.category(), ErrorCategory::Precondition);
        assert_eq!(
            KeelError::InsufficientLiquidity { available: 1, required: 2 }.category(),
            ErrorCategory::Capacity
        );
        assert_eq!(
            KeelError::InvalidMessage(FwStatus::HashMismatch).category(),
            ErrorCategory::Invariant
        );
        assert_eq!(
            KeelError::InvalidMessage(FwStatus::ZeroAmount).category(),
            ErrorCategory::Precondition
        );
        assert_eq!(
            KeelError::UnconfirmedMessage(MessageKey([0u8; 32])).category(),
            ErrorCategory::Collaborator
        );
    }

    #[test]
    fn test_only_capacity_is_adjustable() {
        assert!(KeelError::BelowMinimumFloor { remaining: 1, minimum: 2 }.is_adjustable());
        assert!(!KeelError::NothingToWithdraw.is_adjustable());
        assert!(!KeelError::BelowMinimumFloor { remaining: 1, minimum: 2 }
            .is_retryable_with_same_input());
    }

    #[test]
    fn test_display_carries_reason() {
        let err = KeelError::PastDeadline { deadline: 10, now: 11 };
        assert_eq!(err.to_string(), "Past deadline: deadline 10, now 11");
    }
}
