// crates/keel-economics/src/fixed.rs
//
// Fixed-point conversions between principal and shares.
//
// The rebase index is principal-per-share scaled by INDEX_PRECISION (10^18).
// Products of two 18-decimal amounts overflow u128, so every multiply-then-
// divide goes through a 256-bit intermediate. All divisions floor toward
// zero: converting principal to shares and back never yields more than the
// original principal.

use ethnum::U256;

use keel_core::error::KeelError;
use keel_core::Amount;

/// Scale of the rebase index. An index of `INDEX_PRECISION` means 1 share = 1 principal.
pub const INDEX_PRECISION: u128 = 1_000_000_000_000_000_000;

/// Compute `floor(a * b / denominator)` without intermediate overflow.
///
/// # Errors
/// Returns `KeelError::ArithmeticOverflow` if `denominator` is zero or the
/// result does not fit in `u128`.
pub fn mul_div(a: u128, b: u128, denominator: u128) -> Result<u128, KeelError> {
    if denominator == 0 {
        return Err(KeelError::ArithmeticOverflow(format!(
            "division by zero computing {} * {} / 0",
            a, b
        )));
    }
    let wide = U256::from(a) * U256::from(b) / U256::from(denominator);
    let (high, low) = wide.into_words();
    if high != 0 {
        return Err(KeelError::ArithmeticOverflow(format!(
            "{} * {} / {} exceeds u128",
            a, b, denominator
        )));
    }
    Ok(low)
}

/// Shares bought by `principal` at `index`: `floor(principal * 10^18 / index)`.
pub fn principal_to_shares(principal: Amount, index: u128) -> Result<Amount, KeelError> {
    mul_div(principal, INDEX_PRECISION, index)
}

/// Principal represented by `shares` at `index`: `floor(shares * index / 10^18)`.
pub fn shares_to_principal(shares: Amount, index: u128) -> Result<Amount, KeelError> {
    mul_div(shares, index, INDEX_PRECISION)
}
