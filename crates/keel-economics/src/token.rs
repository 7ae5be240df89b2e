// crates/keel-economics/src/token.rs
//
// Token amounts and the in-memory principal token.
//
// The smallest unit of the principal token is one base unit; 1 token =
// 10^18 base units. All internal accounting uses base units in u128 to avoid
// floating-point precision issues.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use keel_core::error::KeelError;
use keel_core::traits::TokenLedger;
use keel_core::{Address, Amount};

/// Number of base units in one whole token.
pub const UNIT: Amount = 1_000_000_000_000_000_000;

/// Number of decimals of the principal token.
pub const DECIMALS: u32 = 18;

/// A token amount, displayed in whole tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenAmount {
    /// Amount in base units.
    pub base: Amount,
}

impl TokenAmount {
    /// Create an amount from a whole-token value.
    pub fn from_tokens(tokens: u64) -> Self {
        Self {
            base: tokens as Amount * UNIT,
        }
    }

    pub fn from_base(base: Amount) -> Self {
        Self { base }
    }

    pub fn zero() -> Self {
        Self { base: 0 }
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.base / UNIT;
        let frac = self.base % UNIT;
        if frac == 0 {
            write!(f, "{}", whole)
        } else {
            // Up to 18 decimal places, trailing zeros trimmed
            let frac_str = format!("{:018}", frac);
            let trimmed = frac_str.trim_end_matches('0');
            write!(f, "{}.{}", whole, trimmed)
        }
    }
}

/// In-memory principal token with balances and allowances.
///
/// Backs the ledger in tests and in the daemon's simulated chain.
#[derive(Debug, Clone, Default)]
pub struct InMemoryToken {
    balances: BTreeMap<Address, Amount>,
    allowances: BTreeMap<(Address, Address), Amount>,
    total_supply: Amount,
}

impl InMemoryToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `spender` to move up to `amount` of `owner`'s balance.
    pub fn approve(&mut self, owner: &Address, spender: &Address, amount: Amount) {
        self.allowances.insert((*owner, *spender), amount);
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(&(*owner, *spender))
            .copied()
            .unwrap_or(0)
    }

    fn debit(&mut self, from: &Address, amount: Amount) -> Result<(), KeelError> {
        let balance = self.balance_of(from);
        if balance < amount {
            return Err(KeelError::Token(format!(
                "insufficient balance for {}: has {}, needs {}",
                from, balance, amount
            )));
        }
        self.balances.insert(*from, balance - amount);
        Ok(())
    }

    fn credit(&mut self, to: &Address, amount: Amount) -> Result<(), KeelError> {
        let balance = self.balance_of(to);
        let next = balance
            .checked_add(amount)
            .ok_or_else(|| KeelError::ArithmeticOverflow(format!("balance of {}", to)))?;
        self.balances.insert(*to, next);
        Ok(())
    }
}

impl TokenLedger for InMemoryToken {
    fn balance_of(&self, account: &Address) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn transfer(&mut self, from: &Address, to: &Address, amount: Amount) -> Result<(), KeelError> {
        if to.is_zero() {
            return Err(KeelError::Token("transfer to the zero address".to_string()));
        }
        self.debit(from, amount)?;
        self.credit(to, amount)
    }

    fn transfer_from(
        &mut self,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), KeelError> {
        let allowed = self.allowance(from, spender);
        if allowed < amount {
            return Err(KeelError::Token(format!(
                "insufficient allowance for {} from {}: has {}, needs {}",
                spender, from, allowed, amount
            )));
        }
        self.transfer(from, to, amount)?;
        self.allowances.insert((*from, *spender), allowed - amount);
        Ok(())
    }

    fn mint(&mut self, to: &Address, amount: Amount) -> Result<(), KeelError> {
        if to.is_zero() {
            return Err(KeelError::Token("mint to the zero address".to_string()));
        }
        let supply = self
            .total_supply
            .checked_add(amount)
            .ok_or_else(|| KeelError::ArithmeticOverflow("total supply".to_string()))?;
        self.credit(to, amount)?;
        self.total_supply = supply;
        Ok(())
    }

    fn total_supply(&self) -> Amount {
        self.total_supply
    }
}
