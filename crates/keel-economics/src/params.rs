// crates/keel-economics/src/params.rs
//
// Protocol parameters for the rebase index and the layer registry.
//
// Loaded as the `[protocol]` table of the daemon's TOML configuration or
// populated with the defaults below. Amounts are in base units; since TOML
// integers are 64-bit, amounts may also be written as decimal strings
// (e.g. "100000000000000000000").

use serde::{Deserialize, Serialize};

use keel_core::error::KeelError;
use keel_core::{Address, Amount};

use crate::rebase::DividendSplit;
use crate::token::UNIT;

/// Default issuance: 3.92 tokens per block.
pub const DEFAULT_ISSUANCE_RATE_PER_BLOCK: Amount = 3_920_000_000_000_000_000;

/// Default minimum number of blocks between issuance updates.
pub const DEFAULT_MIN_BLOCK_INTERVAL: u64 = 300;

/// Default minimum security deposit for a sequencer layer: 100 tokens.
pub const DEFAULT_MINIMUM_DEPOSIT_FOR_SEQUENCER: Amount = 100 * UNIT;

/// Default minimum bond for a candidate operator: 200 tokens.
pub const DEFAULT_MINIMUM_DEPOSIT_FOR_CANDIDATE: Amount = 200 * UNIT;

/// Default unbonding delay in blocks.
pub const DEFAULT_DELAY_BLOCKS_FOR_WITHDRAW: u64 = 300;

/// Default maximum number of sequencer layers.
pub const DEFAULT_MAX_LAYER_COUNT: u32 = 1;

/// Tunable parameters of the staking ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolParams {
    /// Principal minted per elapsed block.
    #[serde(default = "default_issuance_rate_per_block", with = "amount_format")]
    pub issuance_rate_per_block: Amount,

    /// Issuance is a no-op until this many blocks have elapsed since the last one.
    #[serde(default = "default_min_block_interval")]
    pub min_block_interval: u64,

    #[serde(default)]
    pub dividend: DividendSplit,

    /// Treasury payout address (hex). Unset means the treasury bucket is unassigned.
    #[serde(default)]
    pub treasury: Option<String>,

    /// Secondary-holder payout address (hex).
    #[serde(default)]
    pub secondary_holders: Option<String>,

    #[serde(
        default = "default_minimum_deposit_for_sequencer",
        with = "amount_format"
    )]
    pub minimum_deposit_for_sequencer: Amount,

    #[serde(
        default = "default_minimum_deposit_for_candidate",
        with = "amount_format"
    )]
    pub minimum_deposit_for_candidate: Amount,

    #[serde(default = "default_delay_blocks_for_withdraw")]
    pub delay_blocks_for_withdraw: u64,

    #[serde(default = "default_max_layer_count")]
    pub max_layer_count: u32,
}

fn default_issuance_rate_per_block() -> Amount {
    DEFAULT_ISSUANCE_RATE_PER_BLOCK
}

fn default_min_block_interval() -> u64 {
    DEFAULT_MIN_BLOCK_INTERVAL
}

fn default_minimum_deposit_for_sequencer() -> Amount {
    DEFAULT_MINIMUM_DEPOSIT_FOR_SEQUENCER
}

fn default_minimum_deposit_for_candidate() -> Amount {
    DEFAULT_MINIMUM_DEPOSIT_FOR_CANDIDATE
}

fn default_delay_blocks_for_withdraw() -> u64 {
    DEFAULT_DELAY_BLOCKS_FOR_WITHDRAW
}

fn default_max_layer_count() -> u32 {
    DEFAULT_MAX_LAYER_COUNT
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            issuance_rate_per_block: default_issuance_rate_per_block(),
            min_block_interval: default_min_block_interval(),
            dividend: DividendSplit::default(),
            treasury: None,
            secondary_holders: None,
            minimum_deposit_for_sequencer: default_minimum_deposit_for_sequencer(),
            minimum_deposit_for_candidate: default_minimum_deposit_for_candidate(),
            delay_blocks_for_withdraw: default_delay_blocks_for_withdraw(),
            max_layer_count: default_max_layer_count(),
        }
    }
}

impl ProtocolParams {
    /// Check the parameters for internal consistency.
    ///
    /// # Errors
    /// Returns `KeelError::InvalidDividendRates` for a bad dividend split and
    /// `KeelError::Configuration` for a zero issuance interval or an
    /// unparsable payout address.
    pub fn validate(&self) -> Result<(), KeelError> {
        self.dividend.validate()?;
        if self.min_block_interval == 0 {
            return Err(KeelError::Configuration(
                "min_block_interval must be non-zero".to_string(),
            ));
        }
        self.treasury_address()?;
        self.secondary_holders_address()?;
        Ok(())
    }

    pub fn treasury_address(&self) -> Result<Option<Address>, KeelError> {
        parse_optional_address(self.treasury.as_deref())
    }

    pub fn secondary_holders_address(&self) -> Result<Option<Address>, KeelError> {
        parse_optional_address(self.secondary_holders.as_deref())
    }
}

fn parse_optional_address(value: Option<&str>) -> Result<Option<Address>, KeelError> {
    match value {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => s.trim().parse::<Address>().map(Some),
    }
}

/// Amounts as either a TOML/JSON integer or a decimal string; written back as a string.
pub mod amount_format {
    use serde::{Deserialize, Deserializer, Serializer};

    use keel_core::Amount;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => Ok(v as Amount),
            Raw::Text(s) => s
                .replace('_', "")
                .parse::<Amount>()
                .map_err(|e| serde::de::Error::custom(format!("invalid amount {:?}: {}", s, e))),
        }
    }
}
