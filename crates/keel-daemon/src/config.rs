// crates/keel-daemon/src/config.rs
//
// Runtime configuration for the Keel daemon.
// Loaded from a TOML file or populated with defaults.

use serde::Deserialize;
use std::fs;

use keel_core::Amount;
use keel_economics::params::{amount_format, ProtocolParams};

use crate::error::DaemonError;

/// Runtime configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Ledger parameters, the `[protocol]` table.
    #[serde(default)]
    pub protocol: ProtocolParams,

    /// Log level: "trace", "debug", "info", "warn", "error". `RUST_LOG` wins.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Wall-clock milliseconds between ticks.
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,

    /// Simulated blocks advanced per tick.
    #[serde(default = "default_blocks_per_tick")]
    pub blocks_per_tick: u64,

    /// Simulated seconds per block.
    #[serde(default = "default_seconds_per_block")]
    pub seconds_per_block: u64,

    /// Stop after this many blocks. Runs until Ctrl-C when unset.
    #[serde(default)]
    pub max_blocks: Option<u64>,

    /// Where the JSON-lines event log is written on shutdown.
    #[serde(default = "default_event_log_path")]
    pub event_log_path: String,

    #[serde(default)]
    pub genesis: GenesisConfig,
}

/// Accounts seeded before the first tick. A zero sequencer deposit seeds nothing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenesisConfig {
    #[serde(default, with = "amount_format")]
    pub sequencer_deposit: Amount,

    #[serde(default, with = "amount_format")]
    pub staker_principal: Amount,

    /// Escrowed in the genesis layer's bridge; weights reward distribution.
    #[serde(default, with = "amount_format")]
    pub bridge_deposit: Amount,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_block_time_ms() -> u64 {
    1_000
}

fn default_blocks_per_tick() -> u64 {
    25
}

fn default_seconds_per_block() -> u64 {
    12
}

fn default_event_log_path() -> String {
    "keel-events.jsonl".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolParams::default(),
            log_level: default_log_level(),
            block_time_ms: default_block_time_ms(),
            blocks_per_tick: default_blocks_per_tick(),
            seconds_per_block: default_seconds_per_block(),
            max_blocks: None,
            event_log_path: default_event_log_path(),
            genesis: GenesisConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self, DaemonError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, DaemonError> {
        let config: DaemonConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DaemonError> {
        self.protocol.validate()?;
        if self.blocks_per_tick == 0 {
            return Err(DaemonError::Config("blocks_per_tick must be non-zero".to_string()));
        }
        Ok(())
    }
}
