// crates/keel-daemon/src/error.rs

use thiserror::Error;

use keel_core::error::KeelError;

/// Failures that stop the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] KeelError),
}
