// crates/keel-daemon/src/main.rs
//
// Binary entrypoint for the Keel daemon.
//
// Parses CLI arguments, loads configuration, initializes tracing, seeds the
// simulated chain, runs the block scheduler and writes the event log on
// shutdown.

mod config;
mod error;
mod genesis;
mod scheduler;
mod shared;

use clap::Parser;
use config::DaemonConfig;
use error::DaemonError;
use scheduler::ChainScheduler;
use shared::DaemonSharedState;

use keel_economics::token::TokenAmount;
use keel_protocol::{BlockEnv, StakingContext};

/// Keel daemon: drives issuance and reward distribution on a simulated chain.
#[derive(Parser, Debug)]
#[command(name = "keel-daemon", version = "0.1.0", about = "Keel staking ledger daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "keel.toml")]
    config: String,

    /// Stop after this many blocks. Overrides `max_blocks` in the config.
    #[arg(long)]
    blocks: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args = Args::parse();

    // Fall back to defaults when the file is missing; a file that exists but
    // does not parse is fatal.
    let loaded = if std::path::Path::new(&args.config).exists() {
        Some(DaemonConfig::load(&args.config)?)
    } else {
        None
    };
    let loaded_from_file = loaded.is_some();
    let mut daemon_config = loaded.unwrap_or_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&daemon_config.log_level)),
        )
        .init();

    if loaded_from_file {
        tracing::info!("Loaded configuration from {}", args.config);
    } else {
        tracing::warn!("No config at {}. Using defaults.", args.config);
    }

    // CLI --blocks flag overrides the config file value.
    if args.blocks.is_some() {
        daemon_config.max_blocks = args.blocks;
    }

    let now = chrono::Utc::now();
    let genesis_block = BlockEnv::new(0, now.timestamp().max(0) as u64);
    tracing::info!("Keel Daemon v0.1.0");
    tracing::info!("Genesis time: {}", now.to_rfc3339());
    tracing::info!(
        "Issuance: {} tokens per block, every {} blocks",
        TokenAmount::from_base(daemon_config.protocol.issuance_rate_per_block),
        daemon_config.protocol.min_block_interval
    );
    tracing::info!("Blocks per tick: {}", daemon_config.blocks_per_tick);

    let mut context = StakingContext::new(&daemon_config.protocol, genesis_block)?;
    genesis::seed(&mut context, &daemon_config.genesis)?;
    let shared_state = DaemonSharedState::new(context);

    let mut scheduler = ChainScheduler::new(shared_state.clone(), &daemon_config);
    let ticks = scheduler.run().await?;

    let context = shared_state.context.read().await;
    let log = context.events().to_json_lines()?;
    std::fs::write(&daemon_config.event_log_path, log)?;
    tracing::info!(
        "Wrote {} events to {}",
        context.events().len(),
        daemon_config.event_log_path
    );
    tracing::info!("Final state: {}", context.summary_json()?);
    tracing::info!(
        "Keel daemon shut down gracefully after {} ticks ({}s)",
        ticks,
        shared_state.uptime_secs()
    );
    Ok(())
}
