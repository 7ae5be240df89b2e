// crates/keel-daemon/src/scheduler.rs
//
// Block scheduler for the Keel daemon.
//
// Each tick advances the simulated chain by `blocks_per_tick` blocks, applies
// issuance (rate-limited by the ledger's minimum interval) and distributes
// the layer reward pool when it holds anything.

use std::time::Duration;

use tracing::{debug, info};

use keel_core::Amount;
use keel_economics::rebase::IssuanceResult;
use keel_economics::token::TokenAmount;

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::shared::DaemonSharedState;

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub block: u64,
    pub issuance: IssuanceResult,
    pub distributed: Amount,
}

pub struct ChainScheduler {
    shared: DaemonSharedState,
    block_time: Duration,
    blocks_per_tick: u64,
    seconds_per_block: u64,
    max_blocks: Option<u64>,
}

impl ChainScheduler {
    pub fn new(shared: DaemonSharedState, config: &DaemonConfig) -> Self {
        Self {
            shared,
            block_time: Duration::from_millis(config.block_time_ms),
            blocks_per_tick: config.blocks_per_tick,
            seconds_per_block: config.seconds_per_block,
            max_blocks: config.max_blocks,
        }
    }

    /// Tick until Ctrl-C or until `max_blocks` is reached. Returns the
    /// number of ticks run.
    pub async fn run(&mut self) -> Result<u64, DaemonError> {
        info!(
            blocks_per_tick = self.blocks_per_tick,
            block_time_ms = self.block_time.as_millis() as u64,
            max_blocks = ?self.max_blocks,
            "chain scheduler started"
        );

        let mut ticks = 0;
        loop {
            if self.finished().await {
                break;
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("chain scheduler received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(self.block_time) => {
                    let outcome = self.tick().await?;
                    ticks += 1;
                    if outcome.distributed > 0 {
                        info!(
                            block = outcome.block,
                            distributed = %TokenAmount::from_base(outcome.distributed),
                            index = outcome.issuance.index_after,
                            "layer rewards distributed"
                        );
                    }
                }
            }
        }
        Ok(ticks)
    }

    async fn finished(&self) -> bool {
        match self.max_blocks {
            Some(max) => self.shared.context.read().await.block().number >= max,
            None => false,
        }
    }

    /// Advance one tick. The last tick is shortened so the chain stops at
    /// exactly `max_blocks`.
    pub async fn tick(&self) -> Result<TickOutcome, DaemonError> {
        let mut cx = self.shared.context.write().await;
        let first_event = cx.events().len() as u64;
        let current = cx.block().number;
        let blocks = match self.max_blocks {
            Some(max) => self.blocks_per_tick.min(max.saturating_sub(current)),
            None => self.blocks_per_tick,
        };
        cx.advance(blocks, self.seconds_per_block);
        let block = cx.block().number;

        let issuance = cx.update_issuance()?;
        if issuance.is_skipped() {
            debug!(block, "issuance skipped");
        } else {
            info!(
                block,
                minted = issuance.minted,
                to_stakers = issuance.to_stakers,
                to_layers = issuance.to_layers,
                unassigned = issuance.unassigned,
                index = issuance.index_after,
                "issuance"
            );
        }

        let distributed = if cx.registry().total_undistributed_rewards() > 0 {
            cx.distribute()?.distributed
        } else {
            0
        };
        for record in cx.events().since(first_event) {
            debug!(sequence = record.sequence, event = ?record.event, "ledger event");
        }

        Ok(TickOutcome {
            block,
            issuance,
            distributed,
        })
    }
}
