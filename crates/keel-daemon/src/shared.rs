// crates/keel-daemon/src/shared.rs
//
// DaemonSharedState: the ledger state shared between the scheduler task and
// the shutdown path in main.rs.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use keel_protocol::StakingContext;

#[derive(Clone)]
pub struct DaemonSharedState {
    pub context: Arc<RwLock<StakingContext>>,
    /// Daemon start time for uptime calculation.
    pub start_time: Instant,
}

impl DaemonSharedState {
    pub fn new(context: StakingContext) -> Self {
        Self {
            context: Arc::new(RwLock::new(context)),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
