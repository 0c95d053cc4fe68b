use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::firewall_engine::{FirewallEngine, SweepStats};

/// Periodic state expiry.
///
/// Every tick scans a slice of the state list; every `interval` seconds of
/// engine time it also reclaims expired source nodes.
pub struct StateSweeper {
    engine: Arc<FirewallEngine>,
    period: Duration,
    last_coarse: u64,
}

impl StateSweeper {
    pub fn new(engine: Arc<FirewallEngine>) -> Self {
        let last_coarse = engine.now();
        Self {
            engine,
            period: Duration::from_secs(1),
            last_coarse,
        }
    }

    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Run until `cancel_token` fires. Call this from a spawned Tokio task.
    pub async fn run(mut self, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = interval.tick() => {
                    ticks += 1;
                    self.tick();
                }
            }
        }

        tracing::info!(ticks, "state sweeper stopped");
    }

    /// One sweep step plus the coarse source-node purge when it is due.
    pub fn tick(&mut self) -> SweepStats {
        let stats = self.engine.sweep();
        let now = self.engine.now();
        if now.saturating_sub(self.last_coarse) >= u64::from(self.engine.sweep_interval()) {
            self.engine.purge_src_nodes();
            self.last_coarse = now;
        }
        stats
    }
}
