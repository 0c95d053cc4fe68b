use std::time::Duration;

// ── Agent defaults ─────────────────────────────────────────────────

pub const DEFAULT_CONFIG_PATH: &str = "/etc/statewall/config.yaml";
pub const DEFAULT_METRICS_PORT: u16 = 9090;
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_CREATOR_ID: u32 = 1;

// ── Channel capacities ─────────────────────────────────────────────

/// Replication events buffered before the exporter starts dropping.
pub const EXPORT_CHANNEL_CAPACITY: usize = 10_000;

// ── Timing ─────────────────────────────────────────────────────────

/// Period of one bounded sweep step.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);

pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_capacity_is_positive() {
        assert!(EXPORT_CHANNEL_CAPACITY > 0);
    }

    #[test]
    fn creator_id_default_is_usable() {
        assert_ne!(DEFAULT_CREATOR_ID, 0);
    }

    #[test]
    fn shutdown_timeout_is_reasonable() {
        assert!(GRACEFUL_SHUTDOWN_TIMEOUT.as_secs() >= 1);
        assert!(GRACEFUL_SHUTDOWN_TIMEOUT.as_secs() <= 30);
        assert!(SWEEP_PERIOD < GRACEFUL_SHUTDOWN_TIMEOUT);
    }
}
