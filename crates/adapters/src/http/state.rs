use std::sync::Arc;
use std::time::Instant;

use application::conntrack_service_impl::ConnTrackAppService;
use application::firewall_service_impl::FirewallAppService;
use infrastructure::metrics::AgentMetrics;

/// Shared application state for the status server.
///
/// Passed to Axum handlers via `State(Arc<AppState>)`.
pub struct AppState {
    pub metrics: Arc<AgentMetrics>,
    pub firewall: Arc<FirewallAppService>,
    pub conntrack: Arc<ConnTrackAppService>,
    pub start_time: Instant,
    pub version: &'static str,
}

impl AppState {
    pub fn new(
        metrics: Arc<AgentMetrics>,
        firewall: Arc<FirewallAppService>,
        conntrack: Arc<ConnTrackAppService>,
    ) -> Self {
        Self {
            metrics,
            firewall,
            conntrack,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
