// Focused sub-traits for recording Prometheus metrics, grouped by concern.
//
// All methods take `&self` because the underlying implementation uses
// atomic operations (interior mutability via `prometheus-client`).
//
// Default implementations are no-ops, allowing test mocks to implement
// only the sub-traits relevant to the code under test.

// ── Packet processing metrics ──────────────────────────────────────

pub trait PacketMetrics: Send + Sync {
    /// Record a packet that reached a verdict, labelled by interface and
    /// direction (in/out).
    fn record_packet(&self, _interface: &str, _direction: &str, _bytes: u64) {}

    /// Record a verdict (pass, drop, synproxy-drop, afrt, divert, defer).
    fn record_verdict(&self, _verdict: &str) {}

    /// Record a dropped packet by drop reason.
    fn record_drop(&self, _reason: &str) {}
}

// ── State table metrics ────────────────────────────────────────────

pub trait StateMetrics: Send + Sync {
    /// Set the number of live states.
    fn set_states(&self, _count: u64) {}

    /// Set the number of source nodes.
    fn set_src_nodes(&self, _count: u64) {}

    /// Record a state inserted into the table.
    fn record_state_insert(&self) {}

    /// Record states unlinked, labelled by cause (expired, closed, killed,
    /// flushed, overload, replaced).
    fn record_state_removal(&self, _cause: &str, _count: u64) {}
}

// ── Sweeper metrics ────────────────────────────────────────────────

pub trait SweepMetrics: Send + Sync {
    /// Record one sweep step.
    fn record_sweep(&self, _scanned: u64, _freed: u64, _expired: u64) {}

    /// Record source nodes reclaimed by the coarse sweep.
    fn record_src_nodes_purged(&self, _count: u64) {}
}

// ── Ruleset metrics ────────────────────────────────────────────────

pub trait RulesetMetrics: Send + Sync {
    /// Set the number of rules across main and anchors.
    fn set_rules_loaded(&self, _count: u64) {}

    /// Record a ruleset or configuration reload attempt (success or failure).
    fn record_config_reload(&self, _result: &str) {}
}

// ── Composite super-trait ──────────────────────────────────────────

/// Unified metrics port composing all sub-traits.
///
/// Services accept `Arc<dyn MetricsPort>` for full access. The sub-traits
/// provide default no-op implementations so that test mocks only need to
/// override the methods they care about.
pub trait MetricsPort: PacketMetrics + StateMetrics + SweepMetrics + RulesetMetrics {}

/// Blanket implementation: any type implementing all sub-traits automatically
/// implements `MetricsPort`.
impl<T> MetricsPort for T where T: PacketMetrics + StateMetrics + SweepMetrics + RulesetMetrics {}
