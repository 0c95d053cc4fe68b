use ports::secondary::metrics_port::{PacketMetrics, RulesetMetrics, StateMetrics, SweepMetrics};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

// ── Label types ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PacketLabels {
    pub interface: String,
    pub direction: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VerdictLabels {
    pub verdict: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CauseLabels {
    pub cause: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String,
}

// ── Agent metrics registry ──────────────────────────────────────────

/// Prometheus metrics registry for the agent.
///
/// All metric families use interior mutability (atomics), so recording
/// metrics only requires `&self`. Wrap in `Arc` for multi-task sharing.
pub struct AgentMetrics {
    registry: Registry,
    pub packets_total: Family<PacketLabels, Counter>,
    pub bytes_total: Family<PacketLabels, Counter>,
    pub verdicts_total: Family<VerdictLabels, Counter>,
    pub drops_total: Family<ReasonLabels, Counter>,
    pub states: Gauge,
    pub src_nodes: Gauge,
    pub state_inserts_total: Counter,
    pub state_removals_total: Family<CauseLabels, Counter>,
    pub sweep_scanned: Histogram,
    pub sweep_expired_total: Counter,
    pub sweep_freed_total: Counter,
    pub src_nodes_purged_total: Counter,
    pub rules_loaded: Gauge,
    pub config_reloads_total: Family<ResultLabels, Counter>,
}

impl AgentMetrics {
    /// Create a new metrics registry with all metrics registered under
    /// the `statewall` prefix.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("statewall");

        let packets_total = Family::<PacketLabels, Counter>::default();
        registry.register(
            "packets",
            "Packets evaluated, by interface and direction",
            packets_total.clone(),
        );

        let bytes_total = Family::<PacketLabels, Counter>::default();
        registry.register(
            "bytes",
            "Bytes evaluated, by interface and direction",
            bytes_total.clone(),
        );

        let verdicts_total = Family::<VerdictLabels, Counter>::default();
        registry.register("verdicts", "Verdicts returned", verdicts_total.clone());

        let drops_total = Family::<ReasonLabels, Counter>::default();
        registry.register("drops", "Dropped packets by reason", drops_total.clone());

        let states = Gauge::default();
        registry.register("states", "Live state entries", states.clone());

        let src_nodes = Gauge::default();
        registry.register("src_nodes", "Live source-tracking nodes", src_nodes.clone());

        let state_inserts_total = Counter::default();
        registry.register(
            "state_inserts",
            "State entries inserted",
            state_inserts_total.clone(),
        );

        let state_removals_total = Family::<CauseLabels, Counter>::default();
        registry.register(
            "state_removals",
            "State entries unlinked, by cause",
            state_removals_total.clone(),
        );

        // 1 .. 16384 states per step
        let sweep_scanned = Histogram::new(exponential_buckets(1.0, 4.0, 8));
        registry.register(
            "sweep_scanned_states",
            "States visited per sweep step",
            sweep_scanned.clone(),
        );

        let sweep_expired_total = Counter::default();
        registry.register(
            "sweep_expired",
            "States found expired by the sweeper",
            sweep_expired_total.clone(),
        );

        let sweep_freed_total = Counter::default();
        registry.register(
            "sweep_freed",
            "States released by the sweeper",
            sweep_freed_total.clone(),
        );

        let src_nodes_purged_total = Counter::default();
        registry.register(
            "src_nodes_purged",
            "Source nodes reclaimed by the coarse sweep",
            src_nodes_purged_total.clone(),
        );

        let rules_loaded = Gauge::default();
        registry.register(
            "rules_loaded",
            "Rules in the active ruleset, anchors included",
            rules_loaded.clone(),
        );

        let config_reloads_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "config_reloads",
            "Ruleset reload attempts",
            config_reloads_total.clone(),
        );

        Self {
            registry,
            packets_total,
            bytes_total,
            verdicts_total,
            drops_total,
            states,
            src_nodes,
            state_inserts_total,
            state_removals_total,
            sweep_scanned,
            sweep_expired_total,
            sweep_freed_total,
            src_nodes_purged_total,
            rules_loaded,
            config_reloads_total,
        }
    }

    /// Encode all registered metrics to `OpenMetrics` text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn gauge_value(count: u64) -> i64 {
    count.try_into().unwrap_or(i64::MAX)
}

// ── Sub-trait implementations ──────────────────────────────────────

impl PacketMetrics for AgentMetrics {
    fn record_packet(&self, interface: &str, direction: &str, bytes: u64) {
        let labels = PacketLabels {
            interface: interface.to_string(),
            direction: direction.to_string(),
        };
        self.packets_total.get_or_create(&labels).inc();
        self.bytes_total.get_or_create(&labels).inc_by(bytes);
    }

    fn record_verdict(&self, verdict: &str) {
        self.verdicts_total
            .get_or_create(&VerdictLabels {
                verdict: verdict.to_string(),
            })
            .inc();
    }

    fn record_drop(&self, reason: &str) {
        self.drops_total
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }
}

impl StateMetrics for AgentMetrics {
    fn set_states(&self, count: u64) {
        self.states.set(gauge_value(count));
    }

    fn set_src_nodes(&self, count: u64) {
        self.src_nodes.set(gauge_value(count));
    }

    fn record_state_insert(&self) {
        self.state_inserts_total.inc();
    }

    fn record_state_removal(&self, cause: &str, count: u64) {
        self.state_removals_total
            .get_or_create(&CauseLabels {
                cause: cause.to_string(),
            })
            .inc_by(count);
    }
}

impl SweepMetrics for AgentMetrics {
    #[allow(clippy::cast_precision_loss)]
    fn record_sweep(&self, scanned: u64, freed: u64, expired: u64) {
        self.sweep_scanned.observe(scanned as f64);
        self.sweep_freed_total.inc_by(freed);
        self.sweep_expired_total.inc_by(expired);
    }

    fn record_src_nodes_purged(&self, count: u64) {
        self.src_nodes_purged_total.inc_by(count);
    }
}

impl RulesetMetrics for AgentMetrics {
    fn set_rules_loaded(&self, count: u64) {
        self.rules_loaded.set(gauge_value(count));
    }

    fn record_config_reload(&self, result: &str) {
        self.config_reloads_total
            .get_or_create(&ResultLabels {
                result: result.to_string(),
            })
            .inc();
    }
}

// MetricsPort is automatically implemented via the blanket impl
// since AgentMetrics implements all sub-traits.
