use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use domain::common::entity::{AddressFamily, Direction, DropReason, Protocol, Verdict};
use domain::common::error::DomainError;
use domain::common::packet::{PacketInfo, TH_ACK, TH_FIN, TH_RST, TH_SYN};
use domain::conntrack::builder::{BuildEnv, create_state};
use domain::conntrack::entity::{Limits, State, StateFlags, StateKey, Timeouts};
use domain::conntrack::icmp::{self, IcmpKind};
use domain::conntrack::snapshot::{self, StateSnapshot};
use domain::conntrack::store::{StateStore, StoreStatus};
use domain::conntrack::tcp::{self, TcpOutcome};
use domain::conntrack::{flow, synproxy};
use domain::firewall::engine::{DEFAULT_RULE_NR, RuleEngine};
use domain::firewall::entity::{Emitted, Evaluation, Rule, RuleAction, TcpSegment};
use domain::firewall::evaluator::{RuleInput, RuleMatch};
use domain::firewall::table::TableStore;
use domain::nat::resolver;
use ports::secondary::address_pool_port::AddressPoolPort;
use ports::secondary::checksum_port::ChecksumPort;
use ports::secondary::clock_port::ClockPort;
use ports::secondary::metrics_port::MetricsPort;
use ports::secondary::packet_log_port::{PacketLogPort, PacketLogRecord};
use ports::secondary::state_export_port::{ExportAck, StateExportPort};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// ICMP code for "port unreachable" in each family.
const UNREACH_PORT_V4: u8 = 3;
const UNREACH_PORT_V6: u8 = 4;

const VERDICT_SLOTS: usize = 6;

fn verdict_slot(v: Verdict) -> usize {
    match v {
        Verdict::Pass => 0,
        Verdict::Drop => 1,
        Verdict::SynproxyDrop => 2,
        Verdict::Afrt => 3,
        Verdict::Divert(_) => 4,
        Verdict::Defer => 5,
    }
}

const VERDICT_NAMES: [&str; VERDICT_SLOTS] =
    ["pass", "drop", "synproxy-drop", "afrt", "divert", "defer"];

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Creator id stamped on every local state; must be non-zero.
    pub creator_id: u32,
    pub timeouts: Timeouts,
    pub limits: Limits,
    /// Fixed seed for reproducible runs. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            creator_id: 1,
            timeouts: Timeouts::default(),
            limits: Limits::default(),
            rng_seed: None,
        }
    }
}

#[derive(Debug, Default)]
struct EngineCounters {
    verdicts: [AtomicU64; VERDICT_SLOTS],
    drops: [AtomicU64; DropReason::ALL.len()],
}

/// Point-in-time view of the engine for operators.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub store: StoreStatus,
    pub verdicts: BTreeMap<String, u64>,
    pub drops: BTreeMap<String, u64>,
    pub rules: usize,
    pub generation: u64,
    pub checksum: u64,
    pub congested: bool,
}

/// Work done by one sweeper step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub freed: usize,
    pub expired: usize,
}

enum Lookup {
    /// No usable state; evaluate the rules.
    Miss,
    Done(Evaluation),
}

/// The packet filter: loaded rules, address tables, the state store and
/// the host collaborators.
///
/// `evaluate` is the inbound hook and runs synchronously to a verdict.
/// Lock order is store, then state, then the rng; the rng is never held
/// while another lock is taken.
pub struct FirewallEngine {
    rules: RwLock<Arc<RuleEngine>>,
    tables: TableStore,
    store: RwLock<StateStore>,
    rng: Mutex<StdRng>,
    counters: EngineCounters,
    congested: AtomicBool,
    shutdown: CancellationToken,
    clock: Arc<dyn ClockPort>,
    metrics: Arc<dyn MetricsPort>,
    pool: Option<Arc<dyn AddressPoolPort>>,
    checksum: Option<Arc<dyn ChecksumPort>>,
    exporter: Option<Arc<dyn StateExportPort>>,
    packet_log: Option<Arc<dyn PacketLogPort>>,
}

impl FirewallEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn ClockPort>,
        metrics: Arc<dyn MetricsPort>,
    ) -> Result<Self, DomainError> {
        if config.creator_id == 0 {
            return Err(DomainError::InvalidConfig(
                "creator id must be non-zero".to_string(),
            ));
        }
        let mut store = StateStore::new(config.creator_id, Timeouts::default(), Limits::default());
        store.set_timeouts(config.timeouts)?;
        store.set_limits(config.limits)?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            rules: RwLock::new(Arc::new(RuleEngine::new())),
            tables: TableStore::default(),
            store: RwLock::new(store),
            rng: Mutex::new(rng),
            counters: EngineCounters::default(),
            congested: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            clock,
            metrics,
            pool: None,
            checksum: None,
            exporter: None,
            packet_log: None,
        })
    }

    /// Resolve interface-named pool entries through `pool`.
    #[must_use]
    pub fn with_address_pool(mut self, pool: Arc<dyn AddressPoolPort>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Verify checksums before state creation and fix them after rewrites.
    #[must_use]
    pub fn with_checksum(mut self, checksum: Arc<dyn ChecksumPort>) -> Self {
        self.checksum = Some(checksum);
        self
    }

    /// Export state changes for replication.
    #[must_use]
    pub fn with_exporter(mut self, exporter: Arc<dyn StateExportPort>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Send packets matched by `log` rules to `sink`.
    #[must_use]
    pub fn with_packet_log(mut self, sink: Arc<dyn PacketLogPort>) -> Self {
        self.packet_log = Some(sink);
        self
    }

    // ── Inbound hook ───────────────────────────────────────────────

    /// Run one packet through the filter.
    ///
    /// `af` is the family of the hook the packet arrived on; a descriptor
    /// of another family is dropped as malformed.
    pub fn evaluate(
        &self,
        af: AddressFamily,
        dir: Direction,
        ifname: &str,
        pkt: &mut PacketInfo,
    ) -> Evaluation {
        let now = self.clock.now_secs();
        let seen = (pkt.af, pkt.proto, pkt.src, pkt.sport, pkt.dst, pkt.dport);

        let ev = if pkt.af != af {
            debug!(hook = af.as_str(), packet = pkt.af.as_str(), "address family mismatch");
            Evaluation::drop(DropReason::Short)
        } else {
            self.process(dir, ifname, pkt, now)
        };

        if pkt.checksum_dirty
            && let Some(ref checksum) = self.checksum
        {
            checksum.recompute(pkt);
        }
        self.account(&ev, dir, ifname, pkt.tot_len);
        if ev.log
            && let Some(ref sink) = self.packet_log
        {
            let (af, proto, src, sport, dst, dport) = seen;
            sink.log(&PacketLogRecord {
                verdict: ev.verdict,
                reason: ev.reason,
                direction: dir,
                ifname: ifname.to_string(),
                rule: ev.rule.as_ref().map(|r| r.nr).filter(|nr| *nr != DEFAULT_RULE_NR),
                anchor: ev.anchor.as_ref().and_then(|a| a.anchor.clone()),
                ruleset: ev.ruleset.clone(),
                af,
                proto,
                src,
                sport,
                dst,
                dport,
                state: ev.state,
            });
        }
        ev
    }

    fn process(&self, dir: Direction, ifname: &str, pkt: &mut PacketInfo, now: u64) -> Evaluation {
        if !pkt.fragment {
            let short = match pkt.proto {
                Protocol::Tcp => pkt.tcp.is_none(),
                Protocol::Icmp | Protocol::Icmpv6 => pkt.icmp.is_none(),
                _ => false,
            };
            if short {
                return Evaluation::drop(DropReason::Short);
            }
        }
        if pkt.fragment {
            return self.test_rules(dir, ifname, pkt, now);
        }

        let kind = icmp::classify(pkt);
        let lookup = match kind {
            Some(IcmpKind::Error) => self.test_icmp_error(dir, ifname, pkt),
            _ => self.test_state(dir, ifname, pkt, kind, now),
        };
        match lookup {
            Lookup::Done(ev) => ev,
            Lookup::Miss => self.test_rules(dir, ifname, pkt, now),
        }
    }

    // ── State path ─────────────────────────────────────────────────

    fn test_state(
        &self,
        dir: Direction,
        ifname: &str,
        pkt: &mut PacketInfo,
        kind: Option<IcmpKind>,
        now: u64,
    ) -> Lookup {
        let key = StateKey::for_packet(
            dir,
            pkt.af,
            pkt.proto,
            pkt.src,
            pkt.sport,
            pkt.dst,
            pkt.dport,
            pkt.rdomain,
        );
        let Some(state) = self.read_store().find(&key, dir, ifname) else {
            return Lookup::Miss;
        };

        let mut emitted = Vec::new();
        let mut consumed = false;
        let mut run_connlimit = false;
        {
            let mut inner = state.lock();
            if inner.is_unlinked() {
                return Lookup::Miss;
            }
            match pkt.proto {
                Protocol::Tcp => {
                    let mut rng = self.rng();
                    let proxied =
                        synproxy::track(&state, &mut inner, pkt, dir, &mut *rng, now);
                    match proxied {
                        Some(Ok(step)) => {
                            consumed = true;
                            run_connlimit = step.client_acked;
                            emitted.extend(step.emitted.into_iter().map(Emitted::Tcp));
                        }
                        Some(Err(reason)) => {
                            return Lookup::Done(state_drop(&state, reason, Vec::new()));
                        }
                        None => match tcp::track(&state, &mut inner, pkt, dir, &mut *rng, now) {
                            Ok(TcpOutcome::Pass) => {}
                            Ok(TcpOutcome::Established) => run_connlimit = true,
                            Ok(TcpOutcome::Reuse) => {
                                drop(rng);
                                drop(inner);
                                self.remove_state(&state, "reused", now);
                                return Lookup::Miss;
                            }
                            Err(reject) => {
                                let rst = reject.rst.map(Emitted::Tcp).into_iter().collect();
                                return Lookup::Done(state_drop(&state, reject.reason, rst));
                            }
                        },
                    }
                }
                Protocol::Icmp | Protocol::Icmpv6 => {
                    if let Some(kind) = kind
                        && let Err(reason) = icmp::track_query(&state, &mut inner, dir, kind, now)
                    {
                        return Lookup::Done(state_drop(&state, reason, Vec::new()));
                    }
                }
                Protocol::Udp | Protocol::Other(_) => flow::track(&state, &mut inner, dir, now),
            }

            if !consumed {
                if pkt.ip_options && !inner.flags.contains(StateFlags::ALLOW_OPTS) {
                    return Lookup::Done(state_drop(&state, DropReason::IpOptions, Vec::new()));
                }
                let slot = usize::from(dir != state.direction);
                inner.packets[slot] += 1;
                inner.bytes[slot] += u64::from(pkt.tot_len);
            }
        }

        if run_connlimit && let Err(reason) = self.connlimit(&state, now) {
            return Lookup::Done(state_drop(&state, reason, Vec::new()));
        }
        if consumed {
            let mut ev = state_pass(&state);
            ev.verdict = Verdict::SynproxyDrop;
            ev.emitted = emitted;
            return Lookup::Done(ev);
        }

        for rule in state.counted_rules() {
            rule.counters.record_packet(dir, u64::from(pkt.tot_len));
        }
        let af_changed = resolver::translate(pkt, &state, dir);
        if let Some(snap) = self.snapshot(&state, now)
            && let Some(ref exporter) = self.exporter
            && let Err(e) = exporter.on_update(&snap)
        {
            warn!(state = %state.id, error = %e, "state update export failed");
        }

        let mut ev = state_pass(&state);
        ev.verdict = pass_verdict(&state.rule, af_changed);
        Lookup::Done(ev)
    }

    fn test_icmp_error(&self, dir: Direction, ifname: &str, pkt: &mut PacketInfo) -> Lookup {
        let Some(key) = icmp::error_key(dir, pkt) else {
            return Lookup::Done(Evaluation::drop(DropReason::Short));
        };
        let Some(state) = self.read_store().find(&key, dir, ifname) else {
            return Lookup::Miss;
        };
        {
            let mut inner = state.lock();
            if inner.is_unlinked() {
                return Lookup::Miss;
            }
            if let Err(reason) = icmp::check_error(&state, &inner, dir, pkt) {
                return Lookup::Done(state_drop(&state, reason, Vec::new()));
            }
            let slot = usize::from(dir != state.direction);
            inner.packets[slot] += 1;
            inner.bytes[slot] += u64::from(pkt.tot_len);
        }
        for rule in state.counted_rules() {
            rule.counters.record_packet(dir, u64::from(pkt.tot_len));
        }
        Lookup::Done(state_pass(&state))
    }

    /// Count an established connection; over the limit the state and
    /// possibly the source's other states are gone.
    fn connlimit(&self, state: &Arc<State>, now: u64) -> Result<(), DropReason> {
        let result = self.write_store().connlimit(state, &self.tables, now);
        let Err(exceeded) = result else {
            return Ok(());
        };
        info!(
            state = %state.id,
            rule = state.rule.nr,
            removed = exceeded.removed.len(),
            error = %exceeded.error,
            "source connection limit"
        );
        self.metrics
            .record_state_removal("overload", exceeded.removed.len() as u64);
        for s in &exceeded.removed {
            self.export_delete(s, now);
        }
        Err(exceeded.error.reason())
    }

    // ── Rule path ──────────────────────────────────────────────────

    fn test_rules(&self, dir: Direction, ifname: &str, pkt: &mut PacketInfo, now: u64) -> Evaluation {
        let rules = self.ruleset();
        let rm = rules.evaluate(&RuleInput { dir, ifname, pkt: &*pkt }, &self.tables);

        let bytes = u64::from(pkt.tot_len);
        for rule in std::iter::once(&rm.rule)
            .chain(rm.anchor.iter())
            .chain(rm.matches.iter())
        {
            rule.counters.record_packet(dir, bytes);
        }
        if let Some(ref tag) = rm.actions.tag {
            pkt.tag = Some(tag.clone());
        }

        let mut ev = Evaluation {
            verdict: Verdict::Pass,
            reason: None,
            rule: Some(Arc::clone(&rm.rule)),
            anchor: rm.anchor.clone(),
            ruleset: rm.ruleset.clone(),
            state: None,
            log: rm.actions.log || rm.rule.log,
            emitted: Vec::new(),
        };

        if rm.rule.action == RuleAction::Block {
            if rm.rule.block_return {
                ev.emitted.extend(block_reply(pkt));
            }
            return reject(ev, DropReason::Match);
        }
        if pkt.ip_options && !rm.rule.allow_opts {
            debug!(rule = rm.rule.nr, "ip options without allow-opts");
            return reject(ev, DropReason::IpOptions);
        }

        let wants_state = rm.rule.creates_state() || rm.actions.translation.is_some();
        if pkt.fragment {
            if rm.actions.translation.is_some() {
                return reject(ev, DropReason::Fragment);
            }
            ev.verdict = pass_verdict(&rm.rule, false);
            return ev;
        }
        if !wants_state {
            ev.verdict = pass_verdict(&rm.rule, false);
            return ev;
        }

        if self.congested.load(Ordering::Relaxed) {
            return reject(ev, DropReason::Congestion);
        }
        if let Some(ref checksum) = self.checksum
            && !checksum.verify(pkt)
        {
            return reject(ev, DropReason::BadChecksum);
        }

        self.create(ev, &rm, dir, ifname, pkt, now)
    }

    fn create(
        &self,
        mut ev: Evaluation,
        rm: &RuleMatch,
        dir: Direction,
        ifname: &str,
        pkt: &mut PacketInfo,
        now: u64,
    ) -> Evaluation {
        let mut rng = StdRng::seed_from_u64(self.rng().next_u64());
        let pool = self.pool.clone();
        let iface_addr = move |name: &str, af: AddressFamily| {
            pool.as_ref().and_then(|p| p.interface_address(name, af))
        };
        let result = {
            let mut store = self.write_store();
            let mut env = BuildEnv {
                rng: &mut rng,
                iface_addr: &iface_addr,
                ifname,
                now,
            };
            create_state(&mut store, rm, pkt, dir, &mut env)
        };
        let created = match result {
            Ok(created) => created,
            Err(reason) => return reject(ev, reason),
        };

        self.metrics.record_state_insert();
        if !created.replaced.is_empty() {
            self.metrics
                .record_state_removal("replaced", created.replaced.len() as u64);
            for old in &created.replaced {
                self.export_delete(old, now);
            }
        }

        let state = &created.state;
        ev.state = Some(state.id);
        let mut deferred = false;
        if let Some(snap) = self.snapshot(state, now)
            && let Some(ref exporter) = self.exporter
        {
            match exporter.on_insert(&snap) {
                Ok(ExportAck::Defer) => deferred = true,
                Ok(ExportAck::Sent) => {}
                Err(e) => warn!(state = %state.id, error = %e, "state insert export failed"),
            }
        }

        ev.verdict = if let Some(seg) = created.synproxy {
            ev.emitted.push(Emitted::Tcp(seg));
            Verdict::SynproxyDrop
        } else if deferred {
            Verdict::Defer
        } else {
            pass_verdict(&rm.rule, created.af_changed)
        };
        ev
    }

    // ── Replication helpers ────────────────────────────────────────

    /// Snapshot for the exporter; `None` without an exporter or for
    /// `no-sync` states.
    fn snapshot(&self, state: &State, now: u64) -> Option<StateSnapshot> {
        self.exporter.as_ref()?;
        if state.lock().flags.contains(StateFlags::NOSYNC) {
            return None;
        }
        Some(snapshot::export(&self.read_store(), state, now))
    }

    pub(crate) fn export_delete(&self, state: &State, now: u64) {
        if let Some(snap) = self.snapshot(state, now)
            && let Some(ref exporter) = self.exporter
            && let Err(e) = exporter.on_delete(&snap)
        {
            warn!(state = %state.id, error = %e, "state delete export failed");
        }
    }

    fn remove_state(&self, state: &State, cause: &str, now: u64) {
        if self.write_store().unlink(state, now) {
            self.metrics.record_state_removal(cause, 1);
            self.export_delete(state, now);
        }
    }

    // ── Accounting ─────────────────────────────────────────────────

    fn account(&self, ev: &Evaluation, dir: Direction, ifname: &str, bytes: u32) {
        self.counters.verdicts[verdict_slot(ev.verdict)].fetch_add(1, Ordering::Relaxed);
        self.metrics.record_verdict(ev.verdict.as_str());
        if let Some(reason) = ev.reason {
            self.counters.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
            self.metrics.record_drop(reason.as_str());
        }
        self.metrics
            .record_packet(ifname, dir.as_str(), u64::from(bytes));
    }

    // ── Sweeping ───────────────────────────────────────────────────

    /// One sweep step over the state list.
    pub fn sweep(&self) -> SweepStats {
        let now = self.clock.now_secs();
        let (report, states) = {
            let mut store = self.write_store();
            let report = store.sweep(now);
            (report, store.len())
        };
        for state in &report.expired {
            self.export_delete(state, now);
        }
        if !report.expired.is_empty() {
            self.metrics
                .record_state_removal("expired", report.expired.len() as u64);
        }
        self.metrics.record_sweep(
            report.scanned as u64,
            report.freed as u64,
            report.expired.len() as u64,
        );
        self.metrics.set_states(states as u64);
        SweepStats {
            scanned: report.scanned,
            freed: report.freed,
            expired: report.expired.len(),
        }
    }

    /// Reclaim source nodes past their grace period.
    pub fn purge_src_nodes(&self) -> usize {
        let now = self.clock.now_secs();
        let (purged, remaining) = {
            let mut store = self.write_store();
            let purged = store.purge_src_nodes(now);
            (purged, store.sources().len())
        };
        if purged > 0 {
            debug!(purged, "source nodes reclaimed");
            self.metrics.record_src_nodes_purged(purged as u64);
        }
        self.metrics.set_src_nodes(remaining as u64);
        purged
    }

    /// Seconds between coarse sweeps, from the current timeouts.
    pub fn sweep_interval(&self) -> u32 {
        self.read_store().timeouts().interval.max(1)
    }

    // ── Ruleset and tables ─────────────────────────────────────────

    /// Compile and swap in a new ruleset. On error the running ruleset,
    /// with its counters, stays in place.
    pub fn load_ruleset(
        &self,
        main: Vec<Rule>,
        anchors: Vec<(String, Vec<Rule>)>,
        default_action: RuleAction,
    ) -> Result<u64, DomainError> {
        let generation = self.ruleset().generation() + 1;
        let compiled = match RuleEngine::load(main, anchors, default_action, generation) {
            Ok(compiled) => compiled,
            Err(e) => {
                self.metrics.record_config_reload("failure");
                return Err(e);
            }
        };
        let count = compiled.rule_count();
        let checksum = compiled.checksum();
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(compiled);
        self.metrics.record_config_reload("success");
        self.metrics.set_rules_loaded(count as u64);
        info!(generation, rules = count, checksum, "ruleset loaded");
        Ok(generation)
    }

    /// Currently active ruleset.
    pub fn ruleset(&self) -> Arc<RuleEngine> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn tables(&self) -> &TableStore {
        &self.tables
    }

    // ── Control ────────────────────────────────────────────────────

    /// Refuse new states while the receive path is congested.
    pub fn set_congested(&self, congested: bool) {
        self.congested.store(congested, Ordering::Relaxed);
    }

    pub fn now(&self) -> u64 {
        self.clock.now_secs()
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); background tasks
    /// stop on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background tasks and drop every state. Returns the number of
    /// states removed.
    pub fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let now = self.clock.now_secs();
        let removed = {
            let mut store = self.write_store();
            let removed = store.flush(now);
            while store.table().sweep_len() > 0 {
                let report = store.sweep(now);
                if report.freed == 0 {
                    break;
                }
            }
            removed
        };
        for state in &removed {
            self.export_delete(state, now);
        }
        info!(states = removed.len(), "firewall engine shut down");
        removed.len()
    }

    pub fn status(&self) -> EngineStatus {
        let rules = self.ruleset();
        let store = self.read_store().status();
        let verdicts = VERDICT_NAMES
            .iter()
            .zip(&self.counters.verdicts)
            .map(|(name, c)| ((*name).to_string(), c.load(Ordering::Relaxed)))
            .collect();
        let drops = DropReason::ALL
            .iter()
            .map(|r| {
                (
                    r.as_str().to_string(),
                    self.counters.drops[r.index()].load(Ordering::Relaxed),
                )
            })
            .collect();
        EngineStatus {
            store,
            verdicts,
            drops,
            rules: rules.rule_count(),
            generation: rules.generation(),
            checksum: rules.checksum(),
            congested: self.congested.load(Ordering::Relaxed),
        }
    }

    // ── Lock helpers ───────────────────────────────────────────────

    pub(crate) fn read_store(&self) -> RwLockReadGuard<'_, StateStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_store(&self) -> RwLockWriteGuard<'_, StateStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsPort> {
        &self.metrics
    }
}

// ── Evaluation builders ────────────────────────────────────────────

fn state_pass(state: &State) -> Evaluation {
    Evaluation {
        rule: Some(Arc::clone(&state.rule)),
        anchor: state.anchor.clone(),
        state: Some(state.id),
        log: state.log,
        ..Evaluation::pass()
    }
}

fn state_drop(state: &State, reason: DropReason, emitted: Vec<Emitted>) -> Evaluation {
    Evaluation {
        verdict: Verdict::Drop,
        reason: Some(reason),
        emitted,
        ..state_pass(state)
    }
}

fn reject(mut ev: Evaluation, reason: DropReason) -> Evaluation {
    ev.verdict = Verdict::Drop;
    ev.reason = Some(reason);
    ev
}

/// Verdict for a packet the governing rule lets through.
fn pass_verdict(rule: &Rule, af_changed: bool) -> Verdict {
    if af_changed {
        Verdict::Afrt
    } else if let Some(port) = rule.divert_port {
        Verdict::Divert(port)
    } else {
        Verdict::Pass
    }
}

/// Reply for `block return`: a RST for TCP, port unreachable otherwise.
fn block_reply(pkt: &PacketInfo) -> Option<Emitted> {
    match pkt.proto {
        Protocol::Tcp => {
            let th = pkt.tcp.as_ref()?;
            if th.has(TH_RST) {
                return None;
            }
            let mut ack = th.seq.wrapping_add(th.payload_len);
            if th.has(TH_SYN) {
                ack = ack.wrapping_add(1);
            }
            if th.has(TH_FIN) {
                ack = ack.wrapping_add(1);
            }
            Some(Emitted::Tcp(TcpSegment {
                af: pkt.af,
                src: pkt.dst,
                dst: pkt.src,
                sport: pkt.dport,
                dport: pkt.sport,
                seq: th.ack,
                ack,
                flags: TH_RST | TH_ACK,
                win: 0,
                mss: None,
                rdomain: pkt.rdomain,
            }))
        }
        Protocol::Icmp | Protocol::Icmpv6 => None,
        Protocol::Udp | Protocol::Other(_) => {
            let code = match pkt.af {
                AddressFamily::Inet => UNREACH_PORT_V4,
                AddressFamily::Inet6 => UNREACH_PORT_V6,
            };
            Some(Emitted::IcmpUnreachable {
                af: pkt.af,
                src: pkt.dst,
                dst: pkt.src,
                code,
                rdomain: pkt.rdomain,
            })
        }
    }
}
