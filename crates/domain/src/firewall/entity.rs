use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::common::entity::{Addr, AddressFamily, Direction, DropReason, Protocol, RuleId, Verdict};
use crate::conntrack::entity::{StateId, TimeoutClass};
use crate::nat::entity::{AfTo, Pool};

use super::error::FirewallError;
use super::skip::SKIP_COUNT;
use super::table::TableStore;

// ── IP Network ──────────────────────────────────────────────────────

/// IP address with CIDR prefix for subnet matching (IPv4 or IPv6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpNetwork {
    /// IPv4 address as host-byte-order u32, prefix 0-32.
    V4 { addr: u32, prefix_len: u8 },
    /// IPv6 address as 16 bytes in network order, prefix 0-128.
    V6 { addr: [u8; 16], prefix_len: u8 },
}

impl IpNetwork {
    pub fn host(af: AddressFamily, addr: Addr) -> Self {
        match af {
            AddressFamily::Inet => Self::V4 {
                addr: addr.0[0],
                prefix_len: 32,
            },
            AddressFamily::Inet6 => Self::V6 {
                addr: addr.to_v6_octets(),
                prefix_len: 128,
            },
        }
    }

    pub fn af(&self) -> AddressFamily {
        match self {
            Self::V4 { .. } => AddressFamily::Inet,
            Self::V6 { .. } => AddressFamily::Inet6,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match *self {
            Self::V4 { prefix_len, .. } | Self::V6 { prefix_len, .. } => prefix_len,
        }
    }

    /// Network address in the engine's word representation (unmasked).
    pub fn addr(&self) -> Addr {
        match *self {
            Self::V4 { addr, .. } => Addr::v4(addr),
            Self::V6 { addr, .. } => Addr::from_v6_octets(addr),
        }
    }

    pub fn mask(&self) -> Addr {
        crate::common::entity::prefix_mask(self.af(), self.prefix_len())
    }

    /// Check whether `addr` of family `af` falls within this network.
    pub fn contains(&self, af: AddressFamily, addr: Addr) -> bool {
        if af != self.af() {
            return false;
        }
        let prefix_len = self.prefix_len();
        addr.masked(af, prefix_len) == self.addr().masked(af, prefix_len)
    }

    /// Returns `true` if this is an IPv6 network.
    pub fn is_v6(&self) -> bool {
        matches!(self, Self::V6 { .. })
    }

    pub fn validate(&self) -> Result<(), FirewallError> {
        match *self {
            Self::V4 { prefix_len, .. } => {
                if prefix_len > 32 {
                    return Err(FirewallError::InvalidCidr { prefix_len });
                }
            }
            Self::V6 { prefix_len, .. } => {
                if prefix_len > 128 {
                    return Err(FirewallError::InvalidCidr { prefix_len });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr().display(self.af()), self.prefix_len())
    }
}

// ── Address and port predicates ─────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrMatch {
    #[default]
    Any,
    Network(IpNetwork),
    /// Named address table.
    Table(String),
}

/// Port operator as written in pf rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortOp {
    Eq(u16),
    Ne(u16),
    Lt(u16),
    Le(u16),
    Gt(u16),
    Ge(u16),
    /// `a:b`, inclusive.
    Range(u16, u16),
    /// `a >< b`, strictly between.
    Inside(u16, u16),
    /// `a <> b`, strictly outside.
    Outside(u16, u16),
}

impl PortOp {
    pub fn matches(self, port: u16) -> bool {
        match self {
            Self::Eq(p) => port == p,
            Self::Ne(p) => port != p,
            Self::Lt(p) => port < p,
            Self::Le(p) => port <= p,
            Self::Gt(p) => port > p,
            Self::Ge(p) => port >= p,
            Self::Range(lo, hi) => port >= lo && port <= hi,
            Self::Inside(lo, hi) => port > lo && port < hi,
            Self::Outside(lo, hi) => port < lo || port > hi,
        }
    }

    /// Lower bound used by `rdr-to` port-range mapping.
    pub fn low(self) -> u16 {
        match self {
            Self::Eq(p) | Self::Ne(p) | Self::Lt(p) | Self::Le(p) | Self::Gt(p) | Self::Ge(p) => p,
            Self::Range(lo, _) | Self::Inside(lo, _) | Self::Outside(lo, _) => lo,
        }
    }

    pub fn validate(self) -> Result<(), FirewallError> {
        match self {
            Self::Range(lo, hi) | Self::Inside(lo, hi) | Self::Outside(lo, hi) if lo > hi => {
                Err(FirewallError::InvalidPortRange { start: lo, end: hi })
            }
            _ => Ok(()),
        }
    }
}

/// One side of a rule: address predicate, negation, optional port predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrSpec {
    pub addr: AddrMatch,
    #[serde(default)]
    pub neg: bool,
    #[serde(default)]
    pub port: Option<PortOp>,
}

impl AddrSpec {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn net(net: IpNetwork) -> Self {
        Self {
            addr: AddrMatch::Network(net),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_port(mut self, op: PortOp) -> Self {
        self.port = Some(op);
        self
    }

    #[must_use]
    pub fn negated(mut self) -> Self {
        self.neg = true;
        self
    }

    /// Address part only; ports are checked separately.
    pub fn matches_addr(&self, af: AddressFamily, addr: Addr, tables: &TableStore) -> bool {
        let hit = match &self.addr {
            AddrMatch::Any => true,
            AddrMatch::Network(net) => net.contains(af, addr),
            AddrMatch::Table(name) => tables.contains(name, af, addr),
        };
        hit != self.neg
    }
}

// ── Rule options ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Pass,
    Block,
    /// Accumulates options without deciding the packet's fate.
    Match,
}

impl RuleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Block => "block",
            Self::Match => "match",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepState {
    #[default]
    None,
    Keep,
    /// Keep state and randomise the initiator's ISN.
    Modulate,
    /// Complete the handshake locally before opening the server side.
    Synproxy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTrack {
    #[default]
    None,
    /// Source nodes are private to the rule.
    Rule,
    /// Source nodes are shared by every rule tracking globally.
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushScope {
    /// Kill the offender's states created by this rule.
    Rule,
    /// Kill all of the offender's states.
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overload {
    pub table: String,
    pub flush: Option<FlushScope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnRate {
    pub limit: u32,
    pub seconds: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLimits {
    pub track: SourceTrack,
    pub max_src_nodes: u32,
    pub max_src_states: u32,
    pub max_src_conn: u32,
    pub max_src_conn_rate: Option<ConnRate>,
    pub overload: Option<Overload>,
}

impl SourceLimits {
    /// Whether any option requires a per-source node.
    pub fn tracking(&self) -> bool {
        self.track != SourceTrack::None
            || self.max_src_nodes > 0
            || self.max_src_states > 0
            || self.max_src_conn > 0
            || self.max_src_conn_rate.is_some()
    }
}

/// Per-rule timeout overrides; zero means "use the global value".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTimeouts {
    pub values: [u32; TimeoutClass::COUNT],
    pub adaptive_start: u32,
    pub adaptive_end: u32,
}

impl RuleTimeouts {
    pub fn get(&self, class: TimeoutClass) -> u32 {
        class.index().map_or(0, |i| self.values[i])
    }

    pub fn set(&mut self, class: TimeoutClass, seconds: u32) {
        if let Some(i) = class.index() {
            self.values[i] = seconds;
        }
    }
}

/// Live counters of a rule. Shared across clones of the same rule.
#[derive(Debug, Default)]
pub struct RuleCounters {
    pub evaluations: AtomicU64,
    pub packets: [AtomicU64; 2],
    pub bytes: [AtomicU64; 2],
    pub states_cur: AtomicU64,
    pub states_tot: AtomicU64,
    pub src_nodes: AtomicU64,
}

impl RuleCounters {
    pub fn record_packet(&self, dir: Direction, bytes: u64) {
        self.packets[dir.index()].fetch_add(1, Ordering::Relaxed);
        self.bytes[dir.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn state_created(&self) {
        self.states_cur.fetch_add(1, Ordering::Relaxed);
        self.states_tot.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement of the live state count.
    pub fn state_removed(&self) {
        let _ = self
            .states_cur
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn src_node_created(&self) {
        self.src_nodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn src_node_removed(&self) {
        let _ = self
            .src_nodes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn states(&self) -> u64 {
        self.states_cur.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RuleStats {
        RuleStats {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            packets: [
                self.packets[0].load(Ordering::Relaxed),
                self.packets[1].load(Ordering::Relaxed),
            ],
            bytes: [
                self.bytes[0].load(Ordering::Relaxed),
                self.bytes[1].load(Ordering::Relaxed),
            ],
            states_cur: self.states_cur.load(Ordering::Relaxed),
            states_tot: self.states_tot.load(Ordering::Relaxed),
            src_nodes: self.src_nodes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RuleCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub evaluations: u64,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub states_cur: u64,
    pub states_tot: u64,
    pub src_nodes: u64,
}

// ── Rule ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Position in its ruleset, assigned on load.
    pub nr: u32,
    /// Unique across every ruleset generation, assigned on load.
    pub uid: u64,
    pub label: Option<RuleId>,
    pub action: RuleAction,
    pub direction: Option<Direction>,
    pub quick: bool,
    pub log: bool,
    /// Answer blocked TCP with RST and other protocols with ICMP unreachable.
    pub block_return: bool,
    pub allow_opts: bool,
    pub interface: Option<String>,
    /// Negates both the interface and the rdomain predicates.
    pub ifnot: bool,
    pub onrdomain: Option<u16>,
    pub af: Option<AddressFamily>,
    pub proto: Option<Protocol>,
    pub src: AddrSpec,
    pub dst: AddrSpec,
    /// Required TCP flags, checked under `flagset`.
    pub flags: u8,
    pub flagset: u8,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
    pub tag: Option<String>,
    pub tagged: Option<String>,
    pub keep_state: KeepState,
    pub sloppy: bool,
    pub if_bound: bool,
    pub no_sync: bool,
    pub timeouts: RuleTimeouts,
    pub max_states: u32,
    pub src_limits: SourceLimits,
    pub nat: Option<Arc<Pool>>,
    pub rdr: Option<Arc<Pool>>,
    /// Expanded into a `nat` rule and a reverse `rdr` rule on load.
    pub binat: Option<Arc<Pool>>,
    pub af_to: Option<Arc<AfTo>>,
    pub divert_port: Option<u16>,
    /// Name of the sub-ruleset this rule descends into.
    pub anchor: Option<String>,
    pub skip: [usize; SKIP_COUNT],
    pub counters: Arc<RuleCounters>,
}

impl Rule {
    pub fn is_anchor(&self) -> bool {
        self.anchor.is_some()
    }

    /// Whether a matching packet gets a state entry.
    pub fn creates_state(&self) -> bool {
        self.action == RuleAction::Pass
            && (self.keep_state != KeepState::None
                || self.nat.is_some()
                || self.rdr.is_some()
                || self.af_to.is_some())
    }

    pub fn validate(&self) -> Result<(), FirewallError> {
        if let Some(ref label) = self.label {
            label
                .validate()
                .map_err(|reason| FirewallError::InvalidRuleId { reason })?;
        }

        for spec in [&self.src, &self.dst] {
            if let AddrMatch::Network(net) = spec.addr {
                net.validate()?;
                if let Some(af) = self.af
                    && af != net.af()
                {
                    return Err(FirewallError::MixedAddressFamilies);
                }
            }
            if let Some(op) = spec.port {
                op.validate()?;
                if !self.proto.is_some_and(Protocol::has_ports) {
                    return Err(FirewallError::PortsWithoutTcpUdp);
                }
            }
        }

        if let (AddrMatch::Network(src), AddrMatch::Network(dst)) = (&self.src.addr, &self.dst.addr)
            && src.is_v6() != dst.is_v6()
        {
            return Err(FirewallError::MixedAddressFamilies);
        }

        if self.flagset != 0 && self.proto != Some(Protocol::Tcp) {
            return Err(FirewallError::TcpFlagsWithNonTcp);
        }
        if self.flags & !self.flagset != 0 {
            return Err(FirewallError::InvalidTcpFlags {
                flags: self.flags,
                flagset: self.flagset,
            });
        }

        if (self.icmp_type.is_some() || self.icmp_code.is_some())
            && !self.proto.is_some_and(Protocol::is_icmp)
        {
            return Err(FirewallError::IcmpFieldsWithNonIcmp);
        }
        if self.icmp_code.is_some() && self.icmp_type.is_none() {
            return Err(FirewallError::IcmpFieldsWithNonIcmp);
        }

        if self.keep_state == KeepState::Synproxy && self.proto != Some(Protocol::Tcp) {
            return Err(FirewallError::SynproxyRequiresTcp);
        }

        if let Some(limit) = self.src_limits.max_src_conn_rate
            && (limit.limit == 0 || limit.seconds == 0)
        {
            return Err(FirewallError::InvalidConnRate);
        }

        for pool in [&self.nat, &self.rdr, &self.binat].into_iter().flatten() {
            pool.validate()?;
        }
        if let Some(ref afto) = self.af_to {
            if self.direction != Some(Direction::In) {
                return Err(crate::nat::error::NatError::AfToRequiresInbound.into());
            }
            if self.af.is_none_or(|af| af == afto.af) {
                return Err(FirewallError::AfToSameFamily);
            }
            afto.src.validate()?;
        }
        if self.binat.is_some() && !matches!(self.src.addr, AddrMatch::Network(_)) {
            return Err(FirewallError::BinatNeedsSourceNetwork);
        }

        if self.is_anchor() && self.action != RuleAction::Pass {
            return Err(FirewallError::AnchorWithAction);
        }

        Ok(())
    }
}

// ── Evaluation output ───────────────────────────────────────────────

/// TCP segment the engine asks the stack to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSegment {
    pub af: AddressFamily,
    pub src: Addr,
    pub dst: Addr,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub win: u16,
    pub mss: Option<u16>,
    pub rdomain: u16,
}

/// Synthetic packet produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Emitted {
    Tcp(TcpSegment),
    /// ICMP port/host unreachable back to the sender of a blocked packet.
    IcmpUnreachable {
        af: AddressFamily,
        src: Addr,
        dst: Addr,
        code: u8,
        rdomain: u16,
    },
}

/// Result of running a packet through the engine.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub reason: Option<DropReason>,
    pub rule: Option<Arc<Rule>>,
    pub anchor: Option<Arc<Rule>>,
    /// Name of the ruleset the deciding rule lives in (`""` for main).
    pub ruleset: String,
    pub state: Option<StateId>,
    pub log: bool,
    pub emitted: Vec<Emitted>,
}

impl Evaluation {
    pub fn pass() -> Self {
        Self {
            verdict: Verdict::Pass,
            reason: None,
            rule: None,
            anchor: None,
            ruleset: String::new(),
            state: None,
            log: false,
            emitted: Vec::new(),
        }
    }

    pub fn drop(reason: DropReason) -> Self {
        Self {
            verdict: Verdict::Drop,
            reason: Some(reason),
            ..Self::pass()
        }
    }

    #[must_use]
    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = verdict;
        self
    }

    pub fn is_drop(&self) -> bool {
        matches!(self.verdict, Verdict::Drop | Verdict::SynproxyDrop)
    }
}
