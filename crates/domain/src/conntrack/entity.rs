use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::common::entity::{Addr, AddressFamily, Direction, Protocol};
use crate::firewall::entity::Rule;
use crate::srctrack::entity::SrcNodeKey;

use super::error::ConnTrackError;

// ── Timeouts ────────────────────────────────────────────────────────

/// Timeout class assigned to a state. `Purge` marks an unlinked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    TcpFirstPacket,
    TcpOpening,
    TcpEstablished,
    TcpClosing,
    TcpFinWait,
    TcpClosed,
    UdpFirstPacket,
    UdpSingle,
    UdpMultiple,
    IcmpFirstPacket,
    IcmpErrorReply,
    OtherFirstPacket,
    OtherSingle,
    OtherMultiple,
    Purge,
}

impl TimeoutClass {
    /// Classes that carry a configurable duration (everything but `Purge`).
    pub const COUNT: usize = 14;

    pub const ALL: [Self; Self::COUNT] = [
        Self::TcpFirstPacket,
        Self::TcpOpening,
        Self::TcpEstablished,
        Self::TcpClosing,
        Self::TcpFinWait,
        Self::TcpClosed,
        Self::UdpFirstPacket,
        Self::UdpSingle,
        Self::UdpMultiple,
        Self::IcmpFirstPacket,
        Self::IcmpErrorReply,
        Self::OtherFirstPacket,
        Self::OtherSingle,
        Self::OtherMultiple,
    ];

    /// Slot in a timeout table; `None` for `Purge`.
    pub fn index(self) -> Option<usize> {
        match self {
            Self::Purge => None,
            other => Some(other as usize),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(n: u8) -> Option<Self> {
        if n as usize == Self::COUNT {
            return Some(Self::Purge);
        }
        Self::ALL.get(n as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TcpFirstPacket => "tcp.first",
            Self::TcpOpening => "tcp.opening",
            Self::TcpEstablished => "tcp.established",
            Self::TcpClosing => "tcp.closing",
            Self::TcpFinWait => "tcp.finwait",
            Self::TcpClosed => "tcp.closed",
            Self::UdpFirstPacket => "udp.first",
            Self::UdpSingle => "udp.single",
            Self::UdpMultiple => "udp.multiple",
            Self::IcmpFirstPacket => "icmp.first",
            Self::IcmpErrorReply => "icmp.error",
            Self::OtherFirstPacket => "other.first",
            Self::OtherSingle => "other.single",
            Self::OtherMultiple => "other.multiple",
            Self::Purge => "purge",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// First-packet class for a protocol.
    pub fn first_packet(proto: Protocol) -> Self {
        match proto {
            Protocol::Tcp => Self::TcpFirstPacket,
            Protocol::Udp => Self::UdpFirstPacket,
            Protocol::Icmp | Protocol::Icmpv6 => Self::IcmpFirstPacket,
            Protocol::Other(_) => Self::OtherFirstPacket,
        }
    }
}

/// Global timeout table plus sweeper and adaptive parameters, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub values: [u32; TimeoutClass::COUNT],
    /// Sweeper pacing: every state is visited once per interval.
    pub interval: u32,
    /// Grace period before an unreferenced source node is reclaimed.
    pub src_node: u32,
    pub adaptive_start: u32,
    pub adaptive_end: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            values: [
                120,    // tcp.first
                30,     // tcp.opening
                86_400, // tcp.established
                900,    // tcp.closing
                45,     // tcp.finwait
                90,     // tcp.closed
                60,     // udp.first
                30,     // udp.single
                60,     // udp.multiple
                20,     // icmp.first
                10,     // icmp.error
                60,     // other.first
                30,     // other.single
                60,     // other.multiple
            ],
            interval: 10,
            src_node: 0,
            adaptive_start: 60_000,
            adaptive_end: 120_000,
        }
    }
}

impl Timeouts {
    pub fn get(&self, class: TimeoutClass) -> u32 {
        class.index().map_or(0, |i| self.values[i])
    }

    pub fn set(&mut self, class: TimeoutClass, seconds: u32) {
        if let Some(i) = class.index() {
            self.values[i] = seconds;
        }
    }

    pub fn validate(&self) -> Result<(), ConnTrackError> {
        if self.interval == 0 {
            return Err(ConnTrackError::InvalidTimeout {
                name: "interval",
                reason: "must be > 0",
            });
        }
        if self.adaptive_end != 0 && self.adaptive_start >= self.adaptive_end {
            return Err(ConnTrackError::InvalidTimeout {
                name: "adaptive.start",
                reason: "must be below adaptive.end",
            });
        }
        Ok(())
    }
}

/// Table-wide hard limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub states: usize,
    pub src_nodes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            states: 100_000,
            src_nodes: 10_000,
        }
    }
}

// ── Peer lifecycle ──────────────────────────────────────────────────

/// TCP lifecycle of one peer. Ordering matters: comparisons such as
/// "at least `FinWait2`" are used throughout the trackers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TcpState {
    #[default]
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    FinWait1,
    Closing,
    LastAck,
    FinWait2,
    TimeWait,
    /// SYN proxy answering the client.
    ProxySrc,
    /// SYN proxy opening the server side.
    ProxyDst,
}

impl TcpState {
    const ORDER: [Self; 13] = [
        Self::Closed,
        Self::Listen,
        Self::SynSent,
        Self::SynReceived,
        Self::Established,
        Self::CloseWait,
        Self::FinWait1,
        Self::Closing,
        Self::LastAck,
        Self::FinWait2,
        Self::TimeWait,
        Self::ProxySrc,
        Self::ProxyDst,
    ];

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(n: u8) -> Option<Self> {
        Self::ORDER.get(n as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::CloseWait => "CLOSE_WAIT",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::TimeWait => "TIME_WAIT",
            Self::ProxySrc => "PROXY_SRC",
            Self::ProxyDst => "PROXY_DST",
        }
    }
}

/// Activity seen from a peer of a UDP, ICMP or other-protocol flow.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    #[default]
    NoTraffic,
    Single,
    Multiple,
}

impl FlowState {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::NoTraffic),
            1 => Some(Self::Single),
            2 => Some(Self::Multiple),
            _ => None,
        }
    }
}

/// Window-scale option present (bit) plus shift (low nibble).
pub const PF_WSCALE_FLAG: u8 = 0x80;
pub const PF_WSCALE_MASK: u8 = 0x0f;
pub const TCP_MAX_WINSHIFT: u8 = 14;

/// Per-direction view of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Highest sequence number sent.
    pub seqlo: u32,
    /// Highest sequence number the other side will accept.
    pub seqhi: u32,
    /// Offset applied by sequence modulation or SYN-proxy splicing.
    pub seqdiff: u32,
    pub max_win: u16,
    pub mss: u16,
    pub wscale: u8,
    pub state: TcpState,
    pub flow: FlowState,
}

impl Peer {
    /// Window shift when the peer advertised scaling.
    pub fn wscale_shift(&self) -> u8 {
        if self.wscale & PF_WSCALE_FLAG != 0 {
            (self.wscale & PF_WSCALE_MASK).min(TCP_MAX_WINSHIFT)
        } else {
            0
        }
    }
}

// ── State key ───────────────────────────────────────────────────────

/// Lookup key. Derived ordering compares protocol, family, both addresses,
/// both ports and finally the routing domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub proto: u8,
    pub af: AddressFamily,
    pub addr: [Addr; 2],
    pub port: [u16; 2],
    pub rdomain: u16,
}

impl StateKey {
    /// Key for a packet travelling in `dir` with the given endpoints.
    #[allow(clippy::too_many_arguments)]
    pub fn for_packet(
        dir: Direction,
        af: AddressFamily,
        proto: Protocol,
        src: Addr,
        sport: u16,
        dst: Addr,
        dport: u16,
        rdomain: u16,
    ) -> Self {
        let mut addr = [Addr::UNSPECIFIED; 2];
        let mut port = [0u16; 2];
        addr[dir.sidx()] = src;
        addr[dir.didx()] = dst;
        port[dir.sidx()] = sport;
        port[dir.didx()] = dport;
        Self {
            proto: proto.to_u8(),
            af,
            addr,
            port,
            rdomain,
        }
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.proto)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}:{} {}:{}",
            self.protocol(),
            self.addr[0].display(self.af),
            self.port[0],
            self.addr[1].display(self.af),
            self.port[1]
        )?;
        if self.rdomain != 0 {
            write!(f, " rdomain {}", self.rdomain)?;
        }
        Ok(())
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Identity of a state across a replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId {
    pub id: u64,
    pub creator: u32,
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}/{:08x}", self.id, self.creator)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFlags(pub u16);

impl StateFlags {
    pub const ALLOW_OPTS: u16 = 0x0001;
    pub const SLOPPY: u16 = 0x0002;
    pub const NOSYNC: u16 = 0x0004;
    pub const MODULATE: u16 = 0x0008;
    pub const SYNPROXY: u16 = 0x0010;
    /// Counted against the source node's established connections.
    pub const SRC_CONN: u16 = 0x0020;
    pub const AFTO: u16 = 0x0040;

    pub fn contains(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn insert(&mut self, bit: u16) {
        self.0 |= bit;
    }

    pub fn remove(&mut self, bit: u16) {
        self.0 &= !bit;
    }
}

/// Mutable part of a state, guarded by the state's own lock.
#[derive(Debug, Clone)]
pub struct StateInner {
    /// Initiator side.
    pub src: Peer,
    /// Responder side.
    pub dst: Peer,
    pub timeout: TimeoutClass,
    /// Uptime of the last update; the deadline is derived from it.
    pub expire: u64,
    /// Slot 0 counts packets in the state's direction, slot 1 the replies.
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub flags: StateFlags,
}

impl StateInner {
    /// `(sender, receiver)` for a packet travelling in `dir`.
    pub fn peers_mut(&mut self, sender_is_src: bool) -> (&mut Peer, &mut Peer) {
        if sender_is_src {
            (&mut self.src, &mut self.dst)
        } else {
            (&mut self.dst, &mut self.src)
        }
    }

    pub fn is_unlinked(&self) -> bool {
        self.timeout == TimeoutClass::Purge
    }
}

/// A tracked connection.
///
/// Keys and rule links are fixed at creation; everything that changes per
/// packet sits behind `inner`.
#[derive(Debug)]
pub struct State {
    pub id: StateId,
    /// Key as seen on the network side.
    pub wire: Arc<StateKey>,
    /// Key as seen by the local stack. Same `Arc` when nothing is translated.
    pub stack: Arc<StateKey>,
    /// Interface the state is bound to; `None` floats across interfaces.
    pub kif: Option<String>,
    pub direction: Direction,
    pub rule: Arc<Rule>,
    pub anchor: Option<Arc<Rule>>,
    pub nat_rule: Option<Arc<Rule>>,
    pub match_rules: Vec<Arc<Rule>>,
    pub src_nodes: Vec<SrcNodeKey>,
    pub creation: u64,
    pub tag: Option<String>,
    pub log: bool,
    inner: Mutex<StateInner>,
}

impl State {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: StateId,
        wire: Arc<StateKey>,
        stack: Arc<StateKey>,
        kif: Option<String>,
        direction: Direction,
        rule: Arc<Rule>,
        creation: u64,
        inner: StateInner,
    ) -> Self {
        Self {
            id,
            wire,
            stack,
            kif,
            direction,
            rule,
            anchor: None,
            nat_rule: None,
            match_rules: Vec::new(),
            src_nodes: Vec::new(),
            creation,
            tag: None,
            log: false,
            inner: Mutex::new(inner),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn protocol(&self) -> Protocol {
        self.wire.protocol()
    }

    pub fn af(&self) -> AddressFamily {
        self.wire.af
    }

    /// Whether wire and stack differ.
    pub fn is_translated(&self) -> bool {
        !Arc::ptr_eq(&self.wire, &self.stack)
    }

    /// Both keys of the state, wire first.
    pub fn keys(&self) -> [&Arc<StateKey>; 2] {
        [&self.wire, &self.stack]
    }

    /// Rules whose `states_cur` counter this state holds. A NAT rule that is
    /// also the governing or a match rule is counted once.
    pub fn counted_rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        let nat = self.nat_rule.iter().filter(|n| {
            !Arc::ptr_eq(n, &self.rule) && !self.match_rules.iter().any(|m| Arc::ptr_eq(m, n))
        });
        std::iter::once(&self.rule)
            .chain(self.anchor.iter())
            .chain(nat)
            .chain(self.match_rules.iter())
    }
}
