use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Label attached to a rule for operators (pf `label`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl RuleId {
    /// Validate that the rule ID is non-empty and contains only
    /// alphanumeric characters, dashes, and underscores.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.0.is_empty() {
            return Err("rule ID must not be empty");
        }
        if !self
            .0
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err("rule ID must contain only alphanumeric, dashes, underscores");
        }
        Ok(())
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Protocol ────────────────────────────────────────────────────────

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl Protocol {
    /// IP protocol number.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Tcp => IPPROTO_TCP,
            Self::Udp => IPPROTO_UDP,
            Self::Icmp => IPPROTO_ICMP,
            Self::Icmpv6 => IPPROTO_ICMPV6,
            Self::Other(n) => n,
        }
    }

    /// Create from a raw protocol number.
    pub fn from_u8(n: u8) -> Self {
        match n {
            IPPROTO_ICMP => Self::Icmp,
            IPPROTO_TCP => Self::Tcp,
            IPPROTO_UDP => Self::Udp,
            IPPROTO_ICMPV6 => Self::Icmpv6,
            other => Self::Other(other),
        }
    }

    /// TCP and UDP carry ports; everything else is matched without them.
    pub fn has_ports(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }

    pub fn is_icmp(self) -> bool {
        matches!(self, Self::Icmp | Self::Icmpv6)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::Icmpv6 => "icmp6",
            Self::Other(_) => "other",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(n) => write!(f, "proto-{n}"),
            p => f.write_str(p.as_str()),
        }
    }
}

// ── Address family ──────────────────────────────────────────────────

pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Inet => AF_INET,
            Self::Inet6 => AF_INET6,
        }
    }

    /// `None` for an unset or unknown family.
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            AF_INET => Some(Self::Inet),
            AF_INET6 => Some(Self::Inet6),
            _ => None,
        }
    }

    /// The ICMP flavour native to this family.
    pub fn icmp_protocol(self) -> Protocol {
        match self {
            Self::Inet => Protocol::Icmp,
            Self::Inet6 => Protocol::Icmpv6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inet => "inet",
            Self::Inet6 => "inet6",
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Direction ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Self::In => Self::Out,
            Self::Out => Self::In,
        }
    }

    /// Counter slot: 0 for inbound, 1 for outbound.
    pub fn index(self) -> usize {
        match self {
            Self::In => 0,
            Self::Out => 1,
        }
    }

    /// Index of the packet source inside a state key. The destination sits
    /// at the other slot.
    pub fn sidx(self) -> usize {
        self.index()
    }

    pub fn didx(self) -> usize {
        1 - self.index()
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::In => 1,
            Self::Out => 2,
        }
    }

    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::In),
            2 => Some(Self::Out),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Addresses ───────────────────────────────────────────────────────

/// Network address as four host-order words.
///
/// IPv4 lives in the first word with the rest zeroed; IPv6 uses all four.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Addr(pub [u32; 4]);

impl Addr {
    pub const UNSPECIFIED: Self = Self([0; 4]);

    pub fn v4(addr: u32) -> Self {
        Self([addr, 0, 0, 0])
    }

    pub fn v6(words: [u32; 4]) -> Self {
        Self(words)
    }

    pub fn from_v6_octets(octets: [u8; 16]) -> Self {
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_be_bytes([
                octets[i * 4],
                octets[i * 4 + 1],
                octets[i * 4 + 2],
                octets[i * 4 + 3],
            ]);
        }
        Self(words)
    }

    pub fn to_v6_octets(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        for (i, word) in self.0.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    pub fn is_unspecified(self) -> bool {
        self.0 == [0; 4]
    }

    /// Apply a prefix mask for the given family.
    pub fn masked(self, af: AddressFamily, prefix_len: u8) -> Self {
        let mask = prefix_mask(af, prefix_len);
        Self([
            self.0[0] & mask.0[0],
            self.0[1] & mask.0[1],
            self.0[2] & mask.0[2],
            self.0[3] & mask.0[3],
        ])
    }

    /// `(self & mask) | (other & !mask)`.
    pub fn combine(self, mask: Self, other: Self) -> Self {
        let mut out = [0u32; 4];
        for (i, word) in out.iter_mut().enumerate() {
            *word = (self.0[i] & mask.0[i]) | (other.0[i] & !mask.0[i]);
        }
        Self(out)
    }

    /// Increment by one within the family's width, wrapping on overflow.
    pub fn increment(self, af: AddressFamily) -> Self {
        match af {
            AddressFamily::Inet => Self::v4(self.0[0].wrapping_add(1)),
            AddressFamily::Inet6 => {
                let mut words = self.0;
                for word in words.iter_mut().rev() {
                    let (next, carry) = word.overflowing_add(1);
                    *word = next;
                    if !carry {
                        break;
                    }
                }
                Self(words)
            }
        }
    }

    pub fn display(self, af: AddressFamily) -> String {
        match af {
            AddressFamily::Inet => Ipv4Addr::from(self.0[0]).to_string(),
            AddressFamily::Inet6 => Ipv6Addr::from(self.to_v6_octets()).to_string(),
        }
    }
}

/// Network mask for a prefix length, clamped to the family's width.
pub fn prefix_mask(af: AddressFamily, prefix_len: u8) -> Addr {
    let width = match af {
        AddressFamily::Inet => 32,
        AddressFamily::Inet6 => 128,
    };
    let mut remaining = u32::from(prefix_len.min(width));
    let mut mask = [0u32; 4];
    for word in &mut mask {
        if remaining >= 32 {
            *word = !0u32;
            remaining -= 32;
        } else if remaining > 0 {
            *word = !0u32 << (32 - remaining);
            remaining = 0;
        }
    }
    Addr(mask)
}

// ── Verdicts ────────────────────────────────────────────────────────

/// Reason attached to every dropped packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    Match,
    Short,
    Fragment,
    BadChecksum,
    IpOptions,
    StateInsert,
    StateLimit,
    SrcLimit,
    SrcConnRate,
    Memory,
    BadState,
    Synproxy,
    Translate,
    Congestion,
}

impl DropReason {
    pub const ALL: [Self; 14] = [
        Self::Match,
        Self::Short,
        Self::Fragment,
        Self::BadChecksum,
        Self::IpOptions,
        Self::StateInsert,
        Self::StateLimit,
        Self::SrcLimit,
        Self::SrcConnRate,
        Self::Memory,
        Self::BadState,
        Self::Synproxy,
        Self::Translate,
        Self::Congestion,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Short => "short",
            Self::Fragment => "fragment",
            Self::BadChecksum => "bad-checksum",
            Self::IpOptions => "ip-options",
            Self::StateInsert => "state-insert",
            Self::StateLimit => "state-limit",
            Self::SrcLimit => "src-limit",
            Self::SrcConnRate => "src-conn-rate",
            Self::Memory => "memory",
            Self::BadState => "bad-state",
            Self::Synproxy => "synproxy",
            Self::Translate => "translate",
            Self::Congestion => "congestion",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final decision for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Drop,
    /// Consumed by the SYN proxy; the engine answered on the peer's behalf.
    SynproxyDrop,
    /// Address-family translated; the caller must re-route the packet.
    Afrt,
    /// Hand the packet to a local socket on this port.
    Divert(u16),
    /// Hold the packet until the replication peer acknowledges the state.
    Defer,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Drop => "drop",
            Self::SynproxyDrop => "synproxy-drop",
            Self::Afrt => "afrt",
            Self::Divert(_) => "divert",
            Self::Defer => "defer",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
