use serde::{Deserialize, Serialize};

use super::entity::{AddressFamily, Addr, Protocol};

// ── TCP flag bits ───────────────────────────────────────────────────

pub const TH_FIN: u8 = 0x01;
pub const TH_SYN: u8 = 0x02;
pub const TH_RST: u8 = 0x04;
pub const TH_PUSH: u8 = 0x08;
pub const TH_ACK: u8 = 0x10;
pub const TH_URG: u8 = 0x20;
pub const TH_ECE: u8 = 0x40;
pub const TH_CWR: u8 = 0x80;

/// Render flags the way pf prints them (`FSRPAUEW`).
pub fn tcp_flags_to_string(flags: u8) -> String {
    const NAMES: [(u8, char); 8] = [
        (TH_FIN, 'F'),
        (TH_SYN, 'S'),
        (TH_RST, 'R'),
        (TH_PUSH, 'P'),
        (TH_ACK, 'A'),
        (TH_URG, 'U'),
        (TH_ECE, 'E'),
        (TH_CWR, 'W'),
    ];
    NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, c)| *c)
        .collect()
}

/// Parse a pf flag string such as `"SA"`. Unknown letters are rejected.
pub fn tcp_flags_from_str(s: &str) -> Result<u8, char> {
    let mut flags = 0u8;
    for c in s.chars() {
        flags |= match c.to_ascii_uppercase() {
            'F' => TH_FIN,
            'S' => TH_SYN,
            'R' => TH_RST,
            'P' => TH_PUSH,
            'A' => TH_ACK,
            'U' => TH_URG,
            'E' => TH_ECE,
            'W' => TH_CWR,
            other => return Err(other),
        };
    }
    Ok(flags)
}

// ── Headers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SackBlock {
    pub start: u32,
    pub end: u32,
}

/// TCP fields the classifier extracted from the segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpHeader {
    pub seq: u32,
    #[serde(default)]
    pub ack: u32,
    pub flags: u8,
    #[serde(default)]
    pub win: u16,
    /// Payload bytes after the TCP header.
    #[serde(default)]
    pub payload_len: u32,
    /// Window-scale option as carried on the wire (shift only).
    #[serde(default)]
    pub wscale: Option<u8>,
    #[serde(default)]
    pub mss: Option<u16>,
    #[serde(default)]
    pub sack: Vec<SackBlock>,
}

impl TcpHeader {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// SYN without ACK.
    pub fn is_pure_syn(&self) -> bool {
        self.flags & (TH_SYN | TH_ACK | TH_RST | TH_FIN) == TH_SYN
    }
}

/// Header embedded in an ICMP error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerHeader {
    pub af: AddressFamily,
    pub proto: Protocol,
    pub src: Addr,
    pub dst: Addr,
    /// Source port, or the echo id when the inner packet is an ICMP query.
    #[serde(default)]
    pub sport: u16,
    #[serde(default)]
    pub dport: u16,
    /// Sequence number of an embedded TCP header.
    #[serde(default)]
    pub seq: u32,
    /// Type of an embedded ICMP query.
    #[serde(default)]
    pub icmp_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    #[serde(default)]
    pub code: u8,
    /// Query identifier; meaningless for error messages.
    #[serde(default)]
    pub id: u16,
    #[serde(default)]
    pub inner: Option<Box<InnerHeader>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumStatus {
    #[default]
    Unchecked,
    Good,
    Bad,
}

// ── Packet descriptor ───────────────────────────────────────────────

/// Classified packet handed to the engine.
///
/// The engine rewrites the address and port fields in place when a
/// translation applies and raises `checksum_dirty`; the caller recomputes
/// checksums before transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketInfo {
    pub af: AddressFamily,
    pub proto: Protocol,
    pub src: Addr,
    pub dst: Addr,
    #[serde(default)]
    pub sport: u16,
    #[serde(default)]
    pub dport: u16,
    #[serde(default)]
    pub rdomain: u16,
    /// Total IP length, used for byte counters.
    #[serde(default)]
    pub tot_len: u32,
    #[serde(default)]
    pub tcp: Option<TcpHeader>,
    #[serde(default)]
    pub icmp: Option<IcmpHeader>,
    /// Non-first fragment that was not reassembled.
    #[serde(default)]
    pub fragment: bool,
    #[serde(default)]
    pub ip_options: bool,
    #[serde(default)]
    pub checksum: ChecksumStatus,
    #[serde(default)]
    pub checksum_dirty: bool,
    #[serde(default)]
    pub tag: Option<String>,
}

impl PacketInfo {
    /// Minimal descriptor; protocol headers are attached by the builders below.
    pub fn new(af: AddressFamily, proto: Protocol, src: Addr, dst: Addr) -> Self {
        Self {
            af,
            proto,
            src,
            dst,
            sport: 0,
            dport: 0,
            rdomain: 0,
            tot_len: 0,
            tcp: None,
            icmp: None,
            fragment: false,
            ip_options: false,
            checksum: ChecksumStatus::Unchecked,
            checksum_dirty: false,
            tag: None,
        }
    }

    pub fn tcp(
        af: AddressFamily,
        src: Addr,
        sport: u16,
        dst: Addr,
        dport: u16,
        header: TcpHeader,
    ) -> Self {
        let mut pkt = Self::new(af, Protocol::Tcp, src, dst);
        pkt.sport = sport;
        pkt.dport = dport;
        pkt.tot_len = 40 + header.payload_len;
        pkt.tcp = Some(header);
        pkt
    }

    pub fn udp(af: AddressFamily, src: Addr, sport: u16, dst: Addr, dport: u16) -> Self {
        let mut pkt = Self::new(af, Protocol::Udp, src, dst);
        pkt.sport = sport;
        pkt.dport = dport;
        pkt.tot_len = 28;
        pkt
    }

    pub fn icmp(af: AddressFamily, src: Addr, dst: Addr, header: IcmpHeader) -> Self {
        let mut pkt = Self::new(af, af.icmp_protocol(), src, dst);
        pkt.tot_len = 28;
        pkt.icmp = Some(header);
        pkt
    }

    pub fn tcp_flags(&self) -> u8 {
        self.tcp.as_ref().map_or(0, |th| th.flags)
    }

    /// Overwrite the addressing fields, flagging checksums when anything changed.
    pub fn rewrite(&mut self, src: Addr, sport: u16, dst: Addr, dport: u16) {
        let changed =
            self.src != src || self.dst != dst || self.sport != sport || self.dport != dport;
        if changed {
            self.src = src;
            self.dst = dst;
            self.sport = sport;
            self.dport = dport;
            self.checksum_dirty = true;
        }
    }
}
