//! Packet records on the wire between the classifier and the agent.
//!
//! Input and output are JSON lines. Addresses are written in their usual
//! textual form; everything else mirrors the engine's packet descriptor.

use anyhow::{Context, bail};
use domain::common::entity::{Direction, DropReason, Protocol, Verdict};
use domain::common::packet::{ChecksumStatus, IcmpHeader, PacketInfo, TcpHeader};
use domain::conntrack::entity::StateId;
use domain::firewall::entity::{Emitted, Evaluation};
use infrastructure::config::parse_addr;
use serde::{Deserialize, Serialize};

/// One classified packet.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PacketRecord {
    /// Capture time in seconds; only replays look at it.
    #[serde(default)]
    pub at: Option<u64>,
    pub direction: Direction,
    pub interface: String,
    pub proto: Protocol,
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub sport: u16,
    #[serde(default)]
    pub dport: u16,
    #[serde(default)]
    pub rdomain: u16,
    #[serde(default)]
    pub len: u32,
    #[serde(default)]
    pub tcp: Option<TcpHeader>,
    #[serde(default)]
    pub icmp: Option<IcmpHeader>,
    #[serde(default)]
    pub fragment: bool,
    #[serde(default)]
    pub ip_options: bool,
    #[serde(default)]
    pub checksum: ChecksumStatus,
    #[serde(default)]
    pub tag: Option<String>,
}

impl PacketRecord {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        serde_json::from_str(line).context("malformed packet record")
    }

    pub fn to_packet(&self) -> anyhow::Result<PacketInfo> {
        let (af, src) = parse_addr(&self.src).context("src")?;
        let (dst_af, dst) = parse_addr(&self.dst).context("dst")?;
        if af != dst_af {
            bail!("src {} and dst {} differ in address family", self.src, self.dst);
        }
        let mut pkt = PacketInfo::new(af, self.proto, src, dst);
        pkt.sport = self.sport;
        pkt.dport = self.dport;
        pkt.rdomain = self.rdomain;
        pkt.tot_len = self.len;
        pkt.tcp.clone_from(&self.tcp);
        pkt.icmp.clone_from(&self.icmp);
        pkt.fragment = self.fragment;
        pkt.ip_options = self.ip_options;
        pkt.checksum = self.checksum;
        pkt.tag.clone_from(&self.tag);
        Ok(pkt)
    }
}

/// What the engine decided for one packet, with the packet as it leaves.
#[derive(Debug, Clone, Serialize)]
pub struct VerdictRecord {
    pub seq: u64,
    pub at: u64,
    pub direction: Direction,
    pub interface: String,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DropReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ruleset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<StateId>,
    pub src: String,
    pub sport: u16,
    pub dst: String,
    pub dport: u16,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub emitted: Vec<Emitted>,
}

impl VerdictRecord {
    pub fn new(
        seq: u64,
        at: u64,
        record: &PacketRecord,
        pkt: &PacketInfo,
        eval: Evaluation,
    ) -> Self {
        Self {
            seq,
            at,
            direction: record.direction,
            interface: record.interface.clone(),
            verdict: eval.verdict,
            reason: eval.reason,
            rule: eval.rule.as_ref().map(|r| r.nr),
            ruleset: eval.ruleset,
            state: eval.state,
            src: pkt.src.display(pkt.af),
            sport: pkt.sport,
            dst: pkt.dst.display(pkt.af),
            dport: pkt.dport,
            emitted: eval.emitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use domain::common::entity::{Addr, AddressFamily};

    use super::*;

    #[test]
    fn tcp_record_becomes_a_packet() {
        let rec = PacketRecord::parse(
            r#"{"direction":"out","interface":"em0","proto":"tcp","src":"10.0.0.1","sport":1234,
                "dst":"93.184.216.34","dport":80,"len":60,"tcp":{"seq":1000,"flags":2,"win":65535}}"#,
        )
        .unwrap();
        let pkt = rec.to_packet().unwrap();
        assert_eq!(pkt.af, AddressFamily::Inet);
        assert_eq!(pkt.src, Addr::v4(0x0A00_0001));
        assert_eq!(pkt.dport, 80);
        assert_eq!(pkt.tot_len, 60);
        assert_eq!(pkt.tcp.as_ref().map(|t| t.seq), Some(1000));
        assert!(rec.at.is_none());
    }

    #[test]
    fn v6_record_parses() {
        let rec = PacketRecord::parse(
            r#"{"at":5,"direction":"in","interface":"em1","proto":"udp","src":"2001:db8::1","dst":"2001:db8::2"}"#,
        )
        .unwrap();
        assert_eq!(rec.to_packet().unwrap().af, AddressFamily::Inet6);
        assert_eq!(rec.at, Some(5));
    }

    #[test]
    fn mixed_families_are_rejected() {
        let rec = PacketRecord::parse(
            r#"{"direction":"in","interface":"em0","proto":"udp","src":"10.0.0.1","dst":"2001:db8::2"}"#,
        )
        .unwrap();
        assert!(rec.to_packet().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(
            PacketRecord::parse(
                r#"{"direction":"in","interface":"em0","proto":"udp","src":"10.0.0.1","dst":"10.0.0.2","ttl":3}"#
            )
            .is_err()
        );
    }

    #[test]
    fn verdict_record_omits_empty_fields() {
        let rec = PacketRecord::parse(
            r#"{"direction":"in","interface":"em0","proto":"udp","src":"10.0.0.1","dst":"10.0.0.2"}"#,
        )
        .unwrap();
        let pkt = rec.to_packet().unwrap();
        let line = VerdictRecord::new(1, 10, &rec, &pkt, Evaluation::pass());
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["verdict"], "pass");
        assert_eq!(json["src"], "10.0.0.1");
        assert!(json.get("reason").is_none());
        assert!(json.get("emitted").is_none());
    }
}
