#![no_main]

use libfuzzer_sys::fuzz_target;

use domain::common::entity::{Addr, AddressFamily, Direction, Protocol};
use domain::common::packet::{PacketInfo, TcpHeader};
use domain::firewall::engine::RuleEngine;
use domain::firewall::entity::{AddrSpec, IpNetwork, PortOp, Rule, RuleAction};
use domain::firewall::evaluator::{RuleInput, RuleMatch};
use domain::firewall::table::TableStore;

// Build a ruleset and a batch of packets from fuzz data, then check that the
// skip-step walk picks the same rule as the plain linear walk.
//
// Layout (variable-length):
//   [0]    = number of rules (1–32)
//   [1]    = default action selector
//   rest   = 16-byte chunks per rule, then 16-byte chunks per packet
fuzz_target!(|data: &[u8]| {
    if data.len() < 34 {
        return;
    }

    let num_rules = (usize::from(data[0]) % 32) + 1;
    let default_action = if data[1] & 1 == 0 {
        RuleAction::Pass
    } else {
        RuleAction::Block
    };
    let mut chunks = data[2..].chunks_exact(16);

    let rules: Vec<Rule> = chunks.by_ref().take(num_rules).map(rule_from).collect();
    let Ok(engine) = RuleEngine::load(rules, Vec::new(), default_action, 1) else {
        return;
    };
    let tables = TableStore::default();

    for chunk in chunks {
        let (dir, pkt) = packet_from(chunk);
        let input = RuleInput {
            dir,
            ifname: if chunk[15] & 1 == 0 { "em0" } else { "em1" },
            pkt: &pkt,
        };
        let fast = engine.evaluate(&input, &tables);
        let slow = engine.evaluate_linear(&input, &tables);
        assert_same(&fast, &slow);
    }
});

fn rule_from(chunk: &[u8]) -> Rule {
    let flags = chunk[0];
    let net = |at: usize| IpNetwork::V4 {
        addr: u32::from_be_bytes([chunk[at], chunk[at + 1], 0, 0]),
        prefix_len: chunk[at + 2] % 17,
    };
    let mut src = if flags & 0x01 != 0 { AddrSpec::net(net(2)) } else { AddrSpec::any() };
    let mut dst = if flags & 0x02 != 0 { AddrSpec::net(net(5)) } else { AddrSpec::any() };
    if flags & 0x04 != 0 {
        src = src.negated();
    }
    if flags & 0x08 != 0 {
        dst = dst.with_port(port_op(chunk[8], u16::from(chunk[9]), u16::from(chunk[10])));
    }
    if flags & 0x10 != 0 {
        src = src.with_port(port_op(chunk[11], u16::from(chunk[12]), u16::from(chunk[13])));
    }

    Rule {
        action: match chunk[1] % 3 {
            0 => RuleAction::Pass,
            1 => RuleAction::Block,
            _ => RuleAction::Match,
        },
        direction: match chunk[14] % 3 {
            0 => None,
            1 => Some(Direction::In),
            _ => Some(Direction::Out),
        },
        quick: flags & 0x20 != 0,
        interface: (flags & 0x40 != 0).then(|| "em0".to_string()),
        ifnot: flags & 0x80 != 0 && chunk[14] & 0x10 != 0,
        af: (chunk[14] & 0x20 != 0).then_some(AddressFamily::Inet),
        proto: match chunk[15] % 4 {
            0 => None,
            1 => Some(Protocol::Tcp),
            2 => Some(Protocol::Udp),
            _ => Some(Protocol::Icmp),
        },
        src,
        dst,
        ..Rule::default()
    }
}

fn port_op(sel: u8, a: u16, b: u16) -> PortOp {
    let (lo, hi) = (a.min(b), a.max(b));
    match sel % 9 {
        0 => PortOp::Eq(a),
        1 => PortOp::Ne(a),
        2 => PortOp::Lt(a),
        3 => PortOp::Le(a),
        4 => PortOp::Gt(a),
        5 => PortOp::Ge(a),
        6 => PortOp::Range(lo, hi),
        7 => PortOp::Inside(lo, hi),
        _ => PortOp::Outside(lo, hi),
    }
}

fn packet_from(chunk: &[u8]) -> (Direction, PacketInfo) {
    let src = Addr::v4(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    let dst = Addr::v4(u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]));
    // Keep ports small so they collide with the rules' port operands.
    let sport = u16::from(chunk[8]);
    let dport = u16::from(chunk[9]);
    let dir = if chunk[10] & 1 == 0 { Direction::In } else { Direction::Out };
    let pkt = match chunk[11] % 3 {
        0 => PacketInfo::tcp(
            AddressFamily::Inet,
            src,
            sport,
            dst,
            dport,
            TcpHeader {
                seq: u32::from(chunk[12]),
                flags: chunk[13],
                ..TcpHeader::default()
            },
        ),
        1 => PacketInfo::udp(AddressFamily::Inet, src, sport, dst, dport),
        _ => PacketInfo::new(AddressFamily::Inet, Protocol::from_u8(chunk[12]), src, dst),
    };
    (dir, pkt)
}

fn assert_same(fast: &RuleMatch, slow: &RuleMatch) {
    assert_eq!(fast.matched, slow.matched);
    assert_eq!(fast.ruleset, slow.ruleset);
    assert_eq!(fast.rule.nr, slow.rule.nr);
    let nrs = |m: &RuleMatch| m.matches.iter().map(|r| r.nr).collect::<Vec<_>>();
    assert_eq!(nrs(fast), nrs(slow));
}
