//! Rule evaluation.
//!
//! Walks the main ruleset from its head, descending into anchors through an
//! explicit frame stack. Failed predicates in a skip category jump to the
//! rule's precomputed skip index.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{error, warn};

use crate::common::entity::{Direction, Protocol};
use crate::common::packet::PacketInfo;

use super::engine::RuleEngine;
use super::entity::{Rule, RuleAction};
use super::ruleset::Ruleset;
use super::skip::{
    SKIP_AF, SKIP_DIR, SKIP_DST_ADDR, SKIP_DST_PORT, SKIP_IFP, SKIP_PROTO, SKIP_RDOM,
    SKIP_SRC_ADDR, SKIP_SRC_PORT,
};
use super::table::TableStore;

/// Maximum anchor nesting.
pub const MAX_ANCHOR_DEPTH: usize = 64;

/// Packet attributes rule predicates are tested against.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub dir: Direction,
    pub ifname: &'a str,
    pub pkt: &'a PacketInfo,
}

/// Side effects accumulated over `match` rules and the final rule.
#[derive(Debug, Clone, Default)]
pub struct RuleActions {
    pub tag: Option<String>,
    pub log: bool,
    /// Last matching rule carrying `nat-to`, `rdr-to` or `af-to`.
    pub translation: Option<Arc<Rule>>,
}

impl RuleActions {
    fn merge(&mut self, rule: &Arc<Rule>) {
        if let Some(ref tag) = rule.tag {
            self.tag = Some(tag.clone());
        }
        self.log |= rule.log;
        if rule.nat.is_some() || rule.rdr.is_some() || rule.af_to.is_some() {
            self.translation = Some(Arc::clone(rule));
        }
    }
}

/// Outcome of rule evaluation.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    /// The governing rule: last matching pass/block rule, or the default rule.
    pub rule: Arc<Rule>,
    /// Anchor rule the governing rule was found under.
    pub anchor: Option<Arc<Rule>>,
    /// Name of the ruleset holding the governing rule (`""` for main).
    pub ruleset: String,
    /// Matching `match` rules in evaluation order.
    pub matches: Vec<Arc<Rule>>,
    pub actions: RuleActions,
    /// `false` when the default rule governs.
    pub matched: bool,
}

enum Test {
    Match,
    /// Failed a skip-category predicate.
    Skip(usize),
    Next,
}

struct Frame<'a> {
    parent: &'a Ruleset,
    resume: usize,
    anchor: Arc<Rule>,
    matched: bool,
}

impl RuleEngine {
    /// Evaluate the loaded rules for one packet using skip steps.
    pub fn evaluate(&self, input: &RuleInput<'_>, tables: &TableStore) -> RuleMatch {
        self.walk(input, tables, true)
    }

    /// Same as [`evaluate`](Self::evaluate) but advancing one rule at a time.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn evaluate_linear(&self, input: &RuleInput<'_>, tables: &TableStore) -> RuleMatch {
        self.walk(input, tables, false)
    }

    fn walk(&self, input: &RuleInput<'_>, tables: &TableStore, use_skip: bool) -> RuleMatch {
        let mut stack: Vec<Frame<'_>> = Vec::new();
        let mut rs: &Ruleset = &self.main;
        let mut idx = 0usize;
        let mut tag = input.pkt.tag.clone();

        let mut last: Option<(Arc<Rule>, Option<Arc<Rule>>, String)> = None;
        let mut matches = Vec::new();
        let mut actions = RuleActions::default();

        loop {
            let Some(rule) = rs.rules().get(idx) else {
                let Some(frame) = stack.pop() else {
                    break;
                };
                if frame.matched {
                    if frame.anchor.quick {
                        break;
                    }
                    if let Some(parent) = stack.last_mut() {
                        parent.matched = true;
                    }
                }
                rs = frame.parent;
                idx = frame.resume;
                continue;
            };

            rule.counters.evaluations.fetch_add(1, Ordering::Relaxed);
            match test_rule(rule, input, tables, tag.as_deref()) {
                Test::Skip(c) if use_skip => {
                    idx = rule.skip[c];
                    continue;
                }
                Test::Skip(_) | Test::Next => {
                    idx += 1;
                    continue;
                }
                Test::Match => {}
            }

            if let Some(ref t) = rule.tag {
                tag = Some(t.clone());
            }

            if let Some(ref name) = rule.anchor {
                let Some(child) = self.anchors.get(name) else {
                    warn!(anchor = %name, rule = rule.nr, "anchor not loaded, skipped");
                    idx += 1;
                    continue;
                };
                if stack.len() >= MAX_ANCHOR_DEPTH {
                    error!(
                        anchor = %name,
                        depth = stack.len(),
                        "anchor stack overflow, anchor treated as non-matching"
                    );
                    idx += 1;
                    continue;
                }
                stack.push(Frame {
                    parent: rs,
                    resume: idx + 1,
                    anchor: Arc::clone(rule),
                    matched: false,
                });
                rs = child;
                idx = 0;
                continue;
            }

            if rule.action == RuleAction::Match {
                actions.merge(rule);
                matches.push(Arc::clone(rule));
                idx += 1;
                continue;
            }

            let anchor = stack.last().map(|f| Arc::clone(&f.anchor));
            last = Some((Arc::clone(rule), anchor, rs.name().to_string()));
            if let Some(frame) = stack.last_mut() {
                frame.matched = true;
            }
            if rule.quick {
                break;
            }
            idx += 1;
        }

        let matched = last.is_some();
        let (rule, anchor, ruleset) =
            last.unwrap_or_else(|| (Arc::clone(&self.default_rule), None, String::new()));
        actions.merge(&rule);
        if actions.tag.is_none() {
            actions.tag = tag;
        }

        RuleMatch {
            rule,
            anchor,
            ruleset,
            matches,
            actions,
            matched,
        }
    }
}

fn test_rule(rule: &Rule, input: &RuleInput<'_>, tables: &TableStore, tag: Option<&str>) -> Test {
    let pkt = input.pkt;

    if let Some(ref ifname) = rule.interface
        && (ifname == input.ifname) == rule.ifnot
    {
        return Test::Skip(SKIP_IFP);
    }
    if rule.direction.is_some_and(|d| d != input.dir) {
        return Test::Skip(SKIP_DIR);
    }
    if let Some(rdomain) = rule.onrdomain
        && (rdomain == pkt.rdomain) == rule.ifnot
    {
        return Test::Skip(SKIP_RDOM);
    }
    if rule.af.is_some_and(|af| af != pkt.af) {
        return Test::Skip(SKIP_AF);
    }
    if rule.proto.is_some_and(|p| p != pkt.proto) {
        return Test::Skip(SKIP_PROTO);
    }
    if !rule.src.matches_addr(pkt.af, pkt.src, tables) {
        return Test::Skip(SKIP_SRC_ADDR);
    }
    if !rule.dst.matches_addr(pkt.af, pkt.dst, tables) {
        return Test::Skip(SKIP_DST_ADDR);
    }

    if pkt.fragment {
        // Non-first fragments carry no transport header.
        if rule.src.port.is_some()
            || rule.dst.port.is_some()
            || rule.flagset != 0
            || rule.icmp_type.is_some()
        {
            return Test::Next;
        }
    } else {
        if pkt.proto.has_ports() {
            if rule.src.port.is_some_and(|op| !op.matches(pkt.sport)) {
                return Test::Skip(SKIP_SRC_PORT);
            }
            if rule.dst.port.is_some_and(|op| !op.matches(pkt.dport)) {
                return Test::Skip(SKIP_DST_PORT);
            }
        }
        if rule.flagset != 0
            && pkt.proto == Protocol::Tcp
            && pkt.tcp_flags() & rule.flagset != rule.flags
        {
            return Test::Next;
        }
        if let Some(icmp_type) = rule.icmp_type {
            let Some(ref icmp) = pkt.icmp else {
                return Test::Next;
            };
            if icmp.icmp_type != icmp_type || rule.icmp_code.is_some_and(|c| c != icmp.code) {
                return Test::Next;
            }
        }
    }

    if let Some(ref wanted) = rule.tagged
        && tag != Some(wanted.as_str())
    {
        return Test::Next;
    }

    Test::Match
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::common::entity::{Addr, AddressFamily};
    use crate::common::packet::{IcmpHeader, TH_ACK, TH_SYN, TcpHeader};
    use crate::firewall::entity::{AddrSpec, IpNetwork, KeepState, PortOp};

    fn v4(addr: u32, prefix_len: u8) -> IpNetwork {
        IpNetwork::V4 { addr, prefix_len }
    }

    fn tcp_syn(dport: u16) -> PacketInfo {
        PacketInfo::tcp(
            AddressFamily::Inet,
            Addr::v4(0x0A00_0001),
            1234,
            Addr::v4(0x5DB8_D822),
            dport,
            TcpHeader {
                flags: TH_SYN,
                ..TcpHeader::default()
            },
        )
    }

    fn input<'a>(pkt: &'a PacketInfo, dir: Direction) -> RuleInput<'a> {
        RuleInput {
            dir,
            ifname: "em0",
            pkt,
        }
    }

    fn load(main: Vec<Rule>) -> RuleEngine {
        RuleEngine::load(main, Vec::new(), RuleAction::Pass, 1).unwrap()
    }

    fn block() -> Rule {
        Rule {
            action: RuleAction::Block,
            ..Rule::default()
        }
    }

    // ── Basic matching ────────────────────────────────────────────

    #[test]
    fn empty_ruleset_uses_default_rule() {
        let engine = RuleEngine::load(Vec::new(), Vec::new(), RuleAction::Block, 1).unwrap();
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert!(!m.matched);
        assert_eq!(m.rule.action, RuleAction::Block);
    }

    #[test]
    fn last_matching_rule_wins() {
        let engine = load(vec![
            block(),
            Rule {
                proto: Some(Protocol::Tcp),
                ..Rule::default()
            },
        ]);
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert_eq!(m.rule.action, RuleAction::Pass);
        assert_eq!(m.rule.nr, 1);
    }

    #[test]
    fn quick_rule_stops_evaluation() {
        let engine = load(vec![
            Rule {
                quick: true,
                ..block()
            },
            Rule::default(),
        ]);
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert_eq!(m.rule.nr, 0);
        assert_eq!(m.rule.action, RuleAction::Block);
    }

    #[test]
    fn direction_and_interface_predicates() {
        let engine = load(vec![
            block(),
            Rule {
                direction: Some(Direction::Out),
                ..Rule::default()
            },
            Rule {
                interface: Some("em1".to_string()),
                ..Rule::default()
            },
            Rule {
                interface: Some("em1".to_string()),
                ifnot: true,
                direction: Some(Direction::In),
                proto: Some(Protocol::Udp),
                ..Rule::default()
            },
        ]);
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert_eq!(m.rule.nr, 0);
        let m = engine.evaluate(&input(&pkt, Direction::Out), &TableStore::default());
        assert_eq!(m.rule.nr, 1);
    }

    #[test]
    fn port_and_flag_predicates() {
        let engine = load(vec![
            block(),
            Rule {
                proto: Some(Protocol::Tcp),
                dst: AddrSpec::any().with_port(PortOp::Eq(22)),
                ..Rule::default()
            },
            Rule {
                proto: Some(Protocol::Tcp),
                flags: TH_SYN,
                flagset: TH_SYN | TH_ACK,
                dst: AddrSpec::any().with_port(PortOp::Range(80, 443)),
                ..Rule::default()
            },
        ]);
        let tables = TableStore::default();

        let pkt = tcp_syn(80);
        assert_eq!(engine.evaluate(&input(&pkt, Direction::In), &tables).rule.nr, 2);

        let mut synack = tcp_syn(80);
        if let Some(ref mut tcp) = synack.tcp {
            tcp.flags = TH_SYN | TH_ACK;
        }
        assert_eq!(engine.evaluate(&input(&synack, Direction::In), &tables).rule.nr, 0);

        let pkt = tcp_syn(22);
        assert_eq!(engine.evaluate(&input(&pkt, Direction::In), &tables).rule.nr, 1);
    }

    #[test]
    fn fragments_fail_port_rules() {
        let engine = load(vec![
            block(),
            Rule {
                proto: Some(Protocol::Tcp),
                dst: AddrSpec::any().with_port(PortOp::Eq(80)),
                ..Rule::default()
            },
        ]);
        let mut pkt = tcp_syn(80);
        pkt.fragment = true;
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert_eq!(m.rule.nr, 0);
    }

    #[test]
    fn table_predicate() {
        let tables = TableStore::default();
        tables.define("bad");
        tables.add("bad", v4(0x0A00_0001, 32)).unwrap();
        let engine = load(vec![Rule {
            src: AddrSpec {
                addr: crate::firewall::entity::AddrMatch::Table("bad".to_string()),
                ..AddrSpec::default()
            },
            ..block()
        }]);
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &tables);
        assert_eq!(m.rule.action, RuleAction::Block);
    }

    // ── Match rules and tags ──────────────────────────────────────

    #[test]
    fn match_rules_accumulate_without_deciding() {
        let engine = load(vec![
            block(),
            Rule {
                action: RuleAction::Match,
                log: true,
                tag: Some("web".to_string()),
                ..Rule::default()
            },
            Rule {
                tagged: Some("web".to_string()),
                keep_state: KeepState::Keep,
                ..Rule::default()
            },
        ]);
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert_eq!(m.rule.nr, 2);
        assert_eq!(m.matches.len(), 1);
        assert!(m.actions.log);
        assert_eq!(m.actions.tag.as_deref(), Some("web"));
    }

    #[test]
    fn tagged_without_tag_does_not_match() {
        let engine = load(vec![
            block(),
            Rule {
                tagged: Some("web".to_string()),
                ..Rule::default()
            },
        ]);
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert_eq!(m.rule.nr, 0);
    }

    // ── Anchors ───────────────────────────────────────────────────

    fn anchor(name: &str, quick: bool) -> Rule {
        Rule {
            anchor: Some(name.to_string()),
            quick,
            ..Rule::default()
        }
    }

    #[test]
    fn anchor_rules_participate_in_last_match() {
        let engine = RuleEngine::load(
            vec![block(), anchor("web", false)],
            vec![("web".to_string(), vec![Rule::default()])],
            RuleAction::Block,
            1,
        )
        .unwrap();
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert_eq!(m.rule.action, RuleAction::Pass);
        assert_eq!(m.ruleset, "web");
        assert_eq!(m.anchor.as_ref().map(|a| a.nr), Some(1));
    }

    #[test]
    fn quick_anchor_stops_when_child_matched() {
        let engine = RuleEngine::load(
            vec![anchor("web", true), block()],
            vec![("web".to_string(), vec![Rule::default()])],
            RuleAction::Block,
            1,
        )
        .unwrap();
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert_eq!(m.rule.action, RuleAction::Pass);
        assert_eq!(m.ruleset, "web");
    }

    #[test]
    fn quick_anchor_continues_when_child_did_not_match() {
        let engine = RuleEngine::load(
            vec![anchor("web", true), block()],
            vec![(
                "web".to_string(),
                vec![Rule {
                    proto: Some(Protocol::Udp),
                    ..Rule::default()
                }],
            )],
            RuleAction::Pass,
            1,
        )
        .unwrap();
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert_eq!(m.rule.action, RuleAction::Block);
        assert_eq!(m.ruleset, "");
    }

    #[test]
    fn self_referencing_anchor_is_bounded() {
        let engine = RuleEngine::load(
            vec![anchor("loop", false)],
            vec![("loop".to_string(), vec![anchor("loop", false)])],
            RuleAction::Block,
            1,
        )
        .unwrap();
        let pkt = tcp_syn(80);
        let m = engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        assert!(!m.matched);
        assert_eq!(m.rule.action, RuleAction::Block);
    }

    #[test]
    fn counts_evaluations() {
        let engine = load(vec![Rule::default()]);
        let pkt = tcp_syn(80);
        engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        engine.evaluate(&input(&pkt, Direction::In), &TableStore::default());
        let rule = engine.rule("", 0).unwrap();
        assert_eq!(rule.counters.snapshot().evaluations, 2);
    }

    // ── Skip-step equivalence ─────────────────────────────────────

    fn random_rule(rng: &mut StdRng) -> Rule {
        let proto = match rng.gen_range(0..4) {
            0 => None,
            1 => Some(Protocol::Tcp),
            2 => Some(Protocol::Udp),
            _ => Some(Protocol::Icmp),
        };
        let port = |rng: &mut StdRng| -> Option<PortOp> {
            if proto.is_some_and(Protocol::has_ports) && rng.gen_bool(0.5) {
                Some(PortOp::Le(rng.gen_range(0..4) * 300))
            } else {
                None
            }
        };
        let net = |rng: &mut StdRng| match rng.gen_range(0..3) {
            0 => AddrSpec::any(),
            1 => AddrSpec::net(v4(0x0A00_0000, 8)),
            _ => AddrSpec::net(v4(0x0A00_0000, 24)).negated(),
        };
        let mut src = net(rng);
        src.port = port(rng);
        let mut dst = net(rng);
        dst.port = port(rng);
        Rule {
            action: if rng.gen_bool(0.5) {
                RuleAction::Pass
            } else {
                RuleAction::Block
            },
            quick: rng.gen_bool(0.1),
            direction: match rng.gen_range(0..3) {
                0 => None,
                1 => Some(Direction::In),
                _ => Some(Direction::Out),
            },
            interface: rng.gen_bool(0.2).then(|| "em0".to_string()),
            af: rng.gen_bool(0.2).then_some(AddressFamily::Inet),
            proto,
            src,
            dst,
            ..Rule::default()
        }
    }

    fn random_packet(rng: &mut StdRng) -> PacketInfo {
        let src = Addr::v4(0x0A00_0000 | rng.gen_range(0..512));
        let dst = Addr::v4(if rng.gen_bool(0.5) { 0x0A00_0101 } else { 0xC0A8_0001 });
        let (sport, dport) = (rng.gen_range(0..1200), rng.gen_range(0..1200));
        match rng.gen_range(0..3) {
            0 => {
                let th = TcpHeader {
                    flags: TH_SYN,
                    ..TcpHeader::default()
                };
                PacketInfo::tcp(AddressFamily::Inet, src, sport, dst, dport, th)
            }
            1 => PacketInfo::udp(AddressFamily::Inet, src, sport, dst, dport),
            _ => {
                let icmp = IcmpHeader {
                    icmp_type: 8,
                    code: 0,
                    id: 1,
                    inner: None,
                };
                PacketInfo::icmp(AddressFamily::Inet, src, dst, icmp)
            }
        }
    }

    #[test]
    fn skip_steps_agree_with_linear_walk() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let rules = (0..rng.gen_range(1..40)).map(|_| random_rule(&mut rng)).collect();
            let engine = load(rules);
            let tables = TableStore::default();
            for _ in 0..50 {
                let pkt = random_packet(&mut rng);
                let dir = if rng.gen_bool(0.5) {
                    Direction::In
                } else {
                    Direction::Out
                };
                let inp = input(&pkt, dir);
                let fast = engine.evaluate(&inp, &tables);
                let slow = engine.evaluate_linear(&inp, &tables);
                assert_eq!(fast.rule.uid, slow.rule.uid);
                assert_eq!(fast.matched, slow.matched);
            }
        }
    }
}
