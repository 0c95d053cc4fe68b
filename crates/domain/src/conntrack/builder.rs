//! State construction for a packet that matched a state-creating rule.
//!
//! Source nodes and sticky translations are acquired first; anything that
//! fails afterwards gives them back before the packet is dropped, so a
//! refused packet leaves no trace in the store.

use std::sync::Arc;

use rand::RngCore;
use tracing::debug;

use crate::common::entity::{Addr, AddressFamily, Direction, DropReason, Protocol};
use crate::common::packet::PacketInfo;
use crate::firewall::entity::{KeepState, TcpSegment};
use crate::firewall::evaluator::RuleMatch;
use crate::nat::resolver::{self, NatContext};
use crate::srctrack::engine::Acquired;
use crate::srctrack::entity::SrcNodeKind;

use super::entity::{State, StateFlags, StateInner, StateKey, TimeoutClass};
use super::error::ConnTrackError;
use super::store::StateStore;
use super::{flow, synproxy, tcp};

/// A state that made it into the table.
#[derive(Debug)]
pub struct Created {
    pub state: Arc<State>,
    /// Closed states the new one replaced.
    pub replaced: Vec<Arc<State>>,
    /// SYN|ACK answering the client when the rule proxies the handshake.
    pub synproxy: Option<TcpSegment>,
    /// The packet was rewritten into the other address family.
    pub af_changed: bool,
}

/// Host facts the builder needs but the domain cannot look up.
pub struct BuildEnv<'a> {
    pub rng: &'a mut dyn RngCore,
    pub iface_addr: &'a dyn Fn(&str, AddressFamily) -> Option<Addr>,
    pub ifname: &'a str,
    pub now: u64,
}

/// Build and insert a state for `pkt`, then rewrite the packet if the state
/// translates it.
pub fn create_state(
    store: &mut StateStore,
    rm: &RuleMatch,
    pkt: &mut PacketInfo,
    dir: Direction,
    env: &mut BuildEnv<'_>,
) -> Result<Created, DropReason> {
    let rule = &rm.rule;
    if let Err(e) = store.check_limits(rule) {
        debug!(rule = rule.nr, error = %e, "state limit reached");
        return Err(DropReason::StateLimit);
    }

    let mut acquired: Vec<Acquired> = Vec::new();
    if rule.src_limits.tracking() {
        match store
            .sources_mut()
            .acquire(rule, SrcNodeKind::Rule, pkt.af, pkt.src, env.now)
        {
            Ok(a) => acquired.push(a),
            Err(e) => {
                debug!(rule = rule.nr, src = %pkt.src.display(pkt.af), error = %e, "source limit");
                return Err(e.reason());
            }
        }
    }

    let orig = resolver::packet_tuple(pkt);
    let translated = match rm.actions.translation {
        Some(ref trule) => {
            let (table, sources) = store.parts_mut();
            let key_in_use = |k: &StateKey| table.key_in_use(k);
            let mut ctx = NatContext {
                rng: &mut *env.rng,
                sources,
                key_in_use: &key_in_use,
                iface_addr: env.iface_addr,
                rdomain: pkt.rdomain,
                now: env.now,
                acquired: Vec::new(),
            };
            let res = resolver::resolve(trule, dir, orig, &mut ctx);
            acquired.append(&mut ctx.acquired);
            match res {
                Ok(t) => Some(t),
                Err(e) => {
                    debug!(rule = trule.nr, error = %e, "translation failed");
                    abort(store, acquired, env.now);
                    return Err(e.reason());
                }
            }
        }
        None => None,
    };

    let (wire, stack) = resolver::state_keys(dir, &orig, translated.as_ref(), pkt.rdomain);

    let proto = pkt.proto;
    let proxied = proto == Protocol::Tcp
        && rule.keep_state == KeepState::Synproxy
        && pkt.tcp.as_ref().is_some_and(|th| th.is_pure_syn());
    let (src, dst) = if proto == Protocol::Tcp {
        tcp::init_peers(pkt, rule.keep_state == KeepState::Modulate, &mut *env.rng)
    } else {
        flow::init_peers()
    };

    let mut flags = StateFlags::default();
    for (on, bit) in [
        (rule.allow_opts, StateFlags::ALLOW_OPTS),
        (rule.sloppy, StateFlags::SLOPPY),
        (rule.no_sync, StateFlags::NOSYNC),
        (src.seqdiff != 0, StateFlags::MODULATE),
        (proxied, StateFlags::SYNPROXY),
        (wire.af != stack.af, StateFlags::AFTO),
    ] {
        if on {
            flags.insert(bit);
        }
    }

    // Counters are relative to the state: slot 0 is the initiator.
    let packets = [1, 0];
    let bytes = [u64::from(pkt.tot_len), 0];

    let mut state = State::new(
        store.next_id(),
        wire,
        stack,
        rule.if_bound.then(|| env.ifname.to_string()),
        dir,
        Arc::clone(rule),
        env.now,
        StateInner {
            src,
            dst,
            timeout: TimeoutClass::first_packet(proto),
            expire: env.now,
            packets,
            bytes,
            flags,
        },
    );
    state.anchor = rm.anchor.clone();
    state.nat_rule = rm.actions.translation.clone();
    state.match_rules = rm.matches.clone();
    state.src_nodes = acquired.iter().map(|a| a.key).collect();
    state.tag = rm.actions.tag.clone();
    state.log = rm.actions.log;

    let syn_ack = proxied.then(|| {
        let mut inner = state.lock();
        synproxy::start(&state, &mut inner, pkt, &mut *env.rng)
    });

    let state = Arc::new(state);
    let replaced = match store.insert(Arc::clone(&state), env.now) {
        Ok(replaced) => replaced,
        Err(e) => {
            debug!(state = %state.id, error = %e, "state insert failed");
            abort(store, acquired, env.now);
            return Err(match e {
                ConnTrackError::TableFull { .. } => DropReason::StateLimit,
                _ => DropReason::StateInsert,
            });
        }
    };

    let af_changed = if syn_ack.is_none() {
        resolver::translate(pkt, &state, dir)
    } else {
        false
    };
    debug!(
        state = %state.id,
        rule = rule.nr,
        key = %state.wire,
        translated = state.is_translated(),
        "state created"
    );
    Ok(Created {
        state,
        replaced,
        synproxy: syn_ack,
        af_changed,
    })
}

fn abort(store: &mut StateStore, acquired: Vec<Acquired>, now: u64) {
    let grace = store.timeouts().src_node;
    for a in acquired.into_iter().rev() {
        store.sources_mut().abort(a, now, grace);
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::common::packet::{TH_ACK, TH_SYN, TcpHeader};
    use crate::conntrack::entity::{Limits, TcpState, Timeouts};
    use crate::firewall::entity::{IpNetwork, Rule, RuleAction, SourceLimits};
    use crate::firewall::evaluator::RuleActions;
    use crate::nat::entity::Pool;

    const CLIENT: u32 = 0x0A00_0001;
    const SERVER: u32 = 0x5DB8_D822;
    const PUBLIC: u32 = 0xC633_6401;

    fn matched(rule: Rule) -> RuleMatch {
        let rule = Arc::new(rule);
        let mut actions = RuleActions::default();
        if rule.nat.is_some() || rule.rdr.is_some() || rule.af_to.is_some() {
            actions.translation = Some(Arc::clone(&rule));
        }
        RuleMatch {
            rule,
            anchor: None,
            ruleset: String::new(),
            matches: Vec::new(),
            actions,
            matched: true,
        }
    }

    fn keep() -> Rule {
        Rule {
            action: RuleAction::Pass,
            keep_state: KeepState::Keep,
            ..Rule::default()
        }
    }

    fn syn(sport: u16) -> PacketInfo {
        PacketInfo::tcp(
            AddressFamily::Inet,
            Addr::v4(CLIENT),
            sport,
            Addr::v4(SERVER),
            80,
            TcpHeader {
                seq: 1000,
                flags: TH_SYN,
                win: 8192,
                ..TcpHeader::default()
            },
        )
    }

    fn no_iface(_: &str, _: AddressFamily) -> Option<Addr> {
        None
    }

    fn build(
        store: &mut StateStore,
        rm: &RuleMatch,
        pkt: &mut PacketInfo,
        rng: &mut StdRng,
    ) -> Result<Created, DropReason> {
        let mut env = BuildEnv {
            rng,
            iface_addr: &no_iface,
            ifname: "em0",
            now: 10,
        };
        create_state(store, rm, pkt, Direction::Out, &mut env)
    }

    fn store() -> StateStore {
        StateStore::new(1, Timeouts::default(), Limits::default())
    }

    #[test]
    fn syn_creates_opening_state() {
        let mut st = store();
        let mut rng = StdRng::seed_from_u64(1);
        let rm = matched(keep());
        let mut pkt = syn(1234);
        let created = build(&mut st, &rm, &mut pkt, &mut rng).unwrap();
        let s = &created.state;
        let inner = s.lock();
        assert_eq!(inner.src.state, TcpState::SynSent);
        assert_eq!(inner.dst.state, TcpState::Closed);
        assert_eq!(inner.timeout, TimeoutClass::TcpFirstPacket);
        assert_eq!(inner.packets, [1, 0]);
        assert!(!s.is_translated());
        assert!(s.kif.is_none());
        assert_eq!(st.len(), 1);
        assert_eq!(rm.rule.counters.states(), 1);
        assert!(!pkt.checksum_dirty);
    }

    #[test]
    fn if_bound_and_flags() {
        let mut st = store();
        let mut rng = StdRng::seed_from_u64(1);
        let rm = matched(Rule {
            if_bound: true,
            sloppy: true,
            no_sync: true,
            keep_state: KeepState::Modulate,
            ..keep()
        });
        let mut pkt = syn(1234);
        let created = build(&mut st, &rm, &mut pkt, &mut rng).unwrap();
        assert_eq!(created.state.kif.as_deref(), Some("em0"));
        let flags = created.state.lock().flags;
        assert!(flags.contains(StateFlags::SLOPPY));
        assert!(flags.contains(StateFlags::NOSYNC));
        assert!(flags.contains(StateFlags::MODULATE));
        assert!(pkt.checksum_dirty);
    }

    #[test]
    fn collision_drops_and_releases_source_node() {
        let mut st = store();
        let mut rng = StdRng::seed_from_u64(1);
        let rm = matched(Rule {
            src_limits: SourceLimits {
                max_src_states: 10,
                ..SourceLimits::default()
            },
            ..keep()
        });
        build(&mut st, &rm, &mut syn(1234), &mut rng).unwrap();
        assert_eq!(st.sources().len(), 1);
        let err = build(&mut st, &rm, &mut syn(1234), &mut rng).unwrap_err();
        assert_eq!(err, DropReason::StateInsert);
        let views = st.sources().views(10);
        assert_eq!(views[0].states, 1);
        assert_eq!(st.len(), 1);
    }

    #[test]
    fn source_state_limit_refuses_without_trace() {
        let mut st = store();
        let mut rng = StdRng::seed_from_u64(1);
        let rm = matched(Rule {
            src_limits: SourceLimits {
                max_src_states: 1,
                ..SourceLimits::default()
            },
            ..keep()
        });
        build(&mut st, &rm, &mut syn(1), &mut rng).unwrap();
        let err = build(&mut st, &rm, &mut syn(2), &mut rng).unwrap_err();
        assert_eq!(err, DropReason::SrcLimit);
        assert_eq!(st.len(), 1);
        assert_eq!(rm.rule.counters.states(), 1);
    }

    #[test]
    fn rule_max_states_is_state_limit() {
        let mut st = store();
        let mut rng = StdRng::seed_from_u64(1);
        let rm = matched(Rule {
            max_states: 1,
            ..keep()
        });
        build(&mut st, &rm, &mut syn(1), &mut rng).unwrap();
        let err = build(&mut st, &rm, &mut syn(2), &mut rng).unwrap_err();
        assert_eq!(err, DropReason::StateLimit);
    }

    #[test]
    fn nat_rewrites_packet_and_splits_keys() {
        let mut st = store();
        let mut rng = StdRng::seed_from_u64(1);
        let pool = Pool::single(IpNetwork::V4 {
            addr: PUBLIC,
            prefix_len: 32,
        });
        let rm = matched(Rule {
            nat: Some(Arc::new(pool)),
            ..keep()
        });
        let mut pkt = syn(1234);
        let created = build(&mut st, &rm, &mut pkt, &mut rng).unwrap();
        let s = &created.state;
        assert!(s.is_translated());
        assert_eq!(pkt.src, Addr::v4(PUBLIC));
        assert!((50001..=65535).contains(&pkt.sport));
        assert!(pkt.checksum_dirty);
        assert_eq!(s.stack.addr[Direction::Out.sidx()], Addr::v4(CLIENT));
        assert_eq!(s.wire.addr[Direction::Out.sidx()], Addr::v4(PUBLIC));
        assert_eq!(s.wire.port[Direction::Out.sidx()], pkt.sport);
        // The NAT rule is the governing rule and counted once.
        assert_eq!(rm.rule.counters.states(), 1);
    }

    #[test]
    fn synproxy_answers_and_leaves_packet_alone() {
        let mut st = store();
        let mut rng = StdRng::seed_from_u64(1);
        let rm = matched(Rule {
            keep_state: KeepState::Synproxy,
            ..keep()
        });
        let mut pkt = syn(1234);
        let created = build(&mut st, &rm, &mut pkt, &mut rng).unwrap();
        let seg = created.synproxy.unwrap();
        assert_eq!(seg.flags, TH_SYN | TH_ACK);
        assert_eq!(seg.ack, 1001);
        assert_eq!(created.state.lock().src.state, TcpState::ProxySrc);
        assert!(created.state.lock().flags.contains(StateFlags::SYNPROXY));
    }

    #[test]
    fn udp_state_uses_flow_peers() {
        let mut st = store();
        let mut rng = StdRng::seed_from_u64(1);
        let rm = matched(keep());
        let mut pkt = PacketInfo::udp(AddressFamily::Inet, Addr::v4(CLIENT), 5353, Addr::v4(SERVER), 53);
        let created = build(&mut st, &rm, &mut pkt, &mut rng).unwrap();
        let inner = created.state.lock();
        assert_eq!(inner.timeout, TimeoutClass::UdpFirstPacket);
        assert_eq!(inner.src.flow, crate::conntrack::entity::FlowState::Single);
    }
}
