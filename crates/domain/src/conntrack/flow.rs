//! Tracking for UDP and protocols without connection semantics.

use crate::common::entity::{Direction, Protocol};

use super::entity::{FlowState, Peer, State, StateInner, TimeoutClass};

/// Peers for a flow created by its first packet.
pub fn init_peers() -> (Peer, Peer) {
    (
        Peer {
            flow: FlowState::Single,
            ..Peer::default()
        },
        Peer {
            flow: FlowState::NoTraffic,
            ..Peer::default()
        },
    )
}

/// Record a packet travelling in `dir` on a UDP or other-protocol state.
pub fn track(state: &State, inner: &mut StateInner, dir: Direction, now: u64) {
    let (src, dst) = inner.peers_mut(dir == state.direction);
    if src.flow < FlowState::Single {
        src.flow = FlowState::Single;
    }
    if dst.flow == FlowState::Single {
        dst.flow = FlowState::Multiple;
    }
    let both = src.flow == FlowState::Multiple && dst.flow == FlowState::Multiple;
    inner.expire = now;
    inner.timeout = match (state.protocol(), both) {
        (Protocol::Udp, true) => TimeoutClass::UdpMultiple,
        (Protocol::Udp, false) => TimeoutClass::UdpSingle,
        (_, true) => TimeoutClass::OtherMultiple,
        (_, false) => TimeoutClass::OtherSingle,
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::common::entity::{Addr, AddressFamily};
    use crate::conntrack::entity::{StateFlags, StateId, StateKey};
    use crate::firewall::entity::Rule;

    fn state(proto: Protocol) -> State {
        let key = Arc::new(StateKey::for_packet(
            Direction::Out,
            AddressFamily::Inet,
            proto,
            Addr::v4(1),
            5353,
            Addr::v4(2),
            53,
            0,
        ));
        let (src, dst) = init_peers();
        State::new(
            StateId { id: 1, creator: 1 },
            Arc::clone(&key),
            key,
            None,
            Direction::Out,
            Arc::new(Rule::default()),
            0,
            StateInner {
                src,
                dst,
                timeout: TimeoutClass::first_packet(proto),
                expire: 0,
                packets: [0; 2],
                bytes: [0; 2],
                flags: StateFlags::default(),
            },
        )
    }

    #[test]
    fn udp_reply_makes_both_sides_multiple() {
        let s = state(Protocol::Udp);
        let mut inner = s.lock();
        assert_eq!(inner.timeout, TimeoutClass::UdpFirstPacket);

        track(&s, &mut inner, Direction::Out, 5);
        assert_eq!(inner.timeout, TimeoutClass::UdpSingle);

        track(&s, &mut inner, Direction::In, 6);
        assert_eq!(inner.src.flow, FlowState::Multiple);
        assert_eq!(inner.dst.flow, FlowState::Single);
        assert_eq!(inner.timeout, TimeoutClass::UdpSingle);

        track(&s, &mut inner, Direction::Out, 7);
        assert_eq!(inner.dst.flow, FlowState::Multiple);
        assert_eq!(inner.timeout, TimeoutClass::UdpMultiple);
        assert_eq!(inner.expire, 7);
    }

    #[test]
    fn other_protocols_use_other_timeouts() {
        let s = state(Protocol::Other(47));
        let mut inner = s.lock();
        track(&s, &mut inner, Direction::Out, 1);
        assert_eq!(inner.timeout, TimeoutClass::OtherSingle);
        track(&s, &mut inner, Direction::In, 2);
        track(&s, &mut inner, Direction::Out, 3);
        assert_eq!(inner.timeout, TimeoutClass::OtherMultiple);
    }
}
