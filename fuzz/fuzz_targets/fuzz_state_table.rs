#![no_main]

use std::collections::HashMap;
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;

use domain::common::entity::{Addr, AddressFamily, Direction, Protocol};
use domain::conntrack::entity::{
    Limits, Peer, State, StateFlags, StateInner, StateKey, TimeoutClass, Timeouts,
};
use domain::conntrack::store::{StateFilter, StateStore};
use domain::firewall::entity::{PortOp, Rule};

// Drive the state store with a stream of operations and keep a model of
// which states are linked. The store must agree with the model after every
// step, and every state must eventually be freed.
//
// Layout: 3-byte chunks [op, arg, dt]
//   op % 5: 0-1 = insert, 2 = unlink, 3 = sweep, 4 = kill by port
//   arg     = source port of the flow
//   dt      = seconds to advance the clock
fuzz_target!(|data: &[u8]| {
    let mut store = StateStore::new(1, Timeouts::default(), Limits::default());
    let rule = Arc::new(Rule::default());
    let mut linked: HashMap<u16, Arc<State>> = HashMap::new();
    let mut now = 1u64;

    for chunk in data.chunks_exact(3) {
        now += u64::from(chunk[2]);
        let sport = u16::from(chunk[1]);
        match chunk[0] % 5 {
            0 | 1 => {
                let state = udp_state(&mut store, &rule, sport, now);
                let inserted = store.insert(Arc::clone(&state), now).is_ok();
                assert_eq!(inserted, !linked.contains_key(&sport));
                if inserted {
                    linked.insert(sport, state);
                }
            }
            2 => {
                if let Some(state) = linked.remove(&sport) {
                    assert!(store.unlink(&state, now));
                    assert!(!store.unlink(&state, now));
                }
            }
            3 => {
                for state in store.sweep(now).expired {
                    assert!(linked.remove(&sport_of(&state)).is_some());
                }
            }
            _ => {
                let filter = StateFilter {
                    sport: Some(PortOp::Eq(sport)),
                    ..StateFilter::default()
                };
                for state in store.kill(&filter, now) {
                    assert!(linked.remove(&sport_of(&state)).is_some());
                }
            }
        }

        assert_eq!(store.len(), linked.len());
        assert!(store.table().sweep_len() >= store.len());
        for state in linked.values() {
            assert!(store.find_by_id(&state.id).is_some());
        }
    }

    store.flush(now);
    assert!(store.is_empty());
    // A full rotation of the sweep list frees every unlinked state.
    let pending = store.table().sweep_len();
    for _ in 0..=pending {
        store.sweep(now);
    }
    assert_eq!(store.table().sweep_len(), 0);
});

fn udp_state(store: &mut StateStore, rule: &Arc<Rule>, sport: u16, now: u64) -> Arc<State> {
    let key = Arc::new(StateKey::for_packet(
        Direction::Out,
        AddressFamily::Inet,
        Protocol::Udp,
        Addr::v4(0x0A00_0001),
        sport,
        Addr::v4(0x5DB8_D822),
        53,
        0,
    ));
    Arc::new(State::new(
        store.next_id(),
        Arc::clone(&key),
        key,
        None,
        Direction::Out,
        Arc::clone(rule),
        now,
        StateInner {
            src: Peer::default(),
            dst: Peer::default(),
            timeout: TimeoutClass::UdpFirstPacket,
            expire: now,
            packets: [0; 2],
            bytes: [0; 2],
            flags: StateFlags::default(),
        },
    ))
}

fn sport_of(state: &State) -> u16 {
    state.wire.port[Direction::Out.sidx()]
}
