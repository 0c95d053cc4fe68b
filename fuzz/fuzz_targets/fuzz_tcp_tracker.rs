#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use rand::SeedableRng;
use rand::rngs::StdRng;

use domain::common::entity::{Addr, AddressFamily, Direction, Protocol};
use domain::common::packet::{PacketInfo, TH_SYN, TcpHeader};
use domain::conntrack::entity::{State, StateFlags, StateId, StateInner, StateKey, TimeoutClass};
use domain::conntrack::tcp::{TcpOutcome, init_peers, track};
use domain::firewall::entity::Rule;

const CLIENT: u32 = 0x0A00_0001;
const SERVER: u32 = 0x5DB8_D822;

// Open a state from a SYN, then feed it arbitrary segments in both
// directions. Peer connection states must never move backwards.
//
// Layout (variable-length):
//   [0]    = mode bits (bit 0: modulate, bit 1: sloppy)
//   [1..5] = client ISN
//   rest   = 12-byte chunks, one segment each
fuzz_target!(|data: &[u8]| {
    if data.len() < 5 {
        return;
    }

    let modulate = data[0] & 1 != 0;
    let sloppy = data[0] & 2 != 0;
    let isn = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let mut rng = StdRng::seed_from_u64(u64::from(isn));

    let mut syn = segment(true, TH_SYN, isn, 0, 0, 65535);
    let state = open(&mut syn, modulate, sloppy, &mut rng);

    for (now, chunk) in (1u64..).zip(data[5..].chunks_exact(12)) {
        let from_client = chunk[0] & 1 != 0;
        let seq = u32::from_be_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]);
        let ack = u32::from_be_bytes([chunk[5], chunk[6], chunk[7], chunk[8]]);
        let len = u32::from(chunk[9]) * 8;
        let win = u16::from_be_bytes([chunk[10], chunk[11]]);
        let mut pkt = segment(from_client, chunk[0] >> 1, seq, ack, len, win);
        let dir = if from_client { Direction::Out } else { Direction::In };

        let mut inner = state.lock();
        let before = (inner.src.state, inner.dst.state);
        let outcome = track(&state, &mut inner, &mut pkt, dir, &mut rng, now);
        if matches!(outcome, Ok(TcpOutcome::Reuse)) {
            break;
        }
        assert!(inner.src.state >= before.0, "initiator went from {:?} to {:?}", before.0, inner.src.state);
        assert!(inner.dst.state >= before.1, "responder went from {:?} to {:?}", before.1, inner.dst.state);
    }
});

fn segment(from_client: bool, flags: u8, seq: u32, ack: u32, len: u32, win: u16) -> PacketInfo {
    let th = TcpHeader {
        seq,
        ack,
        flags,
        win,
        payload_len: len,
        ..TcpHeader::default()
    };
    if from_client {
        PacketInfo::tcp(AddressFamily::Inet, Addr::v4(CLIENT), 1234, Addr::v4(SERVER), 80, th)
    } else {
        PacketInfo::tcp(AddressFamily::Inet, Addr::v4(SERVER), 80, Addr::v4(CLIENT), 1234, th)
    }
}

fn open(syn: &mut PacketInfo, modulate: bool, sloppy: bool, rng: &mut StdRng) -> State {
    let key = Arc::new(StateKey::for_packet(
        Direction::Out,
        AddressFamily::Inet,
        Protocol::Tcp,
        syn.src,
        syn.sport,
        syn.dst,
        syn.dport,
        0,
    ));
    let (src, dst) = init_peers(syn, modulate, rng);
    let mut flags = StateFlags::default();
    if sloppy {
        flags.insert(StateFlags::SLOPPY);
    }
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
            timeout: TimeoutClass::TcpFirstPacket,
            expire: 0,
            packets: [0; 2],
            bytes: [0; 2],
            flags,
        },
    )
}
