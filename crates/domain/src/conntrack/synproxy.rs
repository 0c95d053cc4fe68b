//! SYN proxy.
//!
//! The engine completes the handshake with the client itself, then opens
//! the server side and splices both sequence spaces together. Until then no
//! client segment reaches the server.

use rand::RngCore;
use tracing::debug;

use crate::common::entity::{AddressFamily, Direction, DropReason};
use crate::common::packet::{PacketInfo, TH_ACK, TH_FIN, TH_RST, TH_SYN};
use crate::firewall::entity::TcpSegment;

use super::entity::{State, StateInner, StateKey, TcpState, TimeoutClass};

/// MSS assumed when the client sent none.
pub const TCP_MSS_DEFAULT: u16 = 512;
const TCP_MSS_MIN: u16 = 64;
/// Largest MSS a 1500-byte link carries.
const LINK_MTU: u16 = 1500;

/// MSS advertised on proxied handshakes: the client's, bounded by what a
/// standard link can carry.
pub fn clamp_mss(af: AddressFamily, offered: Option<u16>) -> u16 {
    let headers = match af {
        AddressFamily::Inet => 40,
        AddressFamily::Inet6 => 60,
    };
    offered
        .unwrap_or(TCP_MSS_DEFAULT)
        .min(LINK_MTU - headers)
        .max(TCP_MSS_MIN)
}

/// Segments produced by a handshake step that consumed the packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynproxyStep {
    pub emitted: Vec<TcpSegment>,
    /// The client completed its handshake; source-tracked states run the
    /// connection limit now.
    pub client_acked: bool,
}

/// Key on the client's side of the proxy.
fn client_key(state: &State) -> &StateKey {
    match state.direction {
        Direction::In => &state.wire,
        Direction::Out => &state.stack,
    }
}

/// Key on the server's side of the proxy.
fn server_key(state: &State) -> &StateKey {
    match state.direction {
        Direction::In => &state.stack,
        Direction::Out => &state.wire,
    }
}

#[allow(clippy::too_many_arguments)]
fn segment(
    key: &StateKey,
    from: usize,
    seq: u32,
    ack: u32,
    flags: u8,
    win: u16,
    mss: Option<u16>,
) -> TcpSegment {
    let to = 1 - from;
    TcpSegment {
        af: key.af,
        src: key.addr[from],
        dst: key.addr[to],
        sport: key.port[from],
        dport: key.port[to],
        seq,
        ack,
        flags,
        win,
        mss,
        rdomain: key.rdomain,
    }
}

/// SYN|ACK from the server's address back to the client.
fn syn_ack(state: &State, inner: &StateInner) -> TcpSegment {
    segment(
        client_key(state),
        state.direction.didx(),
        inner.src.seqhi,
        inner.src.seqlo.wrapping_add(1),
        TH_SYN | TH_ACK,
        0,
        Some(inner.src.mss),
    )
}

/// Put a fresh state into `PROXY_SRC` and answer the client's SYN.
pub fn start(
    state: &State,
    inner: &mut StateInner,
    pkt: &PacketInfo,
    rng: &mut dyn RngCore,
) -> TcpSegment {
    let mss = pkt.tcp.as_ref().and_then(|th| th.mss);
    inner.src.state = TcpState::ProxySrc;
    inner.src.seqhi = rng.next_u32();
    inner.src.mss = clamp_mss(state.af(), mss);
    syn_ack(state, inner)
}

/// Run a segment through the proxy handshake.
///
/// Returns `None` once the state left the proxy phases; the segment then
/// belongs to the regular tracker. `Some(Ok(_))` consumed the packet
/// (`SYNPROXY_DROP`), `Some(Err(_))` rejects it.
pub fn track(
    state: &State,
    inner: &mut StateInner,
    pkt: &PacketInfo,
    dir: Direction,
    rng: &mut dyn RngCore,
    now: u64,
) -> Option<Result<SynproxyStep, DropReason>> {
    let phase = inner.src.state;
    if phase != TcpState::ProxySrc && phase != TcpState::ProxyDst {
        return None;
    }
    let Some(th) = pkt.tcp.as_ref() else {
        return Some(Err(DropReason::Synproxy));
    };
    let from_client = dir == state.direction;
    let mut step = SynproxyStep::default();

    if phase == TcpState::ProxySrc {
        if !from_client {
            return Some(Ok(step));
        }
        if th.has(TH_SYN) {
            if th.seq != inner.src.seqlo {
                debug!(state = %state.id, "synproxy: SYN with a different ISN");
                return Some(Err(DropReason::Synproxy));
            }
            step.emitted.push(syn_ack(state, inner));
            return Some(Ok(step));
        }
        if th.flags & (TH_ACK | TH_RST | TH_FIN) != TH_ACK
            || th.ack != inner.src.seqhi.wrapping_add(1)
            || th.seq != inner.src.seqlo.wrapping_add(1)
        {
            debug!(state = %state.id, "synproxy: bad client ACK");
            return Some(Err(DropReason::Synproxy));
        }
        inner.src.state = TcpState::ProxyDst;
        step.client_acked = true;
    }

    if from_client {
        if th.flags & (TH_SYN | TH_ACK) != TH_ACK
            || th.ack != inner.src.seqhi.wrapping_add(1)
            || th.seq != inner.src.seqlo.wrapping_add(1)
        {
            return Some(Err(DropReason::Synproxy));
        }
        inner.src.max_win = th.win.max(1);
        if inner.dst.seqhi == 1 {
            inner.dst.seqhi = rng.next_u32();
        }
        step.emitted.push(segment(
            server_key(state),
            state.direction.sidx(),
            inner.dst.seqhi,
            0,
            TH_SYN,
            0,
            Some(inner.src.mss),
        ));
        return Some(Ok(step));
    }

    if th.flags & (TH_SYN | TH_ACK) != (TH_SYN | TH_ACK)
        || th.ack != inner.dst.seqhi.wrapping_add(1)
    {
        debug!(state = %state.id, "synproxy: bad server SYN|ACK");
        return Some(Err(DropReason::Synproxy));
    }
    inner.dst.max_win = th.win.max(1);
    inner.dst.seqlo = th.seq;

    // ACK the server, then complete the client's view.
    step.emitted.push(segment(
        server_key(state),
        state.direction.sidx(),
        th.ack,
        th.seq.wrapping_add(1),
        TH_ACK,
        inner.src.max_win,
        None,
    ));
    step.emitted.push(segment(
        client_key(state),
        state.direction.didx(),
        inner.src.seqhi.wrapping_add(1),
        inner.src.seqlo.wrapping_add(1),
        TH_ACK,
        inner.dst.max_win,
        None,
    ));

    let (src, dst) = (&mut inner.src, &mut inner.dst);
    src.seqdiff = dst.seqhi.wrapping_sub(src.seqlo);
    dst.seqdiff = src.seqhi.wrapping_sub(dst.seqlo);
    src.seqhi = src.seqlo.wrapping_add(u32::from(dst.max_win));
    dst.seqhi = dst.seqlo.wrapping_add(u32::from(src.max_win));
    src.wscale = 0;
    dst.wscale = 0;
    src.state = TcpState::Established;
    dst.state = TcpState::Established;
    inner.expire = now;
    inner.timeout = TimeoutClass::TcpEstablished;
    debug!(state = %state.id, "synproxy: spliced");
    Some(Ok(step))
}
