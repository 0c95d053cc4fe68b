//! ICMP correlation.
//!
//! Queries and replies are keyed on a virtual `(id, type)` pair so both
//! directions of an exchange produce mirror-image keys. Error messages are
//! matched to the state of the packet they quote.

use tracing::debug;

use crate::common::entity::{AddressFamily, Direction, DropReason, Protocol};
use crate::common::packet::{InnerHeader, PacketInfo};

use super::entity::{PF_WSCALE_FLAG, State, StateInner, StateKey, TimeoutClass};

pub const ICMP_ECHOREPLY: u8 = 0;
pub const ICMP_UNREACH: u8 = 3;
pub const ICMP_SOURCEQUENCH: u8 = 4;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_ROUTERADVERT: u8 = 9;
pub const ICMP_ROUTERSOLICIT: u8 = 10;
pub const ICMP_TIMXCEED: u8 = 11;
pub const ICMP_PARAMPROB: u8 = 12;
pub const ICMP_TSTAMP: u8 = 13;
pub const ICMP_TSTAMPREPLY: u8 = 14;
pub const ICMP_IREQ: u8 = 15;
pub const ICMP_IREQREPLY: u8 = 16;
pub const ICMP_MASKREQ: u8 = 17;
pub const ICMP_MASKREPLY: u8 = 18;

pub const ICMP6_DST_UNREACH: u8 = 1;
pub const ICMP6_PACKET_TOO_BIG: u8 = 2;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_PARAM_PROB: u8 = 4;
pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;
pub const ND_ROUTER_SOLICIT: u8 = 133;
pub const ND_ROUTER_ADVERT: u8 = 134;
pub const ICMP6_NI_QUERY: u8 = 139;
pub const ICMP6_NI_REPLY: u8 = 140;

/// Classification of an ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpKind {
    /// Query or reply. `dir` is `In` for the request side.
    Query { dir: Direction, vtype: u8, id: u16 },
    /// Error quoting an offending packet.
    Error,
    /// Anything else; keyed on its type alone.
    Other { vtype: u8 },
}

/// Map an ICMP type to its query direction and virtual type.
pub fn icmp_mapping(af: AddressFamily, icmp_type: u8, id: u16) -> IcmpKind {
    let query = |dir, vtype, id| IcmpKind::Query { dir, vtype, id };
    match af {
        AddressFamily::Inet => match icmp_type {
            ICMP_ECHO => query(Direction::In, ICMP_ECHO, id),
            ICMP_ECHOREPLY => query(Direction::Out, ICMP_ECHO, id),
            ICMP_TSTAMP => query(Direction::In, ICMP_TSTAMP, id),
            ICMP_TSTAMPREPLY => query(Direction::Out, ICMP_TSTAMP, id),
            ICMP_IREQ => query(Direction::In, ICMP_IREQ, id),
            ICMP_IREQREPLY => query(Direction::Out, ICMP_IREQ, id),
            ICMP_MASKREQ => query(Direction::In, ICMP_MASKREQ, id),
            ICMP_MASKREPLY => query(Direction::Out, ICMP_MASKREQ, id),
            ICMP_ROUTERSOLICIT => query(Direction::In, ICMP_ROUTERSOLICIT, 0),
            ICMP_ROUTERADVERT => query(Direction::Out, ICMP_ROUTERSOLICIT, 0),
            ICMP_UNREACH | ICMP_SOURCEQUENCH | ICMP_REDIRECT | ICMP_TIMXCEED
            | ICMP_PARAMPROB => IcmpKind::Error,
            other => IcmpKind::Other { vtype: other },
        },
        AddressFamily::Inet6 => match icmp_type {
            ICMP6_ECHO_REQUEST => query(Direction::In, ICMP6_ECHO_REQUEST, id),
            ICMP6_ECHO_REPLY => query(Direction::Out, ICMP6_ECHO_REQUEST, id),
            ND_ROUTER_SOLICIT => query(Direction::In, ND_ROUTER_SOLICIT, 0),
            ND_ROUTER_ADVERT => query(Direction::Out, ND_ROUTER_SOLICIT, 0),
            ICMP6_NI_QUERY => query(Direction::In, ICMP6_NI_QUERY, id),
            ICMP6_NI_REPLY => query(Direction::Out, ICMP6_NI_QUERY, id),
            ICMP6_DST_UNREACH | ICMP6_PACKET_TOO_BIG | ICMP6_TIME_EXCEEDED
            | ICMP6_PARAM_PROB => IcmpKind::Error,
            other => IcmpKind::Other { vtype: other },
        },
    }
}

/// Virtual `(sport, dport)` used to key a query message.
pub fn virtual_ports(kind: IcmpKind) -> (u16, u16) {
    match kind {
        IcmpKind::Query {
            dir: Direction::In,
            vtype,
            id,
        } => (id, u16::from(vtype)),
        IcmpKind::Query {
            dir: Direction::Out,
            vtype,
            id,
        } => (u16::from(vtype), id),
        IcmpKind::Other { vtype } => (0, u16::from(vtype)),
        IcmpKind::Error => (0, 0),
    }
}

/// Fill `sport`/`dport` of an ICMP descriptor with its virtual ports and
/// return the classification. Non-ICMP packets are left alone.
pub fn classify(pkt: &mut PacketInfo) -> Option<IcmpKind> {
    if !pkt.proto.is_icmp() {
        return None;
    }
    let icmp = pkt.icmp.as_ref()?;
    let kind = icmp_mapping(pkt.af, icmp.icmp_type, icmp.id);
    let (sport, dport) = virtual_ports(kind);
    pkt.sport = sport;
    pkt.dport = dport;
    Some(kind)
}

/// Echo and node-information types across address families.
pub fn translate_icmp_type(from: AddressFamily, icmp_type: u8) -> Option<u8> {
    match (from, icmp_type) {
        (AddressFamily::Inet, ICMP_ECHO) => Some(ICMP6_ECHO_REQUEST),
        (AddressFamily::Inet, ICMP_ECHOREPLY) => Some(ICMP6_ECHO_REPLY),
        (AddressFamily::Inet6, ICMP6_ECHO_REQUEST) => Some(ICMP_ECHO),
        (AddressFamily::Inet6, ICMP6_ECHO_REPLY) => Some(ICMP_ECHOREPLY),
        _ => None,
    }
}

// ── Queries ─────────────────────────────────────────────────────────

/// Update a query state for a packet that found it.
///
/// When the creating rule named an ICMP type, a message flowing against the
/// state's query direction is dropped.
pub fn track_query(
    state: &State,
    inner: &mut StateInner,
    pkt_dir: Direction,
    kind: IcmpKind,
    now: u64,
) -> Result<(), DropReason> {
    if let IcmpKind::Query { dir: icmp_dir, .. } = kind
        && state.rule.icmp_type.is_some()
    {
        let expected = if state.direction == pkt_dir {
            Direction::In
        } else {
            Direction::Out
        };
        if expected != icmp_dir {
            debug!(state = %state.id, "icmp message in wrong direction");
            return Err(DropReason::BadState);
        }
    }
    inner.expire = now;
    inner.timeout = TimeoutClass::IcmpErrorReply;
    Ok(())
}

// ── Errors ──────────────────────────────────────────────────────────

/// Key the quoted packet of an ICMP error would have matched.
///
/// The offending packet travelled opposite to the error, so the key is built
/// with the reversed direction; the lookup itself uses the error's direction.
pub fn error_key(dir: Direction, pkt: &PacketInfo) -> Option<StateKey> {
    let inner = pkt.icmp.as_ref()?.inner.as_deref()?;
    let (sport, dport) = inner_ports(inner);
    Some(StateKey::for_packet(
        dir.reverse(),
        inner.af,
        inner.proto,
        inner.src,
        sport,
        inner.dst,
        dport,
        pkt.rdomain,
    ))
}

fn inner_ports(inner: &InnerHeader) -> (u16, u16) {
    match inner.proto {
        Protocol::Tcp | Protocol::Udp => (inner.sport, inner.dport),
        Protocol::Icmp | Protocol::Icmpv6 => {
            virtual_ports(icmp_mapping(inner.af, inner.icmp_type, inner.sport))
        }
        Protocol::Other(_) => (0, 0),
    }
}

/// Validate an ICMP error against the state it refers to and undo the
/// state's translation on the quoted header and the outer addresses.
pub fn check_error(
    state: &State,
    inner_state: &StateInner,
    dir: Direction,
    pkt: &mut PacketInfo,
) -> Result<(), DropReason> {
    let sloppy = inner_state
        .flags
        .contains(super::entity::StateFlags::SLOPPY);
    let Some(inner) = pkt.icmp.as_mut().and_then(|i| i.inner.as_deref_mut()) else {
        return Err(DropReason::Short);
    };

    if inner.proto == Protocol::Tcp {
        // The quoted segment was sent by the peer the error is addressed to.
        let (src, dst) = if dir == state.direction {
            (&inner_state.dst, &inner_state.src)
        } else {
            (&inner_state.src, &inner_state.dst)
        };
        let seq = inner.seq.wrapping_sub(src.seqdiff);
        let dws = if src.wscale & PF_WSCALE_FLAG != 0 && dst.wscale & PF_WSCALE_FLAG != 0 {
            dst.wscale_shift()
        } else {
            0
        };
        let floor = src.seqlo.wrapping_sub(u32::from(dst.max_win) << dws);
        if !sloppy && (!super::tcp::seq_geq(src.seqhi, seq) || !super::tcp::seq_geq(seq, floor)) {
            debug!(state = %state.id, seq, "icmp error quotes segment outside window");
            return Err(DropReason::BadState);
        }
        if src.seqdiff != 0 {
            inner.seq = seq;
            pkt.checksum_dirty = true;
        }
    }

    if state.is_translated() {
        let nk = match dir {
            Direction::In => &state.stack,
            Direction::Out => &state.wire,
        };
        let rev = dir.reverse();
        let (sidx, didx) = (rev.sidx(), rev.didx());
        let Some(inner) = pkt.icmp.as_mut().and_then(|i| i.inner.as_deref_mut()) else {
            return Err(DropReason::Short);
        };
        let (isport, idport) = inner_ports(inner);
        let mut changed = false;
        if inner.src != nk.addr[sidx] || isport != nk.port[sidx] {
            inner.src = nk.addr[sidx];
            set_inner_src_port(inner, nk.port[sidx]);
            pkt.dst = nk.addr[sidx];
            changed = true;
        }
        if inner.dst != nk.addr[didx] || idport != nk.port[didx] {
            inner.dst = nk.addr[didx];
            if matches!(inner.proto, Protocol::Tcp | Protocol::Udp) {
                inner.dport = nk.port[didx];
            }
            pkt.src = nk.addr[didx];
            changed = true;
        }
        if changed {
            pkt.checksum_dirty = true;
        }
    }
    Ok(())
}

fn set_inner_src_port(inner: &mut InnerHeader, port: u16) {
    match inner.proto {
        Protocol::Tcp | Protocol::Udp => inner.sport = port,
        Protocol::Icmp | Protocol::Icmpv6 => {
            // Only the id of a quoted request is translated.
            if let IcmpKind::Query {
                dir: Direction::In, ..
            } = icmp_mapping(inner.af, inner.icmp_type, inner.sport)
            {
                inner.sport = port;
            }
        }
        Protocol::Other(_) => {}
    }
}
