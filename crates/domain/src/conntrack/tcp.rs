//! TCP sequence tracking.
//!
//! Full mode validates every segment against the peers' windows (Guido van
//! Rooij's "Real Stateful TCP Packet Filtering in IP Filter"); sloppy mode
//! only follows the connection lifecycle.

use rand::RngCore;
use tracing::debug;

use crate::common::entity::{Direction, DropReason};
use crate::common::packet::{PacketInfo, TH_ACK, TH_FIN, TH_RST, TH_SYN, TcpHeader};
use crate::firewall::entity::TcpSegment;

use super::entity::{
    PF_WSCALE_FLAG, PF_WSCALE_MASK, Peer, State, StateFlags, StateInner, TCP_MAX_WINSHIFT,
    TcpState, TimeoutClass,
};

/// Largest window a peer may advertise without scaling.
pub const TCP_MAXWIN: u32 = 65535;
/// Slack for ACKs behind or ahead of the tracked window.
pub const MAXACKWINDOW: i64 = 0xffff + 1500;

pub(crate) fn seq_geq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

pub(crate) fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Outcome of a segment that is allowed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOutcome {
    Pass,
    /// The segment completed the handshake; source-tracked states run the
    /// connection limit now.
    Established,
    /// Bare SYN on a closed connection. The state must be unlinked and the
    /// packet evaluated against the rules again.
    Reuse,
}

/// A segment that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpReject {
    pub reason: DropReason,
    /// RST to send back when both peers are stuck in `SYN_SENT`.
    pub rst: Option<TcpSegment>,
}

impl TcpReject {
    fn bad_state() -> Self {
        Self {
            reason: DropReason::BadState,
            rst: None,
        }
    }
}

/// Window-scale value recorded for a peer from its SYN.
pub fn wscale_of(th: &TcpHeader) -> u8 {
    match th.wscale {
        Some(shift) if th.has(TH_SYN) => PF_WSCALE_FLAG | shift.min(TCP_MAX_WINSHIFT),
        _ => 0,
    }
}

/// Peers for a state created by `th`. With `modulate`, the initiator's ISN
/// is replaced by a random one and the segment is patched.
pub fn init_peers(pkt: &mut PacketInfo, modulate: bool, rng: &mut dyn RngCore) -> (Peer, Peer) {
    let Some(th) = pkt.tcp.as_mut() else {
        return (Peer::default(), Peer::default());
    };
    let mut src = Peer {
        seqlo: th.seq,
        seqhi: th.seq.wrapping_add(th.payload_len).wrapping_add(1),
        ..Peer::default()
    };
    if th.is_pure_syn() && modulate {
        src.seqdiff = rng.next_u32().wrapping_sub(src.seqlo);
        if src.seqdiff == 0 {
            src.seqdiff = 1;
        }
        th.seq = src.seqlo.wrapping_add(src.seqdiff);
        pkt.checksum_dirty = true;
    }
    if th.has(TH_SYN) {
        src.seqhi = src.seqhi.wrapping_add(1);
        src.wscale = wscale_of(th);
    }
    src.max_win = th.win.max(1);
    if src.wscale & PF_WSCALE_MASK != 0 {
        let shift = src.wscale & PF_WSCALE_MASK;
        let win = u32::from(src.max_win) + (1 << shift);
        src.max_win = ((win - 1) >> shift) as u16;
    }
    if th.has(TH_FIN) {
        src.seqhi = src.seqhi.wrapping_add(1);
    }
    src.state = TcpState::SynSent;
    let dst = Peer {
        seqhi: 1,
        max_win: 1,
        state: TcpState::Closed,
        ..Peer::default()
    };
    (src, dst)
}

/// Track a segment of an existing state. `dir` is the packet's direction.
pub fn track(
    state: &State,
    inner: &mut StateInner,
    pkt: &mut PacketInfo,
    dir: Direction,
    rng: &mut dyn RngCore,
    now: u64,
) -> Result<TcpOutcome, TcpReject> {
    let sender_is_src = dir == state.direction;
    let Some(flags) = pkt.tcp.as_ref().map(|th| th.flags) else {
        return Err(TcpReject {
            reason: DropReason::Short,
            rst: None,
        });
    };

    {
        let (src, dst) = inner.peers_mut(sender_is_src);
        if flags & (TH_SYN | TH_ACK) == TH_SYN
            && src.state >= TcpState::FinWait2
            && dst.state >= TcpState::FinWait2
        {
            debug!(state = %state.id, "state reuse");
            inner.timeout = TimeoutClass::Purge;
            return Ok(TcpOutcome::Reuse);
        }
    }

    if inner.flags.contains(StateFlags::SLOPPY) {
        Ok(track_sloppy(inner, sender_is_src, flags, now))
    } else {
        track_full(state, inner, sender_is_src, pkt, rng, now)
    }
}

fn set_timeout_from_peers(inner: &mut StateInner) {
    let (s, d) = (inner.src.state, inner.dst.state);
    inner.timeout = if s >= TcpState::FinWait2 && d >= TcpState::FinWait2 {
        TimeoutClass::TcpClosed
    } else if s >= TcpState::Closing && d >= TcpState::Closing {
        TimeoutClass::TcpFinWait
    } else if s < TcpState::Established || d < TcpState::Established {
        TimeoutClass::TcpOpening
    } else if s >= TcpState::Closing || d >= TcpState::Closing {
        TimeoutClass::TcpClosing
    } else {
        TimeoutClass::TcpEstablished
    };
}

// ── Full tracking ───────────────────────────────────────────────────

fn track_full(
    state: &State,
    inner: &mut StateInner,
    sender_is_src: bool,
    pkt: &mut PacketInfo,
    rng: &mut dyn RngCore,
    now: u64,
) -> Result<TcpOutcome, TcpReject> {
    let Some(th) = pkt.tcp.as_mut() else {
        return Err(TcpReject::bad_state());
    };
    let (src, dst) = inner.peers_mut(sender_is_src);
    let flags = th.flags;
    let mut win = u32::from(th.win);

    let (mut sws, mut dws) = if src.wscale != 0 && dst.wscale != 0 && flags & TH_SYN == 0 {
        (src.wscale_shift(), dst.wscale_shift())
    } else {
        (0, 0)
    };

    let orig_seq = th.seq;
    let mut seq = th.seq;
    let mut patched = false;
    let mut ack;
    let mut end;
    let mut data_end;

    if src.seqlo == 0 {
        // First segment from this end.
        if dst.seqdiff != 0 && src.seqdiff == 0 {
            // Deferred modulator for the responder.
            while src.seqdiff == 0 {
                src.seqdiff = rng.next_u32().wrapping_sub(seq);
            }
            ack = th.ack.wrapping_sub(dst.seqdiff);
            th.seq = seq.wrapping_add(src.seqdiff);
            th.ack = ack;
            patched = true;
        } else {
            ack = th.ack;
        }

        end = seq.wrapping_add(th.payload_len);
        if flags & TH_SYN != 0 {
            end = end.wrapping_add(1);
            if dst.wscale & PF_WSCALE_FLAG != 0 {
                src.wscale = wscale_of(th);
                if src.wscale & PF_WSCALE_FLAG != 0 {
                    sws = src.wscale & PF_WSCALE_MASK;
                    win = (win + (1 << sws) - 1) >> sws;
                    dws = dst.wscale & PF_WSCALE_MASK;
                } else {
                    // The peer did not answer with scaling; undo ours.
                    dst.max_win = (u32::from(dst.max_win) << (dst.wscale & PF_WSCALE_MASK))
                        .min(TCP_MAXWIN) as u16;
                    dst.wscale = 0;
                }
            }
        }
        data_end = end;
        if flags & TH_FIN != 0 {
            end = end.wrapping_add(1);
        }

        src.seqlo = seq;
        if src.state < TcpState::SynSent {
            src.state = TcpState::SynSent;
        }
        let span = (u32::from(dst.max_win) << dws).max(1);
        if src.seqhi == 1 || seq_geq(end.wrapping_add(span), src.seqhi) {
            src.seqhi = end.wrapping_add(span);
        }
        if win > u32::from(src.max_win) {
            src.max_win = win.min(u32::from(u16::MAX)) as u16;
        }
    } else {
        ack = th.ack.wrapping_sub(dst.seqdiff);
        if src.seqdiff != 0 {
            th.seq = seq.wrapping_add(src.seqdiff);
            th.ack = ack;
            patched = true;
        }
        end = seq.wrapping_add(th.payload_len);
        if flags & TH_SYN != 0 {
            end = end.wrapping_add(1);
        }
        data_end = end;
        if flags & TH_FIN != 0 {
            end = end.wrapping_add(1);
        }
    }

    if flags & TH_ACK == 0
        || (ack == 0 && flags & (TH_ACK | TH_RST) == (TH_ACK | TH_RST))
        || dst.state < TcpState::SynSent
    {
        // Nothing to acknowledge yet, or a stack that leaves ACK unset.
        ack = dst.seqlo;
    }

    if seq == end {
        // Empty segments are not sequenced.
        seq = src.seqlo;
        end = seq;
        data_end = seq;
    }

    let ackskew = i64::from(dst.seqlo.wrapping_sub(ack) as i32);

    if dst.seqdiff != 0 && !th.sack.is_empty() {
        for block in &mut th.sack {
            block.start = block.start.wrapping_sub(dst.seqdiff);
            block.end = block.end.wrapping_sub(dst.seqdiff);
        }
        patched = true;
    }

    let in_window = seq_geq(src.seqhi, data_end);
    let not_too_old = seq_geq(seq, src.seqlo.wrapping_sub(u32::from(dst.max_win) << dws));
    let ack_behind_ok = ackskew >= -MAXACKWINDOW;
    let ack_ahead_ok = ackskew <= (MAXACKWINDOW << sws);
    let rst_ok = flags & TH_RST == 0
        || orig_seq == src.seqlo
        || orig_seq == src.seqlo.wrapping_add(1)
        || orig_seq.wrapping_add(1) == src.seqlo;

    let scaled_win = win << sws;
    let outcome;
    if in_window && not_too_old && ack_behind_ok && ack_ahead_ok && rst_ok {
        if win > u32::from(src.max_win) {
            src.max_win = win.min(u32::from(u16::MAX)) as u16;
        }
        if seq_gt(end, src.seqlo) {
            src.seqlo = end;
        }
        if seq_geq(ack.wrapping_add(scaled_win), dst.seqhi) {
            dst.seqhi = ack.wrapping_add(scaled_win.max(1));
        }

        if flags & TH_SYN != 0 && src.state < TcpState::SynSent {
            src.state = TcpState::SynSent;
        }
        if flags & TH_FIN != 0 && src.state < TcpState::Closing {
            src.state = TcpState::Closing;
        }
        let mut established = false;
        if flags & TH_ACK != 0 {
            if dst.state == TcpState::SynSent {
                dst.state = TcpState::Established;
                established = src.state == TcpState::Established;
            } else if dst.state == TcpState::Closing {
                dst.state = TcpState::FinWait2;
            }
        }
        if flags & TH_RST != 0 {
            src.state = TcpState::TimeWait;
            dst.state = TcpState::TimeWait;
        }

        inner.expire = now;
        set_timeout_from_peers(inner);
        outcome = if established {
            TcpOutcome::Established
        } else {
            TcpOutcome::Pass
        };
    } else if (dst.state < TcpState::SynSent
        || dst.state >= TcpState::FinWait2
        || src.state >= TcpState::FinWait2)
        && seq_geq(
            src.seqhi.wrapping_add(MAXACKWINDOW as u32),
            data_end,
        )
        && seq_geq(seq, src.seqlo.wrapping_sub(MAXACKWINDOW as u32))
    {
        // Shotgunned SYNs, a connection picked up mid-stream, or spew after
        // close. The expiry is left alone so a flood cannot keep it alive.
        debug!(
            state = %state.id,
            seq = orig_seq,
            ack,
            src_state = src.state.as_str(),
            dst_state = dst.state.as_str(),
            "loose state match"
        );
        if win > u32::from(src.max_win) {
            src.max_win = win.min(u32::from(u16::MAX)) as u16;
        }
        if seq_gt(end, src.seqlo) {
            src.seqlo = end;
        }
        if seq_geq(ack.wrapping_add(scaled_win), dst.seqhi) {
            dst.seqhi = ack.wrapping_add(scaled_win.max(1));
        }
        if flags & TH_FIN != 0 && src.state < TcpState::Closing {
            src.state = TcpState::Closing;
        }
        if flags & TH_RST != 0 {
            src.state = TcpState::TimeWait;
            dst.state = TcpState::TimeWait;
        }
        outcome = TcpOutcome::Pass;
    } else {
        let mut reject = TcpReject::bad_state();
        if src.state == TcpState::SynSent && dst.state == TcpState::SynSent {
            if flags & TH_RST == 0 {
                reject.rst = Some(TcpSegment {
                    af: pkt.af,
                    src: pkt.dst,
                    dst: pkt.src,
                    sport: pkt.dport,
                    dport: pkt.sport,
                    seq: th.ack,
                    ack: 0,
                    flags: TH_RST,
                    win: 0,
                    mss: None,
                    rdomain: pkt.rdomain,
                });
            }
            src.seqlo = 0;
            src.seqhi = 1;
            src.max_win = 1;
        } else {
            debug!(
                state = %state.id,
                seq = orig_seq,
                ack,
                ackskew,
                in_window,
                not_too_old,
                ack_behind_ok,
                ack_ahead_ok,
                rst_ok,
                "bad state"
            );
        }
        if patched {
            pkt.checksum_dirty = true;
        }
        return Err(reject);
    }

    if patched {
        pkt.checksum_dirty = true;
    }
    Ok(outcome)
}

// ── Sloppy tracking ─────────────────────────────────────────────────

fn track_sloppy(inner: &mut StateInner, sender_is_src: bool, flags: u8, now: u64) -> TcpOutcome {
    let mut timeout = None;
    let mut established = false;
    {
        let (src, dst) = inner.peers_mut(sender_is_src);
        if flags & TH_SYN != 0 && src.state < TcpState::SynSent {
            src.state = TcpState::SynSent;
            timeout = Some(TimeoutClass::TcpOpening);
        }
        if flags & TH_FIN != 0 && src.state < TcpState::Closing {
            src.state = TcpState::Closing;
            timeout = Some(TimeoutClass::TcpClosing);
        }
        if flags & TH_ACK != 0 {
            if dst.state == TcpState::SynSent {
                dst.state = TcpState::Established;
                timeout = Some(TimeoutClass::TcpEstablished);
                established = src.state == TcpState::Established;
            } else if dst.state == TcpState::Closing {
                dst.state = TcpState::FinWait2;
                timeout = Some(TimeoutClass::TcpFinWait);
            } else if src.state == TcpState::SynSent && dst.state < TcpState::SynSent {
                // Only one half of the connection is visible. Not a
                // completed handshake, so no connection limit.
                src.state = TcpState::Established;
                dst.state = TcpState::Established;
                timeout = Some(TimeoutClass::TcpEstablished);
            } else if src.state == TcpState::Closing
                && dst.state == TcpState::Established
                && dst.seqlo == 0
            {
                // Half-closed without the full FIN handshake in view.
                dst.state = TcpState::Closing;
                timeout = Some(TimeoutClass::TcpClosing);
            }
        }
        if flags & TH_RST != 0 {
            src.state = TcpState::TimeWait;
            dst.state = TcpState::TimeWait;
            timeout = Some(TimeoutClass::TcpClosed);
        }
    }
    if let Some(class) = timeout {
        inner.timeout = class;
    }
    inner.expire = now;
    if established {
        TcpOutcome::Established
    } else {
        TcpOutcome::Pass
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::common::entity::{Addr, AddressFamily, Protocol};
    use crate::common::packet::SackBlock;
    use crate::conntrack::entity::{StateId, StateKey};
    use crate::firewall::entity::Rule;

    const CLIENT: u32 = 0x0A00_0001;
    const SERVER: u32 = 0x5DB8_D822;

    fn seg(from_client: bool, flags: u8, seq: u32, ack: u32, len: u32) -> PacketInfo {
        let th = TcpHeader {
            seq,
            ack,
            flags,
            win: 65535,
            payload_len: len,
            ..TcpHeader::default()
        };
        if from_client {
            PacketInfo::tcp(AddressFamily::Inet, Addr::v4(CLIENT), 1234, Addr::v4(SERVER), 80, th)
        } else {
            PacketInfo::tcp(AddressFamily::Inet, Addr::v4(SERVER), 80, Addr::v4(CLIENT), 1234, th)
        }
    }

    fn dir(from_client: bool) -> Direction {
        if from_client { Direction::Out } else { Direction::In }
    }

    fn new_state(syn: &mut PacketInfo, modulate: bool, rng: &mut StdRng) -> State {
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
                flags: StateFlags::default(),
            },
        )
    }

    fn run(
        s: &State,
        rng: &mut StdRng,
        from_client: bool,
        flags: u8,
        seq: u32,
        ack: u32,
        len: u32,
    ) -> Result<TcpOutcome, TcpReject> {
        let mut pkt = seg(from_client, flags, seq, ack, len);
        track(s, &mut s.lock(), &mut pkt, dir(from_client), rng, 1)
    }

    /// Client ISN 1000, server ISN 5000, handshake completed.
    fn established(rng: &mut StdRng) -> State {
        let mut syn = seg(true, TH_SYN, 1000, 0, 0);
        let s = new_state(&mut syn, false, rng);
        run(&s, rng, false, TH_SYN | TH_ACK, 5000, 1001, 0).unwrap();
        run(&s, rng, true, TH_ACK, 1001, 5001, 0).unwrap();
        s
    }

    // ── Handshake ─────────────────────────────────────────────────

    #[test]
    fn syn_creates_syn_sent_and_closed() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut syn = seg(true, TH_SYN, 1000, 0, 0);
        let s = new_state(&mut syn, false, &mut rng);
        let inner = s.lock();
        assert_eq!(inner.src.state, TcpState::SynSent);
        assert_eq!(inner.dst.state, TcpState::Closed);
        assert_eq!(inner.src.seqlo, 1000);
        assert_eq!(inner.src.seqhi, 1002);
        assert_eq!(inner.timeout, TimeoutClass::TcpFirstPacket);
    }

    #[test]
    fn handshake_reaches_established_on_final_ack() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut syn = seg(true, TH_SYN, 1000, 0, 0);
        let s = new_state(&mut syn, false, &mut rng);

        let out = run(&s, &mut rng, false, TH_SYN | TH_ACK, 5000, 1001, 0).unwrap();
        assert_eq!(out, TcpOutcome::Pass);
        {
            let inner = s.lock();
            assert_eq!(inner.dst.state, TcpState::SynSent);
            assert_eq!(inner.timeout, TimeoutClass::TcpOpening);
        }

        let out = run(&s, &mut rng, true, TH_ACK, 1001, 5001, 0).unwrap();
        assert_eq!(out, TcpOutcome::Established);
        let inner = s.lock();
        assert_eq!(inner.src.state, TcpState::Established);
        assert_eq!(inner.dst.state, TcpState::Established);
        assert_eq!(inner.timeout, TimeoutClass::TcpEstablished);
        assert_eq!(inner.expire, 1);
    }

    #[test]
    fn data_advances_seqlo_monotonically() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = established(&mut rng);
        run(&s, &mut rng, true, TH_ACK, 1001, 5001, 500).unwrap();
        assert_eq!(s.lock().src.seqlo, 1501);
        // A retransmission of older data does not move it back.
        run(&s, &mut rng, true, TH_ACK, 1001, 5001, 100).unwrap();
        assert_eq!(s.lock().src.seqlo, 1501);
    }

    #[test]
    fn out_of_window_segment_is_dropped() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = established(&mut rng);
        let err = run(&s, &mut rng, true, TH_ACK, 1001 + 10_000_000, 5001, 10).unwrap_err();
        assert_eq!(err.reason, DropReason::BadState);
        assert!(err.rst.is_none());
    }

    #[test]
    fn rst_needs_exact_sequence() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = established(&mut rng);
        assert!(run(&s, &mut rng, false, TH_RST, 5100, 0, 0).is_err());
        assert!(run(&s, &mut rng, false, TH_RST, 5002, 0, 0).is_ok());
        let inner = s.lock();
        assert_eq!(inner.src.state, TcpState::TimeWait);
        assert_eq!(inner.dst.state, TcpState::TimeWait);
        assert_eq!(inner.timeout, TimeoutClass::TcpClosed);
    }

    #[test]
    fn fin_exchange_walks_closing_states() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = established(&mut rng);
        run(&s, &mut rng, true, TH_FIN | TH_ACK, 1001, 5001, 0).unwrap();
        assert_eq!(s.lock().src.state, TcpState::Closing);
        assert_eq!(s.lock().timeout, TimeoutClass::TcpClosing);
        run(&s, &mut rng, false, TH_FIN | TH_ACK, 5001, 1002, 0).unwrap();
        {
            let inner = s.lock();
            assert_eq!(inner.src.state, TcpState::FinWait2);
            assert_eq!(inner.dst.state, TcpState::Closing);
            assert_eq!(inner.timeout, TimeoutClass::TcpFinWait);
        }
        run(&s, &mut rng, true, TH_ACK, 1002, 5002, 0).unwrap();
        assert_eq!(s.lock().dst.state, TcpState::FinWait2);
        assert_eq!(s.lock().timeout, TimeoutClass::TcpClosed);
    }

    #[test]
    fn bare_syn_on_closed_state_requests_reuse() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = established(&mut rng);
        {
            let mut inner = s.lock();
            inner.src.state = TcpState::TimeWait;
            inner.dst.state = TcpState::FinWait2;
        }
        let out = run(&s, &mut rng, true, TH_SYN, 90_000, 0, 0).unwrap();
        assert_eq!(out, TcpOutcome::Reuse);
        assert!(s.lock().is_unlinked());
    }

    // ── Window scaling ────────────────────────────────────────────

    #[test]
    fn window_scale_requires_both_sides() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut syn = seg(true, TH_SYN, 1000, 0, 0);
        if let Some(th) = syn.tcp.as_mut() {
            th.wscale = Some(7);
        }
        let s = new_state(&mut syn, false, &mut rng);
        assert_eq!(s.lock().src.wscale, PF_WSCALE_FLAG | 7);
        assert_eq!(s.lock().src.max_win, 512);
        // The server answers without the option: scaling is switched off.
        run(&s, &mut rng, false, TH_SYN | TH_ACK, 5000, 1001, 0).unwrap();
        let inner = s.lock();
        assert_eq!(inner.src.wscale, 0);
        assert_eq!(inner.src.max_win, u16::MAX);
        assert_eq!(inner.dst.wscale, 0);
    }

    #[test]
    fn wscale_shift_is_capped_at_fourteen() {
        let th = TcpHeader {
            flags: TH_SYN,
            wscale: Some(20),
            ..TcpHeader::default()
        };
        assert_eq!(wscale_of(&th), PF_WSCALE_FLAG | 14);
        let ack = TcpHeader {
            flags: TH_ACK,
            wscale: Some(3),
            ..TcpHeader::default()
        };
        assert_eq!(wscale_of(&ack), 0);
    }

    // ── Loose acceptance ──────────────────────────────────────────

    #[test]
    fn adopts_mid_stream_connection() {
        let mut rng = StdRng::seed_from_u64(1);
        // State picked up from a non-SYN segment after a flush.
        let mut first = seg(true, TH_ACK, 70_000, 9_000, 100);
        let s = new_state(&mut first, false, &mut rng);
        // The server's segment is accepted loosely while dst is unsynced.
        let out = run(&s, &mut rng, false, TH_ACK, 9_000, 70_100, 100);
        assert_eq!(out, Ok(TcpOutcome::Pass));
        let inner = s.lock();
        assert_eq!(inner.dst.seqlo, 9_100);
        assert_eq!(inner.dst.state, TcpState::SynSent);
    }

    #[test]
    fn loose_match_does_not_refresh_expiry() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut first = seg(true, TH_ACK, 70_000, 9_000, 100);
        let s = new_state(&mut first, false, &mut rng);
        // Beyond seqhi but within one MAXACKWINDOW while dst is unsynced.
        let out = run(&s, &mut rng, true, TH_ACK, 70_100, 9_000, 1_000);
        assert_eq!(out, Ok(TcpOutcome::Pass));
        let inner = s.lock();
        assert_eq!(inner.src.seqlo, 71_100);
        assert_eq!(inner.expire, 0);
        assert_eq!(inner.dst.state, TcpState::Closed);
    }

    #[test]
    fn mutual_syn_sent_mismatch_emits_rst() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut syn = seg(true, TH_SYN, 1000, 0, 0);
        let s = new_state(&mut syn, false, &mut rng);
        // Server SYN without ACK: both sides SYN_SENT.
        run(&s, &mut rng, false, TH_SYN, 5000, 0, 0).unwrap();
        let err = run(&s, &mut rng, true, TH_ACK, 1001 + 5_000_000, 7777, 0).unwrap_err();
        let rst = err.rst.expect("rst");
        assert_eq!(rst.flags, TH_RST);
        assert_eq!(rst.seq, 7777);
        assert_eq!((rst.src, rst.dport), (Addr::v4(SERVER), 1234));
        let inner = s.lock();
        assert_eq!((inner.src.seqlo, inner.src.seqhi, inner.src.max_win), (0, 1, 1));
    }

    // ── Modulation ────────────────────────────────────────────────

    #[test]
    fn modulated_isn_is_hidden_and_restored() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut syn = seg(true, TH_SYN, 1000, 0, 0);
        let s = new_state(&mut syn, true, &mut rng);
        let diff = s.lock().src.seqdiff;
        assert_ne!(diff, 0);
        assert_eq!(syn.tcp.as_ref().unwrap().seq, 1000u32.wrapping_add(diff));
        assert!(syn.checksum_dirty);

        // The server acknowledges the modulated ISN; the ack is demodulated
        // on its way back to the client.
        let mut synack = seg(false, TH_SYN | TH_ACK, 5000, 1001u32.wrapping_add(diff), 0);
        track(&s, &mut s.lock(), &mut synack, Direction::In, &mut rng, 1).unwrap();
        assert_eq!(synack.tcp.as_ref().unwrap().ack, 1001);
    }

    #[test]
    fn sack_edges_are_demodulated() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut syn = seg(true, TH_SYN, 1000, 0, 0);
        let s = new_state(&mut syn, true, &mut rng);
        let diff = s.lock().src.seqdiff;
        let mut synack = seg(false, TH_SYN | TH_ACK, 5000, 1001u32.wrapping_add(diff), 0);
        track(&s, &mut s.lock(), &mut synack, Direction::In, &mut rng, 1).unwrap();

        // The client acknowledges the server's modulated ISN.
        let server_diff = s.lock().dst.seqdiff;
        let mut ack = seg(true, TH_ACK, 1001, 5001u32.wrapping_add(server_diff), 0);
        track(&s, &mut s.lock(), &mut ack, Direction::Out, &mut rng, 1).unwrap();

        // Server SACKs modulated client data.
        let mut sack = seg(false, TH_ACK, 5001, 1001u32.wrapping_add(diff), 0);
        if let Some(th) = sack.tcp.as_mut() {
            th.sack = vec![SackBlock {
                start: 1101u32.wrapping_add(diff),
                end: 1201u32.wrapping_add(diff),
            }];
        }
        track(&s, &mut s.lock(), &mut sack, Direction::In, &mut rng, 1).unwrap();
        let block = sack.tcp.as_ref().unwrap().sack[0];
        assert_eq!((block.start, block.end), (1101, 1201));
    }

    // ── Sloppy ────────────────────────────────────────────────────

    #[test]
    fn sloppy_half_connection_establishes() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut syn = seg(true, TH_SYN, 1000, 0, 0);
        let s = new_state(&mut syn, false, &mut rng);
        s.lock().flags.insert(StateFlags::SLOPPY);
        // Only the client side is visible; its ACK is wildly off-window.
        let out = run(&s, &mut rng, true, TH_ACK, 123_456_789, 42, 0).unwrap();
        assert_eq!(out, TcpOutcome::Pass);
        let inner = s.lock();
        assert_eq!(inner.src.state, TcpState::Established);
        assert_eq!(inner.dst.state, TcpState::Established);
        assert_eq!(inner.timeout, TimeoutClass::TcpEstablished);
    }

    #[test]
    fn sloppy_full_handshake_reports_establishment() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut syn = seg(true, TH_SYN, 1000, 0, 0);
        let s = new_state(&mut syn, false, &mut rng);
        s.lock().flags.insert(StateFlags::SLOPPY);
        let out = run(&s, &mut rng, false, TH_SYN | TH_ACK, 5000, 1001, 0).unwrap();
        assert_eq!(out, TcpOutcome::Pass);
        let out = run(&s, &mut rng, true, TH_ACK, 1001, 5001, 0).unwrap();
        assert_eq!(out, TcpOutcome::Established);
        let inner = s.lock();
        assert_eq!(inner.src.state, TcpState::Established);
        assert_eq!(inner.dst.state, TcpState::Established);
    }

    #[test]
    fn sloppy_rst_closes_both() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = established(&mut rng);
        s.lock().flags.insert(StateFlags::SLOPPY);
        run(&s, &mut rng, false, TH_RST, 1, 0, 0).unwrap();
        let inner = s.lock();
        assert_eq!(inner.src.state, TcpState::TimeWait);
        assert_eq!(inner.timeout, TimeoutClass::TcpClosed);
    }

    #[test]
    fn sequence_comparisons_wrap() {
        assert!(seq_geq(5, u32::MAX - 5));
        assert!(seq_gt(0, u32::MAX));
        assert!(!seq_gt(u32::MAX, 0));
        assert!(seq_geq(7, 7));
    }
}
