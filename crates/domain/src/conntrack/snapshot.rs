//! Replication records.
//!
//! A [`StateSnapshot`] is the fixed-layout image of a state exchanged with
//! peers of a replication group. Families, directions and timeout classes
//! travel as their numeric codes so that a record from an unknown peer can
//! be rejected instead of failing to decode.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::entity::{Addr, AddressFamily, Direction, Protocol};
use crate::firewall::engine::{DEFAULT_RULE_NR, RuleEngine};
use crate::firewall::entity::Rule;

use super::entity::{
    Peer, State, StateFlags, StateId, StateInner, StateKey, TcpState, TimeoutClass,
};
use super::error::ConnTrackError;
use super::expiry;
use super::store::StateStore;
use super::tcp::seq_gt;

/// Interface name carried by floating states.
pub const IFNAME_ANY: &str = "any";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub addr: [Addr; 2],
    pub port: [u16; 2],
    pub rdomain: u16,
    /// 0 means "same as the state".
    pub af: u8,
}

impl KeySnapshot {
    fn from_key(key: &StateKey) -> Self {
        Self {
            addr: key.addr,
            port: key.port,
            rdomain: key.rdomain,
            af: key.af.to_u8(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: u64,
    pub creator: u32,
    pub ifname: String,
    /// Wire key, then stack key.
    pub key: [KeySnapshot; 2],
    pub af: u8,
    pub proto: u8,
    pub direction: u8,
    pub src: Peer,
    pub dst: Peer,
    pub rule: Option<u32>,
    pub anchor: Option<u32>,
    pub nat_rule: Option<u32>,
    /// Seconds since creation.
    pub creation: u64,
    /// Seconds left before expiry.
    pub expire: u64,
    pub timeout: u8,
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub state_flags: u16,
    pub log: bool,
}

impl StateSnapshot {
    pub fn state_id(&self) -> StateId {
        StateId {
            id: self.id,
            creator: self.creator,
        }
    }
}

fn rule_nr(rule: &Rule) -> Option<u32> {
    (rule.nr != DEFAULT_RULE_NR).then_some(rule.nr)
}

/// Image of `state` as of `now`.
pub fn export(store: &StateStore, state: &State, now: u64) -> StateSnapshot {
    let inner = state.lock();
    let expire = expiry::remaining(state, &inner, store.timeouts(), store.len(), now);
    capture(state, &inner, expire, now)
}

fn capture(state: &State, inner: &StateInner, expire: u64, now: u64) -> StateSnapshot {
    StateSnapshot {
        id: state.id.id,
        creator: state.id.creator,
        ifname: state.kif.clone().unwrap_or_else(|| IFNAME_ANY.to_string()),
        key: [
            KeySnapshot::from_key(&state.wire),
            KeySnapshot::from_key(&state.stack),
        ],
        af: state.af().to_u8(),
        proto: state.wire.proto,
        direction: state.direction.to_u8(),
        src: inner.src,
        dst: inner.dst,
        rule: rule_nr(&state.rule),
        anchor: state.anchor.as_deref().and_then(rule_nr),
        nat_rule: state.nat_rule.as_deref().and_then(rule_nr),
        creation: now.saturating_sub(state.creation),
        expire,
        timeout: inner.timeout.to_u8(),
        packets: inner.packets,
        bytes: inner.bytes,
        state_flags: inner.flags.0,
        log: state.log,
    }
}

fn invalid(reason: impl Into<String>) -> ConnTrackError {
    ConnTrackError::InvalidSnapshot {
        reason: reason.into(),
    }
}

fn decode_key(snap: &KeySnapshot, af: AddressFamily, proto: u8) -> Result<StateKey, ConnTrackError> {
    let af = match snap.af {
        0 => af,
        code => AddressFamily::from_u8(code).ok_or_else(|| invalid(format!("key af {code}")))?,
    };
    Ok(StateKey {
        proto,
        af,
        addr: snap.addr,
        port: snap.port,
        rdomain: snap.rdomain,
    })
}

/// Only live classes travel; `Purge` marks a local unlink and would leave a
/// linked state the sweeper never frees.
fn decode_timeout(code: u8) -> Result<TimeoutClass, ConnTrackError> {
    match TimeoutClass::from_u8(code) {
        Some(TimeoutClass::Purge) | None => Err(invalid(format!("timeout class {code}"))),
        Some(class) => Ok(class),
    }
}

/// Rebuild a replicated state and link it.
///
/// Rule numbers are only trusted when `checksum_ok` says both peers run the
/// same ruleset and the rule lives in the main ruleset; otherwise the state
/// hangs off the default rule.
pub fn import(
    store: &mut StateStore,
    rules: &RuleEngine,
    snap: &StateSnapshot,
    checksum_ok: bool,
    now: u64,
) -> Result<Arc<State>, ConnTrackError> {
    if snap.creator == 0 {
        return Err(invalid("creator id 0"));
    }
    let af = AddressFamily::from_u8(snap.af).ok_or_else(|| invalid(format!("af {}", snap.af)))?;
    let direction = Direction::from_u8(snap.direction)
        .ok_or_else(|| invalid(format!("direction {}", snap.direction)))?;
    let timeout = decode_timeout(snap.timeout)?;

    let rule = match snap.rule {
        Some(nr) if snap.anchor.is_none() && checksum_ok => rules.main().get(nr).cloned(),
        _ => None,
    }
    .unwrap_or_else(|| Arc::clone(rules.default_rule()));

    let wire = decode_key(&snap.key[0], af, snap.proto)?;
    let mut stack = decode_key(&snap.key[1], af, snap.proto)?;
    if stack.af != wire.af {
        stack.proto = match Protocol::from_u8(snap.proto) {
            Protocol::Icmp => Protocol::Icmpv6.to_u8(),
            Protocol::Icmpv6 => Protocol::Icmp.to_u8(),
            other => other.to_u8(),
        };
    }
    let wire = Arc::new(wire);
    let stack = if stack == *wire {
        Arc::clone(&wire)
    } else {
        Arc::new(stack)
    };

    // The exporter may have scaled the remaining time adaptively; keep the
    // same deadline under the local timeout.
    let mut expire = now;
    if snap.expire != 0 {
        let base = match rule.timeouts.get(timeout) {
            0 => store.timeouts().get(timeout),
            t => t,
        };
        expire = expire.saturating_sub(u64::from(base).saturating_sub(snap.expire));
    }

    let kif = (snap.ifname != IFNAME_ANY && !snap.ifname.is_empty()).then(|| snap.ifname.clone());
    let mut state = State::new(
        snap.state_id(),
        wire,
        stack,
        kif,
        direction,
        rule,
        now.saturating_sub(snap.creation),
        StateInner {
            src: snap.src,
            dst: snap.dst,
            timeout,
            expire,
            packets: snap.packets,
            bytes: snap.bytes,
            flags: StateFlags(snap.state_flags & !StateFlags::SRC_CONN),
        },
    );
    state.log = snap.log;

    let state = Arc::new(state);
    store.insert(Arc::clone(&state), now)?;
    debug!(state = %state.id, key = %state.wire, "state imported");
    Ok(state)
}

/// Result of applying a peer's update to a local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The local copy is ahead on at least one peer; the caller should
    /// re-announce it.
    Stale,
}

/// Merge a replicated update into the local state with the same id.
/// Peers never move backwards, except out of the SYN-proxy phases.
pub fn apply_update(
    store: &StateStore,
    snap: &StateSnapshot,
    now: u64,
) -> Result<UpdateOutcome, ConnTrackError> {
    let timeout = decode_timeout(snap.timeout)?;
    let id = snap.state_id();
    let state = store
        .find_by_id(&id)
        .ok_or_else(|| ConnTrackError::StateNotFound { id: id.to_string() })?;

    let mut inner = state.lock();
    let mut stale = 0;
    if state.protocol() == Protocol::Tcp {
        let src = &inner.src;
        if (src.state > snap.src.state
            && (src.state < TcpState::ProxySrc || snap.src.state >= TcpState::ProxySrc))
            || (src.state == snap.src.state && seq_gt(src.seqlo, snap.src.seqlo))
        {
            stale += 1;
        } else {
            inner.src = snap.src;
        }
        let dst = &inner.dst;
        if dst.state > snap.dst.state
            || (dst.state >= TcpState::SynSent && seq_gt(dst.seqlo, snap.dst.seqlo))
        {
            stale += 1;
        } else {
            inner.dst = snap.dst;
        }
    } else {
        if inner.src.flow > snap.src.flow {
            stale += 1;
        } else {
            inner.src = snap.src;
        }
        if inner.dst.flow > snap.dst.flow {
            stale += 1;
        } else {
            inner.dst = snap.dst;
        }
    }
    if stale < 2 {
        inner.expire = now;
        inner.timeout = timeout;
    }
    Ok(if stale > 0 {
        UpdateOutcome::Stale
    } else {
        UpdateOutcome::Applied
    })
}
