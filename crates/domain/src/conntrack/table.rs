use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::common::entity::{Direction, Protocol};

use super::entity::{State, StateId, StateKey, TcpState};
use super::error::ConnTrackError;

/// Search, insert and removal counters.
#[derive(Debug, Default)]
pub struct TableCounters {
    pub searches: AtomicU64,
    pub inserts: AtomicU64,
    pub removals: AtomicU64,
}

/// Point-in-time copy of [`TableCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableStats {
    pub searches: u64,
    pub inserts: u64,
    pub removals: u64,
}

/// Outcome of a successful insertion pre-check.
#[derive(Debug, Default)]
pub struct InsertPlan {
    /// Closed TCP states the new state replaces; the caller unlinks them.
    pub replaces: Vec<Arc<State>>,
}

/// Dual-index connection table.
///
/// `keys` maps every wire and stack key to the ids of the states that own
/// it, interface-bound states first. `ids` holds the live states; `sweep`
/// additionally keeps unlinked states until the sweeper frees them.
#[derive(Debug, Default)]
pub struct StateTable {
    keys: BTreeMap<Arc<StateKey>, Vec<StateId>>,
    ids: BTreeMap<StateId, Arc<State>>,
    sweep: BTreeMap<StateId, Arc<State>>,
    counters: TableCounters,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live states.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Live plus unlinked-but-not-freed states.
    pub fn sweep_len(&self) -> usize {
        self.sweep.len()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            searches: self.counters.searches.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            removals: self.counters.removals.load(Ordering::Relaxed),
        }
    }

    /// Check whether `state` can be attached. Nothing is modified.
    ///
    /// A key already owned by a state on the same interface and in the same
    /// direction is a collision, unless both peers of that TCP state reached
    /// `FinWait2`, in which case the old state is scheduled for replacement.
    pub fn plan_insert(&self, state: &State) -> Result<InsertPlan, ConnTrackError> {
        if self.ids.contains_key(&state.id) {
            return Err(ConnTrackError::Collision {
                key: state.id.to_string(),
            });
        }

        let mut plan = InsertPlan::default();
        let keys = state.keys();
        let keys = if state.is_translated() {
            &keys[..]
        } else {
            &keys[..1]
        };

        for key in keys {
            let key: &StateKey = key;
            let Some(owners) = self.keys.get(key) else {
                continue;
            };
            for id in owners {
                let Some(other) = self.ids.get(id) else {
                    continue;
                };
                if !same_slot(other, state, key) {
                    continue;
                }
                let inner = other.lock();
                let closed = key.protocol() == Protocol::Tcp
                    && inner.src.state >= TcpState::FinWait2
                    && inner.dst.state >= TcpState::FinWait2;
                drop(inner);
                if !closed {
                    debug!(key = %key, existing = %other.id, "state insert collision");
                    return Err(ConnTrackError::Collision {
                        key: key.to_string(),
                    });
                }
                if !plan.replaces.iter().any(|s| Arc::ptr_eq(s, other)) {
                    plan.replaces.push(Arc::clone(other));
                }
                break;
            }
        }
        Ok(plan)
    }

    /// Link `state` under its keys and id. Call [`plan_insert`](Self::plan_insert)
    /// first and unlink whatever it asked to replace.
    pub fn attach(&mut self, state: Arc<State>) {
        let bound = state.kif.is_some();
        let mut keys = vec![Arc::clone(&state.wire)];
        if state.is_translated() {
            keys.push(Arc::clone(&state.stack));
        }
        for key in keys {
            let owners = self.keys.entry(key).or_default();
            if bound {
                owners.insert(0, state.id);
            } else {
                owners.push(state.id);
            }
        }
        self.ids.insert(state.id, Arc::clone(&state));
        self.sweep.insert(state.id, state);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Find the state a packet travelling in `dir` on `ifname` belongs to.
    ///
    /// Inbound packets must match the state's wire key and outbound packets
    /// its stack key; states translating the address family accept either
    /// key inbound.
    pub fn find(&self, key: &StateKey, dir: Direction, ifname: &str) -> Option<Arc<State>> {
        self.counters.searches.fetch_add(1, Ordering::Relaxed);
        let owners = self.keys.get(key)?;
        owners
            .iter()
            .filter_map(|id| self.ids.get(id))
            .find(|s| {
                if s.kif.as_deref().is_some_and(|k| k != ifname) {
                    return false;
                }
                if s.wire.af == s.stack.af {
                    let expected = match dir {
                        Direction::In => &s.wire,
                        Direction::Out => &s.stack,
                    };
                    **expected == *key
                } else {
                    dir == Direction::In && (*s.wire == *key || *s.stack == *key)
                }
            })
            .cloned()
    }

    /// Any live state owning `key`, regardless of interface or direction.
    pub fn key_in_use(&self, key: &StateKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn find_by_id(&self, id: &StateId) -> Option<Arc<State>> {
        self.ids.get(id).cloned()
    }

    /// Remove `state` from both indices. It stays on the sweep list until
    /// [`free`](Self::free). Returns `false` if it was not linked.
    pub fn detach(&mut self, state: &State) -> bool {
        if self.ids.remove(&state.id).is_none() {
            return false;
        }
        for key in state.keys() {
            let key: &StateKey = key;
            if let Some(owners) = self.keys.get_mut(key) {
                owners.retain(|id| *id != state.id);
                if owners.is_empty() {
                    self.keys.remove(key);
                }
            }
        }
        self.counters.removals.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drop the table's last reference to an unlinked state.
    pub fn free(&mut self, id: &StateId) -> Option<Arc<State>> {
        if self.ids.contains_key(id) {
            return None;
        }
        self.sweep.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<State>> {
        self.ids.values()
    }

    /// Up to `count` entries of the sweep list following `cursor`, wrapping
    /// around. Returns the batch and the cursor for the next call.
    pub fn sweep_batch(
        &self,
        cursor: Option<StateId>,
        count: usize,
    ) -> (Vec<Arc<State>>, Option<StateId>) {
        let count = count.min(self.sweep.len());
        let start = cursor.map_or(Bound::Unbounded, Bound::Excluded);
        let batch: Vec<Arc<State>> = self
            .sweep
            .range((start, Bound::Unbounded))
            .chain(self.sweep.range(..))
            .take(count)
            .map(|(_, s)| Arc::clone(s))
            .collect();
        let next = batch.last().map(|s| s.id).or(cursor);
        (batch, next)
    }
}

/// Whether `other` and `new` compete for `key` on the same interface.
fn same_slot(other: &State, new: &State, key: &StateKey) -> bool {
    if other.kif != new.kif {
        return false;
    }
    (other.wire.af == key.af && other.direction == new.direction)
        || (other.wire.af != other.stack.af
            && key.af == other.stack.af
            && other.direction != new.direction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::entity::{Addr, AddressFamily};
    use crate::conntrack::entity::{Peer, StateFlags, StateInner, TimeoutClass};
    use crate::firewall::entity::Rule;

    fn key(sport: u16) -> StateKey {
        StateKey::for_packet(
            Direction::Out,
            AddressFamily::Inet,
            Protocol::Tcp,
            Addr::v4(0x0A00_0001),
            sport,
            Addr::v4(0x5DB8_D822),
            80,
            0,
        )
    }

    fn state(id: u64, wire: StateKey, stack: Option<StateKey>, kif: Option<&str>) -> Arc<State> {
        let wire = Arc::new(wire);
        let stack = stack.map_or_else(|| Arc::clone(&wire), Arc::new);
        Arc::new(State::new(
            StateId { id, creator: 1 },
            wire,
            stack,
            kif.map(str::to_string),
            Direction::Out,
            Arc::new(Rule::default()),
            0,
            StateInner {
                src: Peer::default(),
                dst: Peer::default(),
                timeout: TimeoutClass::TcpFirstPacket,
                expire: 0,
                packets: [0; 2],
                bytes: [0; 2],
                flags: StateFlags::default(),
            },
        ))
    }

    fn insert(t: &mut StateTable, s: &Arc<State>) -> Result<InsertPlan, ConnTrackError> {
        let plan = t.plan_insert(s)?;
        for old in &plan.replaces {
            t.detach(old);
        }
        t.attach(Arc::clone(s));
        Ok(plan)
    }

    #[test]
    fn insert_and_find_by_direction() {
        let mut t = StateTable::new();
        let s = state(1, key(1234), None, None);
        insert(&mut t, &s).unwrap();
        assert_eq!(t.len(), 1);
        assert!(t.find(&key(1234), Direction::Out, "em0").is_some());
        assert!(t.find(&key(1234), Direction::In, "em0").is_some());
        assert!(t.find(&key(1235), Direction::Out, "em0").is_none());
        assert_eq!(t.stats().searches, 3);
    }

    #[test]
    fn translated_state_matches_wire_inbound_and_stack_outbound() {
        let mut t = StateTable::new();
        let s = state(1, key(50001), Some(key(1234)), None);
        insert(&mut t, &s).unwrap();
        assert_eq!(t.key_count(), 2);
        assert!(t.find(&key(50001), Direction::In, "em0").is_some());
        assert!(t.find(&key(50001), Direction::Out, "em0").is_none());
        assert!(t.find(&key(1234), Direction::Out, "em0").is_some());
        assert!(t.find(&key(1234), Direction::In, "em0").is_none());
    }

    #[test]
    fn bound_state_only_matches_its_interface() {
        let mut t = StateTable::new();
        let s = state(1, key(1), None, Some("em1"));
        insert(&mut t, &s).unwrap();
        assert!(t.find(&key(1), Direction::Out, "em0").is_none());
        assert!(t.find(&key(1), Direction::Out, "em1").is_some());
    }

    #[test]
    fn bound_states_precede_floating() {
        let mut t = StateTable::new();
        let floating = state(1, key(1), None, None);
        let bound = state(2, key(1), None, Some("em0"));
        insert(&mut t, &floating).unwrap();
        insert(&mut t, &bound).unwrap();
        let found = t.find(&key(1), Direction::Out, "em0").unwrap();
        assert_eq!(found.id.id, 2);
        let found = t.find(&key(1), Direction::Out, "em1").unwrap();
        assert_eq!(found.id.id, 1);
    }

    #[test]
    fn collision_on_same_interface_and_direction() {
        let mut t = StateTable::new();
        insert(&mut t, &state(1, key(1), None, None)).unwrap();
        let err = insert(&mut t, &state(2, key(1), None, None)).unwrap_err();
        assert!(matches!(err, ConnTrackError::Collision { .. }));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn collision_checks_both_keys_before_linking() {
        let mut t = StateTable::new();
        insert(&mut t, &state(1, key(2), None, None)).unwrap();
        let s = state(2, key(1), Some(key(2)), None);
        assert!(insert(&mut t, &s).is_err());
        assert!(!t.key_in_use(&key(1)));
    }

    #[test]
    fn closed_tcp_state_is_replaced() {
        let mut t = StateTable::new();
        let old = state(1, key(1), None, None);
        {
            let mut inner = old.lock();
            inner.src.state = TcpState::TimeWait;
            inner.dst.state = TcpState::FinWait2;
        }
        insert(&mut t, &old).unwrap();
        let plan = insert(&mut t, &state(2, key(1), None, None)).unwrap();
        assert_eq!(plan.replaces.len(), 1);
        assert_eq!(t.len(), 1);
        assert_eq!(t.find(&key(1), Direction::Out, "em0").unwrap().id.id, 2);
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut t = StateTable::new();
        insert(&mut t, &state(1, key(1), None, None)).unwrap();
        assert!(insert(&mut t, &state(1, key(2), None, None)).is_err());
    }

    #[test]
    fn detach_keeps_sweep_entry_until_free() {
        let mut t = StateTable::new();
        let s = state(1, key(1), None, None);
        insert(&mut t, &s).unwrap();
        assert!(t.detach(&s));
        assert!(!t.detach(&s));
        assert_eq!(t.len(), 0);
        assert_eq!(t.key_count(), 0);
        assert_eq!(t.sweep_len(), 1);
        assert!(t.free(&s.id).is_some());
        assert_eq!(t.sweep_len(), 0);
    }

    #[test]
    fn free_refuses_linked_state() {
        let mut t = StateTable::new();
        let s = state(1, key(1), None, None);
        insert(&mut t, &s).unwrap();
        assert!(t.free(&s.id).is_none());
    }

    #[test]
    fn sweep_batch_wraps_around() {
        let mut t = StateTable::new();
        for i in 1..=5 {
            insert(&mut t, &state(i, key(i as u16), None, None)).unwrap();
        }
        let (batch, cursor) = t.sweep_batch(None, 3);
        assert_eq!(batch.iter().map(|s| s.id.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        let (batch, cursor) = t.sweep_batch(cursor, 3);
        assert_eq!(batch.iter().map(|s| s.id.id).collect::<Vec<_>>(), vec![4, 5, 1]);
        assert_eq!(cursor.map(|c| c.id), Some(1));
        let (batch, _) = t.sweep_batch(cursor, 10);
        assert_eq!(batch.len(), 5);
    }
}
