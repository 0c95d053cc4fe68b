//! State table plus the bookkeeping that has to change with it: source
//! nodes, rule state counters, limits and the sweep cursor.
//!
//! The engine keeps one `StateStore` behind a `RwLock`. Every method taking
//! `&mut self` is a structural change; per-state fields are still guarded by
//! each state's own lock, which is always taken after the store lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::entity::{Addr, AddressFamily, Direction, Protocol};
use crate::firewall::entity::{FlushScope, IpNetwork, PortOp, Rule};
use crate::firewall::table::TableStore;
use crate::srctrack::engine::SourceTracker;
use crate::srctrack::entity::SrcNodeKind;
use crate::srctrack::error::SourceTrackError;

use super::entity::{Limits, State, StateFlags, StateId, StateKey, TcpState, TimeoutClass, Timeouts};
use super::error::ConnTrackError;
use super::expiry;
use super::table::{StateTable, TableStats};

/// Selects states for `kill_states`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateFilter {
    pub af: Option<AddressFamily>,
    pub proto: Option<Protocol>,
    /// Initiator address.
    pub src: Option<IpNetwork>,
    pub dst: Option<IpNetwork>,
    pub sport: Option<PortOp>,
    pub dport: Option<PortOp>,
    pub interface: Option<String>,
    pub rdomain: Option<u16>,
    /// Exact state id.
    pub id: Option<StateId>,
}

impl StateFilter {
    pub fn matches(&self, state: &State) -> bool {
        if self.id.is_some_and(|id| id != state.id) {
            return false;
        }
        if self
            .interface
            .as_deref()
            .is_some_and(|i| state.kif.as_deref() != Some(i))
        {
            return false;
        }
        state.keys().into_iter().any(|key| self.matches_key(key, state.direction))
    }

    fn matches_key(&self, key: &StateKey, dir: Direction) -> bool {
        let (s, d) = (dir.sidx(), dir.didx());
        self.af.is_none_or(|af| af == key.af)
            && self.proto.is_none_or(|p| p == key.protocol())
            && self.rdomain.is_none_or(|r| r == key.rdomain)
            && self.src.is_none_or(|n| n.contains(key.af, key.addr[s]))
            && self.dst.is_none_or(|n| n.contains(key.af, key.addr[d]))
            && self.sport.is_none_or(|op| op.matches(key.port[s]))
            && self.dport.is_none_or(|op| op.matches(key.port[d]))
    }
}

/// A source went over its connection limits at establishment.
#[derive(Debug)]
pub struct ConnLimitExceeded {
    pub error: SourceTrackError,
    /// States unlinked as a consequence, the offending one first.
    pub removed: Vec<Arc<State>>,
}

/// Work done by one sweep step.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub freed: usize,
    /// States unlinked because their deadline passed.
    pub expired: Vec<Arc<State>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub states: usize,
    /// Unlinked states still waiting for the sweeper.
    pub pending_free: usize,
    pub src_nodes: usize,
    pub limits: Limits,
    pub table: TableStats,
}

#[derive(Debug)]
pub struct StateStore {
    table: StateTable,
    sources: SourceTracker,
    timeouts: Timeouts,
    limits: Limits,
    cursor: Option<StateId>,
    next_id: u64,
    creator: u32,
}

impl StateStore {
    pub fn new(creator: u32, timeouts: Timeouts, limits: Limits) -> Self {
        Self {
            table: StateTable::new(),
            sources: SourceTracker::new(limits.src_nodes),
            timeouts,
            limits,
            cursor: None,
            next_id: 1,
            creator,
        }
    }

    pub fn table(&self) -> &StateTable {
        &self.table
    }

    pub fn sources(&self) -> &SourceTracker {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut SourceTracker {
        &mut self.sources
    }

    /// Split borrow for state construction, which searches the table while
    /// acquiring source nodes.
    pub fn parts_mut(&mut self) -> (&StateTable, &mut SourceTracker) {
        (&self.table, &mut self.sources)
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn creator(&self) -> u32 {
        self.creator
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Reserve the next local state id.
    pub fn next_id(&mut self) -> StateId {
        let id = StateId {
            id: self.next_id,
            creator: self.creator,
        };
        self.next_id += 1;
        id
    }

    pub fn find(&self, key: &StateKey, dir: Direction, ifname: &str) -> Option<Arc<State>> {
        self.table.find(key, dir, ifname)
    }

    pub fn find_by_id(&self, id: &StateId) -> Option<Arc<State>> {
        self.table.find_by_id(id)
    }

    /// Whether a new state may be created for `rule`.
    pub fn check_limits(&self, rule: &Rule) -> Result<(), ConnTrackError> {
        if self.table.len() >= self.limits.states {
            return Err(ConnTrackError::TableFull {
                limit: self.limits.states,
            });
        }
        if rule.max_states > 0 && rule.counters.states() >= u64::from(rule.max_states) {
            return Err(ConnTrackError::TableFull {
                limit: rule.max_states as usize,
            });
        }
        Ok(())
    }

    /// Link a fully built state. Closed TCP states owning the same key are
    /// unlinked and returned.
    pub fn insert(&mut self, state: Arc<State>, now: u64) -> Result<Vec<Arc<State>>, ConnTrackError> {
        self.check_limits(&state.rule)?;
        let plan = self.table.plan_insert(&state)?;
        for old in &plan.replaces {
            debug!(old = %old.id, new = %state.id, "replacing closed state");
            self.unlink(old, now);
        }
        for rule in state.counted_rules() {
            rule.counters.state_created();
        }
        self.table.attach(state);
        Ok(plan.replaces)
    }

    /// Logically remove a state: mark it `PURGE`, detach its keys and drop
    /// its source-node references. The sweeper frees it later.
    pub fn unlink(&mut self, state: &State, now: u64) -> bool {
        let conn_counted = {
            let mut inner = state.lock();
            inner.timeout = TimeoutClass::Purge;
            inner.flags.contains(StateFlags::SRC_CONN)
        };
        if !self.table.detach(state) {
            return false;
        }
        for key in &state.src_nodes {
            let counted = conn_counted && key.kind == SrcNodeKind::Rule;
            self.sources
                .release(key, counted, now, self.timeouts.src_node);
        }
        for rule in state.counted_rules() {
            rule.counters.state_removed();
        }
        true
    }

    /// Scan the next `1 + states / interval` entries of the sweep list.
    pub fn sweep(&mut self, now: u64) -> SweepReport {
        let interval = self.timeouts.interval.max(1) as usize;
        let count = 1 + self.table.sweep_len() / interval;
        let (batch, cursor) = self.table.sweep_batch(self.cursor, count);
        self.cursor = cursor;

        let mut report = SweepReport {
            scanned: batch.len(),
            ..SweepReport::default()
        };
        let states = self.table.len();
        for state in batch {
            let unlinked = state.lock().is_unlinked();
            if !unlinked {
                let deadline = {
                    let inner = state.lock();
                    expiry::deadline(&state, &inner, &self.timeouts, states)
                };
                if deadline > now {
                    continue;
                }
                self.unlink(&state, now);
                report.expired.push(Arc::clone(&state));
            }
            if self.table.free(&state.id).is_some() {
                report.freed += 1;
            }
        }
        if report.freed > 0 {
            debug!(scanned = report.scanned, freed = report.freed, "state sweep");
        }
        report
    }

    /// Reclaim source nodes whose grace period has passed.
    pub fn purge_src_nodes(&mut self, now: u64) -> usize {
        self.sources.purge_expired(now)
    }

    /// Unlink every state the filter selects.
    pub fn kill(&mut self, filter: &StateFilter, now: u64) -> Vec<Arc<State>> {
        let victims: Vec<Arc<State>> = self
            .table
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        for s in &victims {
            self.unlink(s, now);
        }
        victims
    }

    pub fn flush(&mut self, now: u64) -> Vec<Arc<State>> {
        self.kill(&StateFilter::default(), now)
    }

    /// Count a newly established connection against the state's source
    /// node. Over the limit, the state is killed, the source optionally
    /// lands in the overload table and its states are flushed.
    pub fn connlimit(
        &mut self,
        state: &Arc<State>,
        tables: &TableStore,
        now: u64,
    ) -> Result<(), ConnLimitExceeded> {
        let Some(key) = state
            .src_nodes
            .iter()
            .find(|k| k.kind == SrcNodeKind::Rule)
            .copied()
        else {
            return Ok(());
        };
        if self.sources.get(&key).is_none() {
            return Ok(());
        }
        state.lock().flags.insert(StateFlags::SRC_CONN);
        let Err(error) = self.sources.connlimit(&key, &state.rule, now) else {
            return Ok(());
        };

        {
            let mut inner = state.lock();
            inner.src.state = TcpState::Closed;
            inner.dst.state = TcpState::Closed;
        }
        self.unlink(state, now);
        let mut removed = vec![Arc::clone(state)];

        if let Some(ref overload) = state.rule.src_limits.overload {
            let net = IpNetwork::host(key.af, key.addr);
            match tables.add(&overload.table, net) {
                Ok(_) => info!(
                    src = %key.addr.display(key.af),
                    table = %overload.table,
                    "source added to overload table"
                ),
                Err(e) => warn!(table = %overload.table, error = %e, "overload table add failed"),
            }
            if let Some(scope) = overload.flush {
                removed.extend(self.flush_source(&state.rule, scope, key.af, key.addr, now));
            }
        }
        Err(ConnLimitExceeded { error, removed })
    }

    /// Unlink every state initiated by `addr`, limited to `rule` unless the
    /// scope is global. Scans the whole id index.
    fn flush_source(
        &mut self,
        rule: &Arc<Rule>,
        scope: FlushScope,
        af: AddressFamily,
        addr: Addr,
        now: u64,
    ) -> Vec<Arc<State>> {
        let victims: Vec<Arc<State>> = self
            .table
            .iter()
            .filter(|s| {
                let key = initiator_key(s);
                key.af == af
                    && key.addr[s.direction.sidx()] == addr
                    && (scope == FlushScope::Global || Arc::ptr_eq(&s.rule, rule))
            })
            .cloned()
            .collect();
        for s in &victims {
            {
                let mut inner = s.lock();
                inner.src.state = TcpState::Closed;
                inner.dst.state = TcpState::Closed;
            }
            self.unlink(s, now);
        }
        info!(
            src = %addr.display(af),
            killed = victims.len(),
            "overload flush"
        );
        victims
    }

    pub fn set_timeouts(&mut self, timeouts: Timeouts) -> Result<(), ConnTrackError> {
        timeouts.validate()?;
        self.timeouts = timeouts;
        Ok(())
    }

    pub fn set_limits(&mut self, limits: Limits) -> Result<(), ConnTrackError> {
        if limits.states == 0 {
            return Err(ConnTrackError::InvalidLimit {
                name: "states",
                reason: "must be > 0",
            });
        }
        self.limits = limits;
        self.sources.set_limit(limits.src_nodes);
        Ok(())
    }

    /// Seconds until `state` expires.
    pub fn remaining(&self, state: &State, now: u64) -> u64 {
        let inner = state.lock();
        expiry::remaining(state, &inner, &self.timeouts, self.table.len(), now)
    }

    /// Up to `limit` live states in id order.
    pub fn list(&self, limit: usize) -> Vec<Arc<State>> {
        self.table.iter().take(limit).cloned().collect()
    }

    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            states: self.table.len(),
            pending_free: self.table.sweep_len() - self.table.len(),
            src_nodes: self.sources.len(),
            limits: self.limits,
            table: self.table.stats(),
        }
    }
}

/// Key carrying the initiator's untranslated address.
pub fn initiator_key(state: &State) -> &StateKey {
    match state.direction {
        Direction::In => &state.wire,
        Direction::Out => &state.stack,
    }
}
