use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::common::entity::{Addr, AddressFamily};
use crate::firewall::entity::{Rule, SourceTrack};

use super::entity::{SourceNode, SourceNodeView, SrcNodeFilter, SrcNodeKey, SrcNodeKind, Threshold};
use super::error::SourceTrackError;

/// Result of [`SourceTracker::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    pub key: SrcNodeKey,
    /// The node did not exist before; [`SourceTracker::abort`] removes it.
    pub created: bool,
}

/// Per-source accounting table.
///
/// Nodes are reference counted by states. A node whose count drops to zero
/// lingers for the source-node grace period and is then reclaimed by
/// [`purge_expired`](Self::purge_expired).
#[derive(Debug)]
pub struct SourceTracker {
    nodes: BTreeMap<SrcNodeKey, SourceNode>,
    limit: usize,
}

impl SourceTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            nodes: BTreeMap::new(),
            limit,
        }
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, key: &SrcNodeKey) -> Option<&SourceNode> {
        self.nodes.get(key)
    }

    /// Node identity for `addr` under `rule`. Filter nodes are shared across
    /// rules only with `source-track global`; sticky nodes are always private.
    pub fn key_for(rule: &Rule, kind: SrcNodeKind, af: AddressFamily, addr: Addr) -> SrcNodeKey {
        let rule_uid = match kind {
            SrcNodeKind::Rule if rule.src_limits.track == SourceTrack::Global => None,
            _ => Some(rule.uid),
        };
        SrcNodeKey {
            rule_uid,
            kind,
            af,
            addr,
        }
    }

    /// Take a state reference on the node for `addr`, creating it if needed.
    ///
    /// For filter nodes the rule's per-source limits are checked first; a
    /// refused acquisition leaves the table untouched.
    pub fn acquire(
        &mut self,
        rule: &Arc<Rule>,
        kind: SrcNodeKind,
        af: AddressFamily,
        addr: Addr,
        now: u64,
    ) -> Result<Acquired, SourceTrackError> {
        let key = Self::key_for(rule, kind, af, addr);
        let limits = &rule.src_limits;

        if let Some(node) = self.nodes.get_mut(&key) {
            if kind == SrcNodeKind::Rule {
                if limits.max_src_states > 0 && node.states >= limits.max_src_states {
                    return Err(SourceTrackError::TooManyStates {
                        limit: limits.max_src_states,
                    });
                }
                if limits.max_src_conn > 0 && node.conn >= limits.max_src_conn {
                    return Err(SourceTrackError::TooManyConnections {
                        limit: limits.max_src_conn,
                    });
                }
                if node.conn_rate.exceeded() {
                    return Err(SourceTrackError::ConnRateExceeded);
                }
            }
            node.states += 1;
            node.expire = 0;
            return Ok(Acquired {
                key,
                created: false,
            });
        }

        if limits.max_src_nodes > 0
            && rule.counters.src_nodes.load(std::sync::atomic::Ordering::Relaxed)
                >= u64::from(limits.max_src_nodes)
        {
            return Err(SourceTrackError::TooManyNodes {
                limit: limits.max_src_nodes,
            });
        }
        if self.nodes.len() >= self.limit {
            return Err(SourceTrackError::TableFull { limit: self.limit });
        }

        let conn_rate = limits
            .max_src_conn_rate
            .map_or_else(Threshold::default, |r| Threshold::new(r.limit, r.seconds));
        rule.counters.src_node_created();
        self.nodes.insert(
            key,
            SourceNode {
                key,
                rule: Arc::clone(rule),
                states: 1,
                conn: 0,
                conn_rate,
                creation: now,
                expire: 0,
                raddr: None,
            },
        );
        Ok(Acquired { key, created: true })
    }

    /// Undo an [`acquire`](Self::acquire) whose state never made it into the table.
    pub fn abort(&mut self, acquired: Acquired, now: u64, grace: u32) {
        if acquired.created {
            if let Some(node) = self.nodes.remove(&acquired.key) {
                node.rule.counters.src_node_removed();
            }
        } else {
            self.release(&acquired.key, false, now, grace);
        }
    }

    /// Drop one state reference. `conn_counted` also releases the
    /// established-connection slot the state held.
    pub fn release(&mut self, key: &SrcNodeKey, conn_counted: bool, now: u64, grace: u32) {
        let Some(node) = self.nodes.get_mut(key) else {
            return;
        };
        if conn_counted {
            node.conn = node.conn.saturating_sub(1);
        }
        node.states = node.states.saturating_sub(1);
        if node.states == 0 {
            node.expire = now.saturating_add(u64::from(grace)).max(1);
        }
    }

    /// Account a newly established connection.
    ///
    /// Returns the violated limit when the source went over `max-src-conn` or
    /// its connection rate; the caller handles overload.
    pub fn connlimit(
        &mut self,
        key: &SrcNodeKey,
        rule: &Rule,
        now: u64,
    ) -> Result<(), SourceTrackError> {
        let Some(node) = self.nodes.get_mut(key) else {
            return Ok(());
        };
        node.conn += 1;
        node.conn_rate.add(now);

        let limits = &rule.src_limits;
        if limits.max_src_conn > 0 && node.conn > limits.max_src_conn {
            debug!(src = %key, conn = node.conn, limit = limits.max_src_conn, "max-src-conn exceeded");
            return Err(SourceTrackError::TooManyConnections {
                limit: limits.max_src_conn,
            });
        }
        if node.conn_rate.exceeded() {
            debug!(src = %key, "max-src-conn-rate exceeded");
            return Err(SourceTrackError::ConnRateExceeded);
        }
        Ok(())
    }

    /// Remembered sticky address for `addr`, if any.
    pub fn sticky(
        &self,
        rule: &Rule,
        kind: SrcNodeKind,
        af: AddressFamily,
        addr: Addr,
    ) -> Option<Addr> {
        let key = Self::key_for(rule, kind, af, addr);
        self.nodes.get(&key).and_then(|n| n.raddr)
    }

    pub fn set_sticky(&mut self, key: &SrcNodeKey, raddr: Addr) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.raddr = Some(raddr);
        }
    }

    /// Reclaim unreferenced nodes whose grace period has passed.
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| {
            let expired = node.states == 0 && node.expire != 0 && node.expire <= now;
            if expired {
                node.rule.counters.src_node_removed();
            }
            !expired
        });
        before - self.nodes.len()
    }

    /// Remove every node the filter selects, referenced or not.
    pub fn kill(&mut self, filter: &SrcNodeFilter) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| {
            let hit = filter.matches(node);
            if hit {
                node.rule.counters.src_node_removed();
            }
            !hit
        });
        before - self.nodes.len()
    }

    pub fn views(&self, now: u64) -> Vec<SourceNodeView> {
        self.nodes.values().map(|n| n.view(now)).collect()
    }
}

impl Default for SourceTracker {
    fn default() -> Self {
        Self::new(crate::conntrack::entity::Limits::default().src_nodes)
    }
}
