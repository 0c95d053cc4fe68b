use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::entity::{Addr, AddressFamily};
use crate::firewall::entity::Rule;

/// Fixed-point factor applied to threshold counts.
pub const THRESHOLD_MULT: u64 = 1000;

/// Sliding-window rate counter (`max-src-conn-rate N/seconds`).
///
/// `count` decays linearly with elapsed time before each increment and is
/// reset once a full interval has passed without activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    pub limit: u64,
    pub seconds: u32,
    pub count: u64,
    pub last: u64,
}

impl Threshold {
    pub fn new(limit: u32, seconds: u32) -> Self {
        Self {
            limit: u64::from(limit) * THRESHOLD_MULT,
            seconds,
            count: 0,
            last: 0,
        }
    }

    pub fn is_set(&self) -> bool {
        self.limit > 0 && self.seconds > 0
    }

    pub fn add(&mut self, now: u64) {
        let diff = now.saturating_sub(self.last);
        let seconds = u64::from(self.seconds);
        if seconds == 0 || diff >= seconds {
            self.count = 0;
        } else {
            self.count -= self.count * diff / seconds;
        }
        self.count += THRESHOLD_MULT;
        self.last = now;
    }

    pub fn exceeded(&self) -> bool {
        self.is_set() && self.count > self.limit
    }
}

/// What a source node accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrcNodeKind {
    /// Filter-rule limits (`max-src-*`).
    Rule,
    /// Sticky `nat-to` binding.
    Nat,
    /// Sticky `rdr-to` binding.
    Rdr,
}

impl SrcNodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Nat => "nat",
            Self::Rdr => "rdr",
        }
    }
}

/// Identity of a source node. `rule_uid` is `None` for globally shared nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SrcNodeKey {
    pub rule_uid: Option<u64>,
    pub kind: SrcNodeKind,
    pub af: AddressFamily,
    pub addr: Addr,
}

impl std::fmt::Display for SrcNodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.addr.display(self.af))?;
        if let Some(uid) = self.rule_uid {
            write!(f, " rule {uid:#x}")?;
        }
        Ok(())
    }
}

/// Per-source accounting entry.
#[derive(Debug, Clone)]
pub struct SourceNode {
    pub key: SrcNodeKey,
    /// Rule that created the node; its `src_nodes` counter holds this node.
    pub rule: Arc<Rule>,
    /// Live states referencing the node.
    pub states: u32,
    /// Established TCP connections.
    pub conn: u32,
    pub conn_rate: Threshold,
    pub creation: u64,
    /// Reclaim deadline once `states` dropped to zero; 0 while in use.
    pub expire: u64,
    /// Translated address remembered for `sticky-address` pools.
    pub raddr: Option<Addr>,
}

impl SourceNode {
    pub fn view(&self, now: u64) -> SourceNodeView {
        SourceNodeView {
            key: self.key,
            rule_nr: self.rule.nr,
            states: self.states,
            conn: self.conn,
            conn_rate: self.conn_rate.count / THRESHOLD_MULT,
            age: now.saturating_sub(self.creation),
            expires_in: (self.expire != 0).then(|| self.expire.saturating_sub(now)),
            raddr: self.raddr,
        }
    }
}

/// Serialisable summary of a [`SourceNode`] for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceNodeView {
    pub key: SrcNodeKey,
    pub rule_nr: u32,
    pub states: u32,
    pub conn: u32,
    pub conn_rate: u64,
    pub age: u64,
    pub expires_in: Option<u64>,
    pub raddr: Option<Addr>,
}

/// Filter for killing source nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcNodeFilter {
    #[serde(default)]
    pub src: Option<crate::firewall::entity::IpNetwork>,
    /// Matches the remembered sticky address.
    #[serde(default)]
    pub dst: Option<crate::firewall::entity::IpNetwork>,
}

impl SrcNodeFilter {
    pub fn matches(&self, node: &SourceNode) -> bool {
        let src_ok = self
            .src
            .is_none_or(|net| net.contains(node.key.af, node.key.addr));
        let dst_ok = self.dst.is_none_or(|net| {
            node.raddr
                .is_some_and(|raddr| net.contains(node.key.af, raddr))
        });
        src_ok && dst_ok
    }
}
