use serde::Serialize;

use domain::common::entity::{Addr, AddressFamily, Direction, DropReason, Protocol, Verdict};
use domain::conntrack::entity::StateId;

/// One logged packet, as handed to the log sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketLogRecord {
    pub verdict: Verdict,
    pub reason: Option<DropReason>,
    pub direction: Direction,
    pub ifname: String,
    /// Number of the deciding rule; `None` for the default rule.
    pub rule: Option<u32>,
    pub anchor: Option<String>,
    pub ruleset: String,
    pub af: AddressFamily,
    pub proto: Protocol,
    pub src: Addr,
    pub sport: u16,
    pub dst: Addr,
    pub dport: u16,
    pub state: Option<StateId>,
}

/// Secondary port receiving packets matched by `log` rules.
pub trait PacketLogPort: Send + Sync {
    fn log(&self, record: &PacketLogRecord);
}
