use domain::common::error::DomainError;
use domain::conntrack::snapshot::StateSnapshot;

/// Answer of the exporter to a newly created state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportAck {
    Sent,
    /// Hold the packet that created the state until the peer has it.
    Defer,
}

/// Secondary port for state replication.
///
/// Called for every state not flagged `no-sync`. Implementations must not
/// block; the engine calls them on the packet path.
pub trait StateExportPort: Send + Sync {
    fn on_insert(&self, snapshot: &StateSnapshot) -> Result<ExportAck, DomainError>;

    fn on_update(&self, snapshot: &StateSnapshot) -> Result<(), DomainError>;

    fn on_delete(&self, snapshot: &StateSnapshot) -> Result<(), DomainError>;
}
