use std::sync::atomic::{AtomicU64, Ordering};

use domain::common::error::DomainError;
use domain::conntrack::snapshot::StateSnapshot;
use ports::secondary::state_export_port::{ExportAck, StateExportPort};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Replication event as it leaves the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "state", rename_all = "snake_case")]
pub enum StateEvent {
    Insert(StateSnapshot),
    Update(StateSnapshot),
    Delete(StateSnapshot),
}

/// State exporter feeding a bounded channel.
///
/// The engine calls it on the packet path, so it never waits: a full
/// channel drops the event and reports an error the engine logs.
pub struct ChannelExporter {
    tx: mpsc::Sender<StateEvent>,
    defer_inserts: bool,
    dropped: AtomicU64,
}

impl ChannelExporter {
    /// Returns the exporter and the receiving end for the transport task.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StateEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                defer_inserts: false,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Ask the engine to hold a state's first packet until the insert
    /// has been handed to the transport.
    #[must_use]
    pub fn with_deferred_inserts(mut self) -> Self {
        self.defer_inserts = true;
        self
    }

    /// Events lost to a full or closed channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, event: StateEvent) -> Result<(), DomainError> {
        self.tx.try_send(event).map_err(|e| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let why = match e {
                TrySendError::Full(_) => "export channel full",
                TrySendError::Closed(_) => "export channel closed",
            };
            DomainError::EngineError(why.to_string())
        })
    }
}

impl StateExportPort for ChannelExporter {
    fn on_insert(&self, snapshot: &StateSnapshot) -> Result<ExportAck, DomainError> {
        self.send(StateEvent::Insert(snapshot.clone()))?;
        Ok(if self.defer_inserts {
            ExportAck::Defer
        } else {
            ExportAck::Sent
        })
    }

    fn on_update(&self, snapshot: &StateSnapshot) -> Result<(), DomainError> {
        self.send(StateEvent::Update(snapshot.clone()))
    }

    fn on_delete(&self, snapshot: &StateSnapshot) -> Result<(), DomainError> {
        self.send(StateEvent::Delete(snapshot.clone()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use domain::common::entity::{Addr, Direction};
    use domain::conntrack::entity::Peer;
    use domain::conntrack::snapshot::{IFNAME_ANY, KeySnapshot};

    pub(crate) fn snapshot(id: u64) -> StateSnapshot {
        let key = KeySnapshot {
            addr: [Addr::v4(0x0A00_0001), Addr::v4(0x0A00_0002)],
            port: [5353, 53],
            rdomain: 0,
            af: 2,
        };
        StateSnapshot {
            id,
            creator: 1,
            ifname: IFNAME_ANY.to_string(),
            key: [key, key],
            af: 2,
            proto: 17,
            direction: Direction::Out.to_u8(),
            src: Peer::default(),
            dst: Peer::default(),
            rule: Some(0),
            anchor: None,
            nat_rule: None,
            creation: 0,
            expire: 60,
            timeout: 6,
            packets: [1, 0],
            bytes: [60, 0],
            state_flags: 0,
            log: false,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (exporter, mut rx) = ChannelExporter::new(8);
        assert_eq!(exporter.on_insert(&snapshot(1)).unwrap(), ExportAck::Sent);
        exporter.on_update(&snapshot(1)).unwrap();
        exporter.on_delete(&snapshot(1)).unwrap();

        assert!(matches!(rx.recv().await, Some(StateEvent::Insert(s)) if s.id == 1));
        assert!(matches!(rx.recv().await, Some(StateEvent::Update(_))));
        assert!(matches!(rx.recv().await, Some(StateEvent::Delete(_))));
    }

    #[tokio::test]
    async fn deferred_inserts_ask_the_engine_to_hold() {
        let (exporter, _rx) = ChannelExporter::new(8);
        let exporter = exporter.with_deferred_inserts();
        assert_eq!(exporter.on_insert(&snapshot(2)).unwrap(), ExportAck::Defer);
    }

    #[test]
    fn full_channel_drops_and_reports() {
        let (exporter, _rx) = ChannelExporter::new(1);
        exporter.on_update(&snapshot(1)).unwrap();
        assert!(exporter.on_update(&snapshot(2)).is_err());
        assert_eq!(exporter.dropped(), 1);
    }

    #[test]
    fn closed_channel_is_an_error() {
        let (exporter, rx) = ChannelExporter::new(4);
        drop(rx);
        assert!(exporter.on_insert(&snapshot(1)).is_err());
    }
}
