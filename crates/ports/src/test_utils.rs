use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use domain::common::entity::{Addr, AddressFamily};
use domain::common::error::DomainError;
use domain::common::packet::{ChecksumStatus, PacketInfo};
use domain::conntrack::snapshot::StateSnapshot;

use crate::secondary::address_pool_port::AddressPoolPort;
use crate::secondary::checksum_port::ChecksumPort;
use crate::secondary::clock_port::ClockPort;
use crate::secondary::metrics_port::{PacketMetrics, RulesetMetrics, StateMetrics, SweepMetrics};
use crate::secondary::packet_log_port::{PacketLogPort, PacketLogRecord};
use crate::secondary::state_export_port::{ExportAck, StateExportPort};

/// No-op implementation of all metrics sub-traits for use in tests.
///
/// All methods inherit the default no-op implementations from the sub-traits.
pub struct NoopMetrics;

impl PacketMetrics for NoopMetrics {}
impl StateMetrics for NoopMetrics {}
impl SweepMetrics for NoopMetrics {}
impl RulesetMetrics for NoopMetrics {}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::SeqCst);
    }
}

impl ClockPort for ManualClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Address pool backed by a fixed list of `(ifname, af, addr)`.
#[derive(Debug, Default)]
pub struct FixedPool(pub Vec<(String, AddressFamily, Addr)>);

impl AddressPoolPort for FixedPool {
    fn interface_address(&self, ifname: &str, af: AddressFamily) -> Option<Addr> {
        self.0
            .iter()
            .find(|(name, a, _)| name == ifname && *a == af)
            .map(|(_, _, addr)| *addr)
    }
}

/// Trusts the classifier's checksum verdict and marks rewrites as fixed.
pub struct TrustChecksum;

impl ChecksumPort for TrustChecksum {
    fn verify(&self, pkt: &PacketInfo) -> bool {
        pkt.checksum != ChecksumStatus::Bad
    }

    fn recompute(&self, pkt: &mut PacketInfo) {
        pkt.checksum_dirty = false;
        pkt.checksum = ChecksumStatus::Good;
    }
}

/// Export event captured by [`RecordingExporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportEvent {
    Insert(StateSnapshot),
    Update(StateSnapshot),
    Delete(StateSnapshot),
}

/// Exporter that stores every call, optionally asking for deferral.
#[derive(Debug, Default)]
pub struct RecordingExporter {
    pub events: Mutex<Vec<ExportEvent>>,
    pub defer: AtomicBool,
}

impl RecordingExporter {
    pub fn events(&self) -> Vec<ExportEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn inserts(&self) -> usize {
        self.count(|e| matches!(e, ExportEvent::Insert(_)))
    }

    pub fn updates(&self) -> usize {
        self.count(|e| matches!(e, ExportEvent::Update(_)))
    }

    pub fn deletes(&self) -> usize {
        self.count(|e| matches!(e, ExportEvent::Delete(_)))
    }

    fn count(&self, f: impl Fn(&ExportEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| f(e)).count()
    }
}

impl StateExportPort for RecordingExporter {
    fn on_insert(&self, snapshot: &StateSnapshot) -> Result<ExportAck, DomainError> {
        self.events
            .lock()
            .unwrap()
            .push(ExportEvent::Insert(snapshot.clone()));
        if self.defer.load(Ordering::SeqCst) {
            Ok(ExportAck::Defer)
        } else {
            Ok(ExportAck::Sent)
        }
    }

    fn on_update(&self, snapshot: &StateSnapshot) -> Result<(), DomainError> {
        self.events
            .lock()
            .unwrap()
            .push(ExportEvent::Update(snapshot.clone()));
        Ok(())
    }

    fn on_delete(&self, snapshot: &StateSnapshot) -> Result<(), DomainError> {
        self.events
            .lock()
            .unwrap()
            .push(ExportEvent::Delete(snapshot.clone()));
        Ok(())
    }
}

/// Packet log sink that keeps every record.
#[derive(Debug, Default)]
pub struct RecordingLog(pub Mutex<Vec<PacketLogRecord>>);

impl RecordingLog {
    pub fn records(&self) -> Vec<PacketLogRecord> {
        self.0.lock().unwrap().clone()
    }
}

impl PacketLogPort for RecordingLog {
    fn log(&self, record: &PacketLogRecord) {
        self.0.lock().unwrap().push(record.clone());
    }
}
