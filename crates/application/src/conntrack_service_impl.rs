use std::sync::Arc;

use domain::common::error::DomainError;
use domain::conntrack::entity::{Limits, StateId, Timeouts};
use domain::conntrack::snapshot::{self, StateSnapshot, UpdateOutcome};
use domain::conntrack::store::StateFilter;
use domain::srctrack::entity::{SourceNodeView, SrcNodeFilter};

use crate::firewall_engine::{EngineStatus, FirewallEngine};

/// Application-level conntrack service.
///
/// Management operations on the state table and source nodes of a running
/// engine, plus the import side of state replication.
pub struct ConnTrackAppService {
    engine: Arc<FirewallEngine>,
}

impl ConnTrackAppService {
    pub fn new(engine: Arc<FirewallEngine>) -> Self {
        Self { engine }
    }

    /// Remove every state. Returns the count removed.
    pub fn flush_states(&self) -> usize {
        self.kill_states(&StateFilter::default())
    }

    /// Remove the states `filter` selects. Returns the count removed.
    pub fn kill_states(&self, filter: &StateFilter) -> usize {
        let now = self.engine.now();
        let victims = self.engine.write_store().kill(filter, now);
        for state in &victims {
            self.engine.export_delete(state, now);
        }
        if !victims.is_empty() {
            self.engine
                .metrics()
                .record_state_removal("killed", victims.len() as u64);
            tracing::info!(killed = victims.len(), "states killed");
        }
        victims.len()
    }

    /// Forget the source nodes `filter` selects. States keep running but no
    /// longer count against the removed nodes.
    pub fn kill_src_nodes(&self, filter: &SrcNodeFilter) -> usize {
        let killed = self.engine.write_store().sources_mut().kill(filter);
        if killed > 0 {
            tracing::info!(killed, "source nodes killed");
        }
        killed
    }

    /// Snapshots of up to `limit` states in id order.
    pub fn list_states(&self, limit: usize) -> Vec<StateSnapshot> {
        let now = self.engine.now();
        let store = self.engine.read_store();
        store
            .list(limit)
            .iter()
            .map(|s| snapshot::export(&store, s, now))
            .collect()
    }

    pub fn get_state(&self, id: &StateId) -> Result<StateSnapshot, DomainError> {
        let now = self.engine.now();
        let store = self.engine.read_store();
        let state = store
            .find_by_id(id)
            .ok_or_else(|| DomainError::StateNotFound(id.to_string()))?;
        Ok(snapshot::export(&store, &state, now))
    }

    pub fn list_src_nodes(&self) -> Vec<SourceNodeView> {
        let now = self.engine.now();
        self.engine.read_store().sources().views(now)
    }

    pub fn state_count(&self) -> usize {
        self.engine.read_store().len()
    }

    pub fn status(&self) -> EngineStatus {
        self.engine.status()
    }

    pub fn timeouts(&self) -> Timeouts {
        *self.engine.read_store().timeouts()
    }

    pub fn set_timeouts(&self, timeouts: Timeouts) -> Result<(), DomainError> {
        self.engine.write_store().set_timeouts(timeouts)?;
        tracing::info!(interval = timeouts.interval, "timeouts updated");
        Ok(())
    }

    pub fn limits(&self) -> Limits {
        self.engine.read_store().limits()
    }

    pub fn set_limits(&self, limits: Limits) -> Result<(), DomainError> {
        self.engine.write_store().set_limits(limits)?;
        tracing::info!(
            states = limits.states,
            src_nodes = limits.src_nodes,
            "limits updated"
        );
        Ok(())
    }

    // ── Replication ────────────────────────────────────────────────

    /// Insert a state received from a peer. Rule numbers are honoured only
    /// when `peer_checksum` matches the local ruleset.
    pub fn import_state(
        &self,
        snap: &StateSnapshot,
        peer_checksum: u64,
    ) -> Result<StateId, DomainError> {
        let rules = self.engine.ruleset();
        let checksum_ok = rules.checksum() == peer_checksum;
        let now = self.engine.now();
        let state = snapshot::import(
            &mut self.engine.write_store(),
            &rules,
            snap,
            checksum_ok,
            now,
        )?;
        self.engine.metrics().record_state_insert();
        Ok(state.id)
    }

    /// Merge a peer's update into the matching local state.
    pub fn update_state(&self, snap: &StateSnapshot) -> Result<UpdateOutcome, DomainError> {
        let now = self.engine.now();
        let outcome = snapshot::apply_update(&self.engine.read_store(), snap, now)?;
        if outcome == UpdateOutcome::Stale {
            tracing::debug!(state = %snap.state_id(), "peer update is stale");
        }
        Ok(outcome)
    }

    /// Remove a state the peer deleted. Deletions are not re-exported.
    pub fn delete_state(&self, id: &StateId) -> Result<(), DomainError> {
        let now = self.engine.now();
        let mut store = self.engine.write_store();
        let state = store
            .find_by_id(id)
            .ok_or_else(|| DomainError::StateNotFound(id.to_string()))?;
        store.unlink(&state, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use domain::common::entity::{Addr, AddressFamily, Direction, Protocol, Verdict};
    use domain::common::packet::PacketInfo;
    use domain::conntrack::entity::FlowState;
    use domain::firewall::entity::{KeepState, Rule, RuleAction, SourceLimits, SourceTrack};
    use ports::secondary::state_export_port::StateExportPort;
    use ports::test_utils::{ManualClock, NoopMetrics, RecordingExporter};

    use super::*;
    use crate::firewall_engine::EngineConfig;

    const CLIENT: u32 = 0x0A00_0001;
    const SERVER: u32 = 0x5DB8_D822;

    fn engine(creator_id: u32) -> Arc<FirewallEngine> {
        let config = EngineConfig {
            creator_id,
            rng_seed: Some(1),
            ..EngineConfig::default()
        };
        let engine = FirewallEngine::new(config, Arc::new(ManualClock::new(50)), Arc::new(NoopMetrics)).unwrap();
        load(&engine, Rule::default());
        Arc::new(engine)
    }

    fn load(engine: &FirewallEngine, extra: Rule) {
        let rule = Rule {
            action: RuleAction::Pass,
            keep_state: KeepState::Keep,
            proto: Some(Protocol::Udp),
            ..extra
        };
        engine.load_ruleset(vec![rule], vec![], RuleAction::Block).unwrap();
    }

    fn udp(engine: &FirewallEngine, sport: u16) -> domain::firewall::entity::Evaluation {
        let mut pkt = PacketInfo::udp(AddressFamily::Inet, Addr::v4(CLIENT), sport, Addr::v4(SERVER), 53);
        engine.evaluate(AddressFamily::Inet, Direction::Out, "em0", &mut pkt)
    }

    fn udp_reply(engine: &FirewallEngine, dport: u16) -> domain::firewall::entity::Evaluation {
        let mut pkt = PacketInfo::udp(AddressFamily::Inet, Addr::v4(SERVER), 53, Addr::v4(CLIENT), dport);
        engine.evaluate(AddressFamily::Inet, Direction::In, "em0", &mut pkt)
    }

    // ── Kill and flush ────────────────────────────────────────────

    #[test]
    fn kill_by_id_removes_one_state() {
        let engine = engine(1);
        let svc = ConnTrackAppService::new(Arc::clone(&engine));
        let first = udp(&engine, 1000).state.unwrap();
        udp(&engine, 1001);

        let filter = StateFilter {
            id: Some(first),
            ..StateFilter::default()
        };
        assert_eq!(svc.kill_states(&filter), 1);
        assert_eq!(svc.state_count(), 1);
        assert!(svc.get_state(&first).is_err());
    }

    #[test]
    fn flush_exports_every_delete() {
        let exporter = Arc::new(RecordingExporter::default());
        let config = EngineConfig {
            rng_seed: Some(1),
            ..EngineConfig::default()
        };
        let engine = FirewallEngine::new(config, Arc::new(ManualClock::new(50)), Arc::new(NoopMetrics))
            .unwrap()
            .with_exporter(Arc::clone(&exporter) as Arc<dyn StateExportPort>);
        load(&engine, Rule::default());
        let engine = Arc::new(engine);
        let svc = ConnTrackAppService::new(Arc::clone(&engine));
        for port in 1000..1005 {
            udp(&engine, port);
        }

        assert_eq!(svc.flush_states(), 5);
        assert_eq!(svc.state_count(), 0);
        assert_eq!(exporter.deletes(), 5);
        assert_eq!(svc.flush_states(), 0);
    }

    // ── Listing ───────────────────────────────────────────────────

    #[test]
    fn list_and_get_return_snapshots() {
        let engine = engine(1);
        let svc = ConnTrackAppService::new(Arc::clone(&engine));
        for port in 1000..1004 {
            udp(&engine, port);
        }
        let listed = svc.list_states(3);
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|s| s.proto == 17 && s.creator == 1));

        let one = svc.get_state(&listed[0].state_id()).unwrap();
        assert_eq!(one, listed[0]);
    }

    #[test]
    fn source_nodes_can_be_listed_and_killed() {
        let engine = engine(1);
        load(
            &engine,
            Rule {
                src_limits: SourceLimits {
                    track: SourceTrack::Rule,
                    ..SourceLimits::default()
                },
                ..Rule::default()
            },
        );
        let svc = ConnTrackAppService::new(Arc::clone(&engine));
        udp(&engine, 1000);
        udp(&engine, 1001);

        let nodes = svc.list_src_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].states, 2);
        assert_eq!(svc.kill_src_nodes(&SrcNodeFilter::default()), 1);
        assert!(svc.list_src_nodes().is_empty());
        assert_eq!(svc.state_count(), 2);
    }

    // ── Settings ──────────────────────────────────────────────────

    #[test]
    fn timeouts_are_validated() {
        let svc = ConnTrackAppService::new(engine(1));
        let mut timeouts = svc.timeouts();
        timeouts.interval = 0;
        assert!(svc.set_timeouts(timeouts).is_err());

        timeouts.interval = 5;
        svc.set_timeouts(timeouts).unwrap();
        assert_eq!(svc.timeouts().interval, 5);
    }

    #[test]
    fn limits_round_trip() {
        let svc = ConnTrackAppService::new(engine(1));
        let limits = Limits {
            states: 10,
            src_nodes: 2,
        };
        svc.set_limits(limits).unwrap();
        assert_eq!(svc.limits(), limits);
        assert_eq!(svc.status().store.limits, limits);
    }

    // ── Replication ───────────────────────────────────────────────

    #[test]
    fn imported_state_serves_reply_traffic() {
        let a = engine(1);
        let b = engine(2);
        udp(&a, 1000);
        let snap = ConnTrackAppService::new(Arc::clone(&a)).list_states(1).remove(0);

        let peer = ConnTrackAppService::new(Arc::clone(&b));
        let id = peer.import_state(&snap, a.ruleset().checksum()).unwrap();
        assert_eq!(id, snap.state_id());
        assert_eq!(peer.state_count(), 1);
        assert_eq!(peer.get_state(&id).unwrap().rule, Some(0));

        let ev = udp_reply(&b, 1000);
        assert_eq!(ev.verdict, Verdict::Pass);
        assert_eq!(ev.state, Some(id));
    }

    #[test]
    fn update_applies_fresh_and_ignores_stale() {
        let a = engine(1);
        let b = engine(2);
        udp(&a, 1000);
        let snap = ConnTrackAppService::new(Arc::clone(&a)).list_states(1).remove(0);
        let peer = ConnTrackAppService::new(Arc::clone(&b));
        peer.import_state(&snap, a.ruleset().checksum()).unwrap();

        assert_eq!(peer.update_state(&snap).unwrap(), UpdateOutcome::Applied);

        // Reply traffic on the peer moves both flows past the snapshot.
        udp_reply(&b, 1000);
        let local = peer.get_state(&snap.state_id()).unwrap();
        assert_eq!(local.src.flow, FlowState::Multiple);
        assert_eq!(peer.update_state(&snap).unwrap(), UpdateOutcome::Stale);
    }

    #[test]
    fn update_of_unknown_state_fails() {
        let a = engine(1);
        udp(&a, 1000);
        let snap = ConnTrackAppService::new(Arc::clone(&a)).list_states(1).remove(0);
        let peer = ConnTrackAppService::new(engine(2));
        assert!(peer.update_state(&snap).is_err());
    }

    #[test]
    fn peer_delete_removes_without_reexport() {
        let a = engine(1);
        udp(&a, 1000);
        let snap = ConnTrackAppService::new(Arc::clone(&a)).list_states(1).remove(0);

        let exporter = Arc::new(RecordingExporter::default());
        let config = EngineConfig {
            creator_id: 2,
            ..EngineConfig::default()
        };
        let b = FirewallEngine::new(config, Arc::new(ManualClock::new(50)), Arc::new(NoopMetrics))
            .unwrap()
            .with_exporter(Arc::clone(&exporter) as Arc<dyn StateExportPort>);
        load(&b, Rule::default());
        let peer = ConnTrackAppService::new(Arc::new(b));
        peer.import_state(&snap, 0).unwrap();

        peer.delete_state(&snap.state_id()).unwrap();
        assert_eq!(peer.state_count(), 0);
        assert_eq!(exporter.deletes(), 0);
        assert!(peer.delete_state(&snap.state_id()).is_err());
    }
}
