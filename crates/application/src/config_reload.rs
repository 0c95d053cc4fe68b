use std::sync::Arc;

use domain::common::error::DomainError;
use domain::conntrack::entity::{Limits, Timeouts};
use domain::firewall::entity::{Rule, RuleAction};
use domain::firewall::table::TableEntry;
use tokio::sync::Mutex;

use crate::conntrack_service_impl::ConnTrackAppService;
use crate::firewall_engine::FirewallEngine;
use crate::firewall_service_impl::FirewallAppService;

/// Everything a configuration file contributes to a running engine.
#[derive(Debug, Clone, Default)]
pub struct ReloadPlan {
    pub main: Vec<Rule>,
    pub anchors: Vec<(String, Vec<Rule>)>,
    pub default_action: RuleAction,
    pub tables: Vec<(String, Vec<TableEntry>)>,
    pub timeouts: Timeouts,
    pub limits: Limits,
}

/// Application-level service for hot-reloading configuration.
///
/// Wraps reload logic with serialization (one reload at a time),
/// metrics recording, and structured logging. A plan is checked in full
/// before anything is applied, so a rejected plan leaves the engine as it
/// was.
pub struct ConfigReloadService {
    engine: Arc<FirewallEngine>,
    firewall: FirewallAppService,
    conntrack: ConnTrackAppService,
    reload_mutex: Mutex<()>,
}

impl ConfigReloadService {
    pub fn new(engine: Arc<FirewallEngine>) -> Self {
        Self {
            firewall: FirewallAppService::new(Arc::clone(&engine)),
            conntrack: ConnTrackAppService::new(Arc::clone(&engine)),
            engine,
            reload_mutex: Mutex::new(()),
        }
    }

    /// Apply `plan`. Returns the new ruleset generation.
    ///
    /// Configured tables have their contents replaced. Tables the plan does
    /// not name (overload targets, tables filled at runtime) are left alone.
    pub async fn reload(&self, plan: ReloadPlan) -> Result<u64, DomainError> {
        let _guard = self.reload_mutex.lock().await;

        if let Err(e) = precheck(&plan) {
            self.engine.metrics().record_config_reload("failure");
            tracing::warn!(error = %e, "configuration reload rejected");
            return Err(e);
        }

        let ReloadPlan {
            main,
            anchors,
            default_action,
            tables,
            timeouts,
            limits,
        } = plan;

        // Tables first so the new rules never see a half-filled table.
        let table_count = tables.len();
        for (name, entries) in tables {
            self.firewall.define_table(&name);
            self.firewall.flush_table(&name)?;
            for entry in entries {
                self.firewall.add_table_entry(&name, entry.net, entry.neg)?;
            }
        }

        let generation = match self.firewall.load_ruleset(main, anchors, default_action) {
            Ok(generation) => generation,
            Err(e) => {
                tracing::warn!(error = %e, "ruleset reload failed, previous ruleset kept");
                return Err(e);
            }
        };

        self.conntrack.set_timeouts(timeouts)?;
        self.conntrack.set_limits(limits)?;

        tracing::info!(
            generation,
            tables = table_count,
            rules = self.firewall.rule_count(),
            "configuration reloaded"
        );
        Ok(generation)
    }

    pub fn firewall(&self) -> &FirewallAppService {
        &self.firewall
    }

    pub fn conntrack(&self) -> &ConnTrackAppService {
        &self.conntrack
    }
}

fn precheck(plan: &ReloadPlan) -> Result<(), DomainError> {
    plan.timeouts.validate()?;
    if plan.limits.states == 0 {
        return Err(DomainError::InvalidConfig("limits.states must be > 0".to_string()));
    }
    for (name, entries) in &plan.tables {
        if name.is_empty() {
            return Err(DomainError::InvalidConfig("table name must not be empty".to_string()));
        }
        for entry in entries {
            entry.net.validate()?;
        }
    }
    let rules = plan
        .main
        .iter()
        .chain(plan.anchors.iter().flat_map(|(_, rules)| rules.iter()));
    for rule in rules {
        rule.validate()?;
    }
    Ok(())
}
