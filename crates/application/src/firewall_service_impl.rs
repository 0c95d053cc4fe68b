use std::sync::Arc;

use domain::common::entity::{Addr, AddressFamily};
use domain::common::error::DomainError;
use domain::firewall::entity::{IpNetwork, Rule, RuleAction, RuleStats};
use domain::firewall::error::FirewallError;
use domain::firewall::table::TableEntry;

use crate::firewall_engine::FirewallEngine;

/// Counters of one loaded rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleReport {
    /// `""` for the main ruleset.
    pub ruleset: String,
    pub nr: u32,
    pub label: Option<String>,
    pub action: RuleAction,
    pub stats: RuleStats,
}

/// Application-level firewall service.
///
/// Ruleset swaps and address-table maintenance on a running engine.
pub struct FirewallAppService {
    engine: Arc<FirewallEngine>,
}

impl FirewallAppService {
    pub fn new(engine: Arc<FirewallEngine>) -> Self {
        Self { engine }
    }

    /// Compile and activate a ruleset. Tables referenced by rules are
    /// created empty if they do not exist yet.
    pub fn load_ruleset(
        &self,
        main: Vec<Rule>,
        anchors: Vec<(String, Vec<Rule>)>,
        default_action: RuleAction,
    ) -> Result<u64, DomainError> {
        for name in referenced_tables(&main, &anchors) {
            self.engine.tables().define(&name);
        }
        self.engine.load_ruleset(main, anchors, default_action)
    }

    /// Return the number of active rules across main and anchors.
    pub fn rule_count(&self) -> usize {
        self.engine.ruleset().rule_count()
    }

    pub fn checksum(&self) -> u64 {
        self.engine.ruleset().checksum()
    }

    /// Counters of every rule, main ruleset first.
    pub fn rule_reports(&self) -> Vec<RuleReport> {
        let rules = self.engine.ruleset();
        rules
            .rulesets()
            .into_iter()
            .flat_map(|rs| {
                rs.rules().iter().map(|r| RuleReport {
                    ruleset: rs.name().to_string(),
                    nr: r.nr,
                    label: r.label.as_ref().map(ToString::to_string),
                    action: r.action,
                    stats: r.counters.snapshot(),
                })
            })
            .collect()
    }

    // ── Tables ─────────────────────────────────────────────────────

    pub fn define_table(&self, name: &str) {
        self.engine.tables().define(name);
    }

    /// Add `net` to table `name`. Returns `false` when already present.
    pub fn add_table_entry(&self, name: &str, net: IpNetwork, neg: bool) -> Result<bool, DomainError> {
        Ok(self.engine.tables().add_entry(name, TableEntry { net, neg })?)
    }

    pub fn delete_table_entry(&self, name: &str, net: IpNetwork) -> Result<bool, DomainError> {
        Ok(self.engine.tables().delete(name, net)?)
    }

    /// Whether `addr` is in table `name`.
    pub fn test_table(&self, name: &str, af: AddressFamily, addr: Addr) -> Result<bool, DomainError> {
        let tables = self.engine.tables();
        if !tables.exists(name) {
            return Err(FirewallError::TableNotFound {
                name: name.to_string(),
            }
            .into());
        }
        Ok(tables.contains(name, af, addr))
    }

    pub fn flush_table(&self, name: &str) -> Result<usize, DomainError> {
        Ok(self.engine.tables().flush(name)?)
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.engine.tables().names()
    }

    pub fn table_entries(&self, name: &str) -> Option<Vec<TableEntry>> {
        self.engine.tables().get(name).map(|t| t.entries().to_vec())
    }
}

fn referenced_tables(main: &[Rule], anchors: &[(String, Vec<Rule>)]) -> Vec<String> {
    use domain::firewall::entity::AddrMatch;

    main.iter()
        .chain(anchors.iter().flat_map(|(_, rules)| rules.iter()))
        .flat_map(|r| {
            let overload = r.src_limits.overload.as_ref().map(|o| o.table.clone());
            [&r.src.addr, &r.dst.addr]
                .into_iter()
                .filter_map(|m| match m {
                    AddrMatch::Table(name) => Some(name.clone()),
                    _ => None,
                })
                .chain(overload)
                .collect::<Vec<_>>()
        })
        .collect()
}
