//! Filter ruleset configuration structs and conversion logic.

use std::collections::BTreeMap;
use std::sync::Arc;

use domain::common::entity::{Direction, RuleId};
use domain::conntrack::entity::TimeoutClass;
use domain::firewall::entity::{
    AddrMatch, AddrSpec, ConnRate, FlushScope, KeepState, Overload, PortOp, Rule, RuleAction,
    RuleTimeouts, SourceLimits, SourceTrack,
};
use domain::firewall::table::TableEntry;
use serde::{Deserialize, Serialize};

use super::common::{
    ConfigError, MAX_RULES, MAX_TABLE_ENTRIES, check_limit, parse_af, parse_cidr, parse_flags,
    parse_port_op, parse_protocol,
};
use super::nat::{AfToConfig, PoolConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallConfig {
    /// Action when no rule matches.
    #[serde(default = "default_action")]
    pub default_action: String,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    #[serde(default)]
    pub anchors: Vec<AnchorConfig>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            default_action: default_action(),
            rules: Vec::new(),
            anchors: Vec::new(),
        }
    }
}

fn default_action() -> String {
    "pass".to_string()
}

/// Domain-ready ruleset: main rules, named anchors, default action.
pub type CompiledRules = (Vec<Rule>, Vec<(String, Vec<Rule>)>, RuleAction);

impl FirewallConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        self.to_domain().map(|_| ())
    }

    /// Convert every rule. Fails on the first invalid rule with a field
    /// path such as `firewall.anchors[1].rules[3].from.port`.
    pub fn to_domain(&self) -> Result<CompiledRules, ConfigError> {
        let default = parse_action(&self.default_action)
            .ok()
            .filter(|a| *a != RuleAction::Match)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "firewall.default_action".to_string(),
                value: self.default_action.clone(),
                expected: "pass, block".to_string(),
            })?;

        let main = convert_rules(&self.rules, "firewall.rules")?;

        let mut anchors: Vec<(String, Vec<Rule>)> = Vec::with_capacity(self.anchors.len());
        for (i, anchor) in self.anchors.iter().enumerate() {
            let prefix = format!("firewall.anchors[{i}]");
            if anchor.name.is_empty() {
                return Err(ConfigError::validation(
                    format!("{prefix}.name"),
                    "anchor name must not be empty",
                ));
            }
            if anchors.iter().any(|(n, _)| *n == anchor.name) {
                return Err(ConfigError::validation(
                    format!("{prefix}.name"),
                    format!("duplicate anchor '{}'", anchor.name),
                ));
            }
            let rules = convert_rules(&anchor.rules, &format!("{prefix}.rules"))?;
            anchors.push((anchor.name.clone(), rules));
        }

        Ok((main, anchors, default))
    }
}

fn convert_rules(rules: &[RuleConfig], prefix: &str) -> Result<Vec<Rule>, ConfigError> {
    check_limit(prefix, rules.len(), MAX_RULES)?;
    rules
        .iter()
        .enumerate()
        .map(|(i, r)| r.to_domain_rule(&format!("{prefix}[{i}]")))
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnchorConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

// ── Rule config (YAML-friendly) ────────────────────────────────────

/// One filter rule. Field names follow pf's grammar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleConfig {
    /// `pass`, `block`, `match`. Omitted only on anchor calls.
    pub action: Option<String>,
    pub label: Option<String>,
    /// `in`, `out`; both when omitted.
    pub direction: Option<String>,
    pub quick: bool,
    pub log: bool,
    /// Answer blocked packets with RST or ICMP unreachable.
    #[serde(rename = "return")]
    pub block_return: bool,
    pub allow_opts: bool,
    /// Interface name; `!em0` matches every other interface.
    pub interface: Option<String>,
    pub rdomain: Option<u16>,
    pub af: Option<String>,
    pub proto: Option<String>,
    pub from: EndpointConfig,
    pub to: EndpointConfig,
    /// `S/SA`, `any` or a bare flag set.
    pub flags: Option<String>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
    pub tag: Option<String>,
    pub tagged: Option<String>,
    /// `keep`, `modulate`, `synproxy`, `none`. Pass rules keep state
    /// unless told otherwise.
    pub state: Option<String>,
    pub sloppy: bool,
    pub if_bound: bool,
    pub no_sync: bool,
    /// Per-rule overrides, keyed by timeout name (`tcp.established`,
    /// `adaptive.start`, ...).
    pub timeouts: BTreeMap<String, u32>,
    pub max_states: u32,
    pub source: SourceConfig,
    pub nat_to: Option<PoolConfig>,
    pub rdr_to: Option<PoolConfig>,
    pub binat_to: Option<PoolConfig>,
    pub af_to: Option<AfToConfig>,
    pub divert_to: Option<u16>,
    /// Evaluate the named anchor at this position.
    pub anchor: Option<String>,
}

/// `from` / `to` endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    /// `any`, a CIDR, or `<table>`; a leading `!` negates.
    pub address: Option<String>,
    pub port: Option<PortConfig>,
}

/// A port written either as a bare number or as an expression string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    Number(u16),
    Expr(String),
}

impl PortConfig {
    pub fn to_port_op(&self) -> Result<PortOp, ConfigError> {
        match self {
            Self::Number(p) => Ok(PortOp::Eq(*p)),
            Self::Expr(s) => parse_port_op(s),
        }
    }
}

/// Source tracking options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// `rule` or `global`. Implied `rule` when any limit is set.
    pub track: Option<String>,
    pub max_src_nodes: u32,
    pub max_src_states: u32,
    pub max_src_conn: u32,
    /// `N/S`: at most N new connections per S seconds.
    pub max_src_conn_rate: Option<String>,
    pub overload: Option<String>,
    /// `rule` or `global`.
    pub flush: Option<String>,
}

impl RuleConfig {
    /// Convert to a domain `Rule`; `prefix` names the rule in errors.
    pub fn to_domain_rule(&self, prefix: &str) -> Result<Rule, ConfigError> {
        let field = |name: &str| format!("{prefix}.{name}");
        let invalid = |name: &str, value: &str, expected: &str| ConfigError::InvalidValue {
            field: field(name),
            value: value.to_string(),
            expected: expected.to_string(),
        };

        let action = match (&self.action, &self.anchor) {
            (Some(a), _) => {
                parse_action(a).map_err(|()| invalid("action", a, "pass, block, match"))?
            }
            (None, Some(_)) => RuleAction::Pass,
            (None, None) => {
                return Err(ConfigError::validation(field("action"), "action is required"));
            }
        };

        let direction = self
            .direction
            .as_deref()
            .map(|d| match d.to_lowercase().as_str() {
                "in" => Ok(Direction::In),
                "out" => Ok(Direction::Out),
                _ => Err(invalid("direction", d, "in, out")),
            })
            .transpose()?;

        let (interface, ifnot) = match self.interface.as_deref() {
            Some(name) => match name.strip_prefix('!') {
                Some(rest) => (Some(rest.to_string()), true),
                None => (Some(name.to_string()), false),
            },
            None => (None, false),
        };
        if interface.as_deref() == Some("") {
            return Err(ConfigError::validation(field("interface"), "empty interface name"));
        }

        let af = self
            .af
            .as_deref()
            .map(|s| parse_af(s).map_err(|()| invalid("af", s, "inet, inet6")))
            .transpose()?;
        let proto = self
            .proto
            .as_deref()
            .map(|s| parse_protocol(s).map_err(|()| invalid("proto", s, "tcp, udp, icmp, icmp6, 0-255")))
            .transpose()?;

        let (flags, flagset) = match self.flags.as_deref() {
            None | Some("any") => (0, 0),
            Some(s) => parse_flags(s).map_err(|m| ConfigError::validation(field("flags"), m))?,
        };

        let keep_state = match self.state.as_deref() {
            Some(s) => parse_keep_state(s).map_err(|()| invalid("state", s, "keep, modulate, synproxy, none"))?,
            None if action == RuleAction::Pass && self.anchor.is_none() => KeepState::Keep,
            None => KeepState::None,
        };

        let mut timeouts = RuleTimeouts::default();
        for (name, &secs) in &self.timeouts {
            match name.as_str() {
                "adaptive.start" => timeouts.adaptive_start = secs,
                "adaptive.end" => timeouts.adaptive_end = secs,
                other => {
                    let class = TimeoutClass::from_name(other)
                        .ok_or_else(|| invalid("timeouts", other, "a timeout name such as tcp.established"))?;
                    timeouts.set(class, secs);
                }
            }
        }

        let pool = |cfg: &Option<PoolConfig>, name: &str| {
            cfg.as_ref()
                .map(|p| p.to_domain_pool(&field(name)).map(Arc::new))
                .transpose()
        };

        let rule = Rule {
            label: self.label.clone().map(RuleId),
            action,
            direction,
            quick: self.quick,
            log: self.log,
            block_return: self.block_return,
            allow_opts: self.allow_opts,
            interface,
            ifnot,
            onrdomain: self.rdomain,
            af,
            proto,
            src: self.from.to_domain(&field("from"))?,
            dst: self.to.to_domain(&field("to"))?,
            flags,
            flagset,
            icmp_type: self.icmp_type,
            icmp_code: self.icmp_code,
            tag: self.tag.clone(),
            tagged: self.tagged.clone(),
            keep_state,
            sloppy: self.sloppy,
            if_bound: self.if_bound,
            no_sync: self.no_sync,
            timeouts,
            max_states: self.max_states,
            src_limits: self.source.to_domain(&field("source"))?,
            nat: pool(&self.nat_to, "nat_to")?,
            rdr: pool(&self.rdr_to, "rdr_to")?,
            binat: pool(&self.binat_to, "binat_to")?,
            af_to: self
                .af_to
                .as_ref()
                .map(|a| a.to_domain(&field("af_to")).map(Arc::new))
                .transpose()?,
            divert_port: self.divert_to,
            anchor: self.anchor.clone(),
            ..Rule::default()
        };

        rule.validate()
            .map_err(|e| ConfigError::validation(prefix, e.to_string()))?;
        Ok(rule)
    }
}

impl EndpointConfig {
    fn to_domain(&self, prefix: &str) -> Result<AddrSpec, ConfigError> {
        let mut spec = AddrSpec::default();
        if let Some(ref raw) = self.address {
            let (neg, addr) = match raw.trim().strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, raw.trim()),
            };
            spec.neg = neg;
            spec.addr = if addr == "any" {
                AddrMatch::Any
            } else if let Some(name) = addr.strip_prefix('<').and_then(|a| a.strip_suffix('>')) {
                if name.is_empty() {
                    return Err(ConfigError::validation(
                        format!("{prefix}.address"),
                        "empty table name",
                    ));
                }
                AddrMatch::Table(name.to_string())
            } else {
                AddrMatch::Network(parse_cidr(addr)?)
            };
        }
        spec.port = self.port.as_ref().map(PortConfig::to_port_op).transpose()?;
        Ok(spec)
    }
}

impl SourceConfig {
    fn to_domain(&self, prefix: &str) -> Result<SourceLimits, ConfigError> {
        let rate = self
            .max_src_conn_rate
            .as_deref()
            .map(|s| {
                parse_conn_rate(s).ok_or_else(|| ConfigError::InvalidValue {
                    field: format!("{prefix}.max_src_conn_rate"),
                    value: s.to_string(),
                    expected: "N/seconds".to_string(),
                })
            })
            .transpose()?;

        let flush = self
            .flush
            .as_deref()
            .map(|s| match s {
                "rule" => Ok(FlushScope::Rule),
                "global" => Ok(FlushScope::Global),
                _ => Err(ConfigError::InvalidValue {
                    field: format!("{prefix}.flush"),
                    value: s.to_string(),
                    expected: "rule, global".to_string(),
                }),
            })
            .transpose()?;
        if flush.is_some() && self.overload.is_none() {
            return Err(ConfigError::validation(
                format!("{prefix}.flush"),
                "flush requires an overload table",
            ));
        }

        let mut limits = SourceLimits {
            track: SourceTrack::None,
            max_src_nodes: self.max_src_nodes,
            max_src_states: self.max_src_states,
            max_src_conn: self.max_src_conn,
            max_src_conn_rate: rate,
            overload: self.overload.clone().map(|table| Overload { table, flush }),
        };
        limits.track = match self.track.as_deref() {
            Some("rule") => SourceTrack::Rule,
            Some("global") => SourceTrack::Global,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: format!("{prefix}.track"),
                    value: other.to_string(),
                    expected: "rule, global".to_string(),
                });
            }
            None if limits.tracking() => SourceTrack::Rule,
            None => SourceTrack::None,
        };
        Ok(limits)
    }
}

fn parse_action(s: &str) -> Result<RuleAction, ()> {
    match s.to_lowercase().as_str() {
        "pass" => Ok(RuleAction::Pass),
        "block" => Ok(RuleAction::Block),
        "match" => Ok(RuleAction::Match),
        _ => Err(()),
    }
}

fn parse_keep_state(s: &str) -> Result<KeepState, ()> {
    match s.to_lowercase().as_str() {
        "none" | "no" => Ok(KeepState::None),
        "keep" => Ok(KeepState::Keep),
        "modulate" => Ok(KeepState::Modulate),
        "synproxy" => Ok(KeepState::Synproxy),
        _ => Err(()),
    }
}

fn parse_conn_rate(s: &str) -> Option<ConnRate> {
    let (limit, seconds) = s.split_once('/')?;
    let limit = limit.trim().parse().ok()?;
    let seconds = seconds.trim().parse().ok()?;
    (limit > 0 && seconds > 0).then_some(ConnRate { limit, seconds })
}

// ── Tables ─────────────────────────────────────────────────────────

/// A named address table and its initial entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    /// CIDR strings; a leading `!` marks an exception.
    #[serde(default)]
    pub entries: Vec<String>,
}

impl TableConfig {
    pub fn to_entries(&self, prefix: &str) -> Result<Vec<TableEntry>, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::validation(
                format!("{prefix}.name"),
                "table name must not be empty",
            ));
        }
        check_limit(&format!("{prefix}.entries"), self.entries.len(), MAX_TABLE_ENTRIES)?;
        self.entries
            .iter()
            .map(|e| {
                let (neg, cidr) = match e.trim().strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, e.trim()),
                };
                Ok(TableEntry {
                    net: parse_cidr(cidr)?,
                    neg,
                })
            })
            .collect()
    }
}
