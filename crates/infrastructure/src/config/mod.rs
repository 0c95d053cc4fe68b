//! Agent configuration: structs, parsing, and validation.
//!
//! The config module is split across several sub-modules:
//! - `common`: shared helpers and `ConfigError`
//! - `firewall`: rules, anchors and address tables
//! - `nat`: translation pools
//! - `conntrack`: global timeouts and limits

mod common;
mod conntrack;
mod firewall;
mod nat;

// ── Public re-exports ─────────────────────────────────────────────

pub use common::{ConfigError, parse_addr, parse_cidr, parse_port_op};
pub use conntrack::{LimitsConfig, TimeoutsConfig};
pub use firewall::{
    AnchorConfig, CompiledRules, EndpointConfig, FirewallConfig, PortConfig, RuleConfig,
    SourceConfig, TableConfig,
};
pub use nat::{AfToConfig, PoolConfig};

use std::path::Path;

use domain::common::entity::{Addr, AddressFamily};
use domain::conntrack::entity::{Limits, Timeouts};
use domain::firewall::table::TableEntry;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BIND_ADDRESS, DEFAULT_CREATOR_ID, DEFAULT_METRICS_PORT};
use common::{MAX_ANCHORS, MAX_TABLES, check_limit, warn_if_world_readable};

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub agent: AgentInfo,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub tables: Vec<TableConfig>,

    #[serde(default)]
    pub firewall: FirewallConfig,
}

impl AgentConfig {
    /// Load config from a YAML file.
    ///
    /// On Unix, logs a warning if the config file is world-readable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        warn_if_world_readable(path, "config file");
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config after deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.interfaces.is_empty() {
            return Err(ConfigError::validation(
                "agent.interfaces",
                "at least one interface is required",
            ));
        }
        if self.agent.export_path.as_deref() == Some("") {
            return Err(ConfigError::validation(
                "agent.export_path",
                "must not be empty when set",
            ));
        }
        if self.agent.creator_id == 0 {
            return Err(ConfigError::validation("agent.creator_id", "must be non-zero"));
        }
        for (idx, a) in self.agent.addresses.iter().enumerate() {
            a.to_domain(idx)?;
        }

        // ── Security: enforce count limits ──────────────────────
        check_limit("tables", self.tables.len(), MAX_TABLES)?;
        check_limit("firewall.anchors", self.firewall.anchors.len(), MAX_ANCHORS)?;

        let mut names = std::collections::HashSet::new();
        for (idx, table) in self.tables.iter().enumerate() {
            table.to_entries(&format!("tables[{idx}]"))?;
            if !names.insert(table.name.as_str()) {
                return Err(ConfigError::validation(
                    format!("tables[{idx}].name"),
                    format!("duplicate table '{}'", table.name),
                ));
            }
        }

        self.timeouts.to_domain()?;
        self.limits.to_domain()?;
        self.firewall.validate()
    }

    // ── Domain conversions ──────────────────────────────────────

    /// Main rules, anchors and default action, ready for the engine.
    pub fn firewall_rules(&self) -> Result<CompiledRules, ConfigError> {
        self.firewall.to_domain()
    }

    pub fn timeouts(&self) -> Result<Timeouts, ConfigError> {
        self.timeouts.to_domain()
    }

    pub fn limits(&self) -> Result<Limits, ConfigError> {
        self.limits.to_domain()
    }

    /// Tables and their initial entries.
    pub fn tables(&self) -> Result<Vec<(String, Vec<TableEntry>)>, ConfigError> {
        self.tables
            .iter()
            .enumerate()
            .map(|(idx, t)| Ok((t.name.clone(), t.to_entries(&format!("tables[{idx}]"))?)))
            .collect()
    }

    /// Static interface addresses for dynamic pool entries.
    pub fn interface_addresses(&self) -> Result<Vec<(String, AddressFamily, Addr)>, ConfigError> {
        self.agent
            .addresses
            .iter()
            .enumerate()
            .map(|(idx, a)| a.to_domain(idx))
            .collect()
    }
}

// ── Agent section ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentInfo {
    pub interfaces: Vec<String>,

    /// Stamped on every local state; peers use it to tell states apart.
    #[serde(default = "default_creator_id")]
    pub creator_id: u32,

    /// Fixed RNG seed for reproducible replays.
    #[serde(default)]
    pub rng_seed: Option<u64>,

    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Port of the metrics and status endpoint. `0` disables it.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// File that receives replication events as JSON lines.
    #[serde(default)]
    pub export_path: Option<String>,

    /// Drop packets whose checksum the classifier did not verify.
    #[serde(default)]
    pub strict_checksum: bool,

    /// Addresses of local interfaces, used when a pool names an interface.
    #[serde(default)]
    pub addresses: Vec<InterfaceAddressConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceAddressConfig {
    pub interface: String,
    pub address: String,
}

impl InterfaceAddressConfig {
    fn to_domain(&self, idx: usize) -> Result<(String, AddressFamily, Addr), ConfigError> {
        if self.interface.is_empty() {
            return Err(ConfigError::validation(
                format!("agent.addresses[{idx}].interface"),
                "interface name must not be empty",
            ));
        }
        let (af, addr) = parse_addr(&self.address)?;
        Ok((self.interface.clone(), af, addr))
    }
}

fn default_creator_id() -> u32 {
    DEFAULT_CREATOR_ID
}
fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_log_format() -> LogFormat {
    LogFormat::Json
}
fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}
fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

// ── Log level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(format!(
                "invalid log level '{s}': expected error|warn|info|debug|trace"
            )),
        }
    }
}

// ── Log format ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            _ => Err(format!("invalid log format '{s}': expected json|text")),
        }
    }
}
