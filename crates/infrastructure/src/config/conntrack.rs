//! State table tuning: global timeouts and hard limits.

use std::collections::BTreeMap;

use domain::conntrack::entity::{Limits, TimeoutClass, Timeouts};
use serde::{Deserialize, Serialize};

use super::common::ConfigError;

/// `timeouts:` section. Every key other than the sweeper and adaptive
/// parameters names a timeout class, e.g. `tcp.established: 3600`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_node: Option<u32>,

    #[serde(default, rename = "adaptive.start", skip_serializing_if = "Option::is_none")]
    pub adaptive_start: Option<u32>,

    #[serde(default, rename = "adaptive.end", skip_serializing_if = "Option::is_none")]
    pub adaptive_end: Option<u32>,

    #[serde(flatten)]
    pub classes: BTreeMap<String, u32>,
}

impl TimeoutsConfig {
    /// Overlay the configured values on the built-in defaults.
    pub fn to_domain(&self) -> Result<Timeouts, ConfigError> {
        let mut t = Timeouts::default();
        for (name, &secs) in &self.classes {
            let class = TimeoutClass::from_name(name).ok_or_else(|| ConfigError::InvalidValue {
                field: format!("timeouts.{name}"),
                value: name.clone(),
                expected: "a timeout name such as tcp.established".to_string(),
            })?;
            t.set(class, secs);
        }
        if let Some(v) = self.interval {
            t.interval = v;
        }
        if let Some(v) = self.src_node {
            t.src_node = v;
        }
        if let Some(v) = self.adaptive_start {
            t.adaptive_start = v;
        }
        if let Some(v) = self.adaptive_end {
            t.adaptive_end = v;
        }
        t.validate()
            .map_err(|e| ConfigError::validation("timeouts", e.to_string()))?;
        Ok(t)
    }
}

/// `limits:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default = "default_states")]
    pub states: usize,

    #[serde(default = "default_src_nodes")]
    pub src_nodes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            states: default_states(),
            src_nodes: default_src_nodes(),
        }
    }
}

fn default_states() -> usize {
    Limits::default().states
}

fn default_src_nodes() -> usize {
    Limits::default().src_nodes
}

impl LimitsConfig {
    pub fn to_domain(&self) -> Result<Limits, ConfigError> {
        if self.states == 0 {
            return Err(ConfigError::validation("limits.states", "must be > 0"));
        }
        Ok(Limits {
            states: self.states,
            src_nodes: self.src_nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_keeps_defaults() {
        let cfg: TimeoutsConfig = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(cfg.to_domain().unwrap(), Timeouts::default());
    }

    #[test]
    fn class_names_override_single_values() {
        let cfg: TimeoutsConfig = serde_yaml_ng::from_str(
            r#"
tcp.established: 3600
udp.first: 15
interval: 5
adaptive.start: 6000
adaptive.end: 12000
"#,
        )
        .unwrap();
        let t = cfg.to_domain().unwrap();
        assert_eq!(t.get(TimeoutClass::TcpEstablished), 3600);
        assert_eq!(t.get(TimeoutClass::UdpFirstPacket), 15);
        assert_eq!(t.get(TimeoutClass::TcpClosing), 900);
        assert_eq!(t.interval, 5);
        assert_eq!((t.adaptive_start, t.adaptive_end), (6000, 12000));
    }

    #[test]
    fn unknown_class_is_rejected() {
        let cfg: TimeoutsConfig = serde_yaml_ng::from_str("tcp.forever: 1").unwrap();
        assert!(matches!(cfg.to_domain(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn zero_interval_fails_validation() {
        let cfg: TimeoutsConfig = serde_yaml_ng::from_str("interval: 0").unwrap();
        assert!(matches!(cfg.to_domain(), Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn inverted_adaptive_range_fails_validation() {
        let cfg: TimeoutsConfig =
            serde_yaml_ng::from_str("adaptive.start: 500\nadaptive.end: 100").unwrap();
        assert!(cfg.to_domain().is_err());
    }

    #[test]
    fn limits_default_and_reject_zero_states() {
        assert_eq!(LimitsConfig::default().to_domain().unwrap(), Limits::default());
        let cfg: LimitsConfig = serde_yaml_ng::from_str("states: 0").unwrap();
        assert!(cfg.to_domain().is_err());
    }
}
