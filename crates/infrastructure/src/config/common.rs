//! Shared parsing helpers and error types used across all config modules.

use std::path::Path;

use tracing::warn;

use domain::common::entity::{Addr, AddressFamily, Protocol};
use domain::common::packet::tcp_flags_from_str;
use domain::firewall::entity::{IpNetwork, PortOp};

// ── Security limits ────────────────────────────────────────────────
//
// Maximum counts per section to prevent OOM from excessive config.

/// Maximum rules per ruleset (main or one anchor).
pub(super) const MAX_RULES: usize = 65_536;
/// Maximum anchors.
pub(super) const MAX_ANCHORS: usize = 1_024;
/// Maximum address tables.
pub(super) const MAX_TABLES: usize = 1_024;
/// Maximum entries in one address table.
pub(super) const MAX_TABLE_ENTRIES: usize = 200_000;

// ── Config errors ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("invalid CIDR notation '{value}': {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("invalid port expression '{value}': {reason}")]
    InvalidPortRange { value: String, reason: String },

    #[error("invalid value '{value}' for field '{field}': expected one of {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

impl From<serde_yaml_ng::Error> for ConfigError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        Self::Yaml(e.to_string())
    }
}

impl ConfigError {
    pub(super) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ── Parsing helpers ────────────────────────────────────────────────

/// Parse a CIDR string into an `IpNetwork`.
///
/// Supports both IPv4 (`"192.168.1.0/24"`, `"10.0.0.1"`) and
/// IPv6 (`"2001:db8::/32"`, `"::1"`).
pub fn parse_cidr(s: &str) -> Result<IpNetwork, ConfigError> {
    if s.contains(':') {
        parse_cidr_v6(s)
    } else {
        parse_cidr_v4(s)
    }
}

fn split_prefix(s: &str, max: u8) -> Result<(&str, u8), ConfigError> {
    match s.split_once('/') {
        Some((ip, prefix)) => {
            let len = prefix.parse::<u8>().map_err(|_| ConfigError::InvalidCidr {
                value: s.to_string(),
                reason: format!("invalid prefix length: '{prefix}'"),
            })?;
            if len > max {
                return Err(ConfigError::InvalidCidr {
                    value: s.to_string(),
                    reason: format!("prefix length {len} must be 0-{max}"),
                });
            }
            Ok((ip, len))
        }
        None => Ok((s, max)),
    }
}

fn parse_cidr_v4(s: &str) -> Result<IpNetwork, ConfigError> {
    let (ip_str, prefix_len) = split_prefix(s, 32)?;
    let ip: std::net::Ipv4Addr = ip_str.parse().map_err(|e| ConfigError::InvalidCidr {
        value: s.to_string(),
        reason: format!("invalid IPv4 address: {e}"),
    })?;
    Ok(IpNetwork::V4 {
        addr: u32::from(ip),
        prefix_len,
    })
}

fn parse_cidr_v6(s: &str) -> Result<IpNetwork, ConfigError> {
    let (ip_str, prefix_len) = split_prefix(s, 128)?;
    let ip: std::net::Ipv6Addr = ip_str.parse().map_err(|e| ConfigError::InvalidCidr {
        value: s.to_string(),
        reason: format!("invalid IPv6 address: {e}"),
    })?;
    Ok(IpNetwork::V6 {
        addr: ip.octets(),
        prefix_len,
    })
}

/// Parse a bare host address.
pub fn parse_addr(s: &str) -> Result<(AddressFamily, Addr), ConfigError> {
    let ip: std::net::IpAddr = s.parse().map_err(|e| ConfigError::InvalidCidr {
        value: s.to_string(),
        reason: format!("invalid address: {e}"),
    })?;
    Ok(match ip {
        std::net::IpAddr::V4(v4) => (AddressFamily::Inet, Addr::v4(u32::from(v4))),
        std::net::IpAddr::V6(v6) => (AddressFamily::Inet6, Addr::from_v6_octets(v6.octets())),
    })
}

/// Parse a pf port expression: `80`, `!=80`, `<1024`, `>=1024`,
/// `1000:2000`, `1000><2000`, `1000<>2000`.
pub fn parse_port_op(s: &str) -> Result<PortOp, ConfigError> {
    let s = s.trim();
    let bad = |reason: String| ConfigError::InvalidPortRange {
        value: s.to_string(),
        reason,
    };
    let port = |p: &str| {
        p.trim()
            .parse::<u16>()
            .map_err(|_| bad(format!("invalid port '{}'", p.trim())))
    };

    let op = if let Some((lo, hi)) = s.split_once("><") {
        PortOp::Inside(port(lo)?, port(hi)?)
    } else if let Some((lo, hi)) = s.split_once("<>") {
        PortOp::Outside(port(lo)?, port(hi)?)
    } else if let Some((lo, hi)) = s.split_once(':') {
        PortOp::Range(port(lo)?, port(hi)?)
    } else if let Some(p) = s.strip_prefix("!=") {
        PortOp::Ne(port(p)?)
    } else if let Some(p) = s.strip_prefix("<=") {
        PortOp::Le(port(p)?)
    } else if let Some(p) = s.strip_prefix(">=") {
        PortOp::Ge(port(p)?)
    } else if let Some(p) = s.strip_prefix('<') {
        PortOp::Lt(port(p)?)
    } else if let Some(p) = s.strip_prefix('>') {
        PortOp::Gt(port(p)?)
    } else if let Some(p) = s.strip_prefix('=') {
        PortOp::Eq(port(p)?)
    } else {
        PortOp::Eq(port(s)?)
    };
    op.validate().map_err(|e| bad(e.to_string()))?;
    Ok(op)
}

pub(super) fn parse_protocol(s: &str) -> Result<Protocol, ()> {
    match s.to_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        "icmp" => Ok(Protocol::Icmp),
        "icmp6" | "ipv6-icmp" => Ok(Protocol::Icmpv6),
        other => other.parse::<u8>().map(Protocol::from_u8).map_err(|_| ()),
    }
}

pub(super) fn parse_af(s: &str) -> Result<AddressFamily, ()> {
    match s.to_lowercase().as_str() {
        "inet" | "ipv4" => Ok(AddressFamily::Inet),
        "inet6" | "ipv6" => Ok(AddressFamily::Inet6),
        _ => Err(()),
    }
}

/// Parse `flags S/SA`. A bare `S` checks against `FSRPAUEW`, which is
/// what pf does when no mask is given.
pub(super) fn parse_flags(s: &str) -> Result<(u8, u8), String> {
    let (set, mask) = match s.split_once('/') {
        Some((set, mask)) => (set, mask),
        None => (s, "FSRPAUEW"),
    };
    let set = tcp_flags_from_str(set).map_err(|c| format!("unknown flag '{c}'"))?;
    let mask = tcp_flags_from_str(mask).map_err(|c| format!("unknown flag '{c}'"))?;
    if set & !mask != 0 {
        return Err("flags must be a subset of the mask".to_string());
    }
    Ok((set, mask))
}

/// Log a warning if a file is world-readable (Unix only).
#[cfg(unix)]
pub(super) fn warn_if_world_readable(path: &Path, label: &str) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if mode & 0o004 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:04o}"),
                "{label} is world-readable; consider chmod 640 or stricter",
            );
        }
    }
}

#[cfg(not(unix))]
pub(super) fn warn_if_world_readable(_path: &Path, _label: &str) {}

/// Enforce a maximum count on a config collection.
pub(super) fn check_limit(field: &str, count: usize, max: usize) -> Result<(), ConfigError> {
    if count > max {
        return Err(ConfigError::validation(
            field,
            format!("count {count} exceeds maximum {max}"),
        ));
    }
    Ok(())
}
