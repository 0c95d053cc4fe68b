//! Translation pool configuration (`nat_to`, `rdr_to`, `binat_to`, `af_to`).

use domain::firewall::entity::PortOp;
use domain::nat::entity::{AfTo, Pool, PoolAddr, PoolType};
use serde::{Deserialize, Serialize};

use super::common::{ConfigError, parse_af, parse_cidr};
use super::firewall::PortConfig;

/// YAML representation of an address pool.
///
/// Entries are CIDR networks or interface names; an interface resolves to
/// its first address of the packet's family when the state is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    pub addresses: Vec<String>,

    /// `none`, `bitmask`, `random`, `source-hash`, `round-robin`.
    #[serde(default)]
    pub pool_type: Option<String>,

    /// Port window, e.g. `50001:65535`, or the single rewrite port of an
    /// `rdr_to`.
    #[serde(default)]
    pub ports: Option<PortConfig>,

    #[serde(default)]
    pub static_port: bool,

    #[serde(default)]
    pub sticky_address: bool,

    /// Key for `source-hash`; random when unset.
    #[serde(default)]
    pub hash_key: Option<u64>,
}

impl PoolConfig {
    pub(super) fn validate(&self, field: &str) -> Result<(), ConfigError> {
        let pool = self.to_domain_pool(field)?;
        pool.validate()
            .map_err(|e| ConfigError::validation(field, e.to_string()))
    }

    /// Convert to a domain `Pool`.
    pub fn to_domain_pool(&self, field: &str) -> Result<Pool, ConfigError> {
        let addrs = self
            .addresses
            .iter()
            .map(|a| pool_addr(a))
            .collect::<Result<Vec<_>, _>>()?;

        let pool_type = match self.pool_type.as_deref() {
            None => {
                if addrs.len() > 1 {
                    PoolType::RoundRobin
                } else {
                    PoolType::None
                }
            }
            Some(s) => parse_pool_type(s).map_err(|()| ConfigError::InvalidValue {
                field: format!("{field}.pool_type"),
                value: s.to_string(),
                expected: "none, bitmask, random, source-hash, round-robin".to_string(),
            })?,
        };

        let mut pool = Pool::new(addrs, pool_type);
        if let Some(ref ports) = self.ports {
            let (low, high) = match ports.to_port_op()? {
                PortOp::Eq(p) => (p, p),
                PortOp::Range(lo, hi) => (lo, hi),
                _ => {
                    return Err(ConfigError::validation(
                        format!("{field}.ports"),
                        "expected a port or an inclusive range",
                    ));
                }
            };
            pool = pool.with_ports(low, high);
        }
        if self.static_port {
            pool = pool.with_static_port();
        }
        if self.sticky_address {
            pool = pool.with_sticky_address();
        }
        let key = self.hash_key.unwrap_or_else(rand::random);
        Ok(pool.with_hash_key(key))
    }
}

fn pool_addr(s: &str) -> Result<PoolAddr, ConfigError> {
    let looks_numeric = s.contains(':') || s.starts_with(|c: char| c.is_ascii_digit());
    if looks_numeric {
        Ok(PoolAddr::Network(parse_cidr(s)?))
    } else {
        Ok(PoolAddr::Interface(s.to_string()))
    }
}

fn parse_pool_type(s: &str) -> Result<PoolType, ()> {
    match s.to_lowercase().replace('_', "-").as_str() {
        "none" => Ok(PoolType::None),
        "bitmask" => Ok(PoolType::Bitmask),
        "random" => Ok(PoolType::Random),
        "source-hash" => Ok(PoolType::SourceHash),
        "round-robin" => Ok(PoolType::RoundRobin),
        _ => Err(()),
    }
}

/// `af_to: { af: inet6, from: ..., to: ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AfToConfig {
    pub af: String,
    pub from: PoolConfig,
    #[serde(default)]
    pub to: Option<PoolConfig>,
}

impl AfToConfig {
    pub fn to_domain(&self, field: &str) -> Result<AfTo, ConfigError> {
        let af = parse_af(&self.af).map_err(|()| ConfigError::InvalidValue {
            field: format!("{field}.af"),
            value: self.af.clone(),
            expected: "inet, inet6".to_string(),
        })?;
        let src = self.from.to_domain_pool(&format!("{field}.from"))?;
        src.validate()
            .map_err(|e| ConfigError::validation(format!("{field}.from"), e.to_string()))?;
        let dst = self
            .to
            .as_ref()
            .map(|p| p.to_domain_pool(&format!("{field}.to")))
            .transpose()?;
        Ok(AfTo { af, src, dst })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::common::entity::AddressFamily;

    fn pool(yaml: &str) -> PoolConfig {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn single_network_pool() {
        let p = pool("addresses: [198.51.100.1]").to_domain_pool("nat_to").unwrap();
        assert_eq!(p.pool_type, PoolType::None);
        assert!(matches!(p.addrs[0], PoolAddr::Network(_)));
        assert!(!p.ports.is_set());
    }

    #[test]
    fn interface_entry_stays_symbolic() {
        let p = pool("addresses: [em0]").to_domain_pool("nat_to").unwrap();
        assert_eq!(p.addrs, vec![PoolAddr::Interface("em0".to_string())]);
    }

    #[test]
    fn several_addresses_default_to_round_robin() {
        let p = pool("addresses: [10.0.0.1, 10.0.0.2]")
            .to_domain_pool("nat_to")
            .unwrap();
        assert_eq!(p.pool_type, PoolType::RoundRobin);
    }

    #[test]
    fn port_window_and_flags() {
        let p = pool(
            r#"
addresses: [10.0.0.0/30]
pool_type: source-hash
ports: "40000:40100"
sticky_address: true
hash_key: 42
"#,
        )
        .to_domain_pool("nat_to")
        .unwrap();
        assert_eq!((p.ports.low, p.ports.high), (40000, 40100));
        assert_eq!(p.pool_type, PoolType::SourceHash);
        assert!(p.sticky_address);
        assert_eq!(p.hash_key, 42);
    }

    #[test]
    fn single_port_is_a_window_of_one() {
        let p = pool("addresses: [10.0.0.5]\nports: 8080").to_domain_pool("rdr_to").unwrap();
        assert_eq!((p.ports.low, p.ports.high), (8080, 8080));
    }

    #[test]
    fn invalid_pool_type_is_rejected() {
        let err = pool("addresses: [10.0.0.1]\npool_type: fastest")
            .to_domain_pool("nat_to")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn empty_pool_fails_validation() {
        assert!(pool("addresses: []").validate("nat_to").is_err());
    }

    #[test]
    fn af_to_parses_both_pools() {
        let cfg: AfToConfig = serde_yaml_ng::from_str(
            r#"
af: inet
from: { addresses: [198.51.100.1] }
to: { addresses: [203.0.113.5] }
"#,
        )
        .unwrap();
        let af_to = cfg.to_domain("af_to").unwrap();
        assert_eq!(af_to.af, AddressFamily::Inet);
        assert!(af_to.dst.is_some());
    }
}
