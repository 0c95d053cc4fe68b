use thiserror::Error;

use crate::common::error::DomainError;
use crate::nat::error::NatError;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("invalid port range: {start}..{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("invalid CIDR prefix length: {prefix_len}")]
    InvalidCidr { prefix_len: u8 },

    #[error("invalid rule label: {reason}")]
    InvalidRuleId { reason: &'static str },

    #[error("rule not found: {id}")]
    RuleNotFound { id: String },

    #[error("mixed address families: src and dst must both be IPv4 or both IPv6")]
    MixedAddressFamilies,

    #[error("port predicates require proto tcp or udp")]
    PortsWithoutTcpUdp,

    #[error("TCP flags can only be used with TCP protocol")]
    TcpFlagsWithNonTcp,

    #[error("invalid TCP flags: {flags:#04x} is not a subset of {flagset:#04x}")]
    InvalidTcpFlags { flags: u8, flagset: u8 },

    #[error("ICMP type/code can only be used with ICMP protocol")]
    IcmpFieldsWithNonIcmp,

    #[error("synproxy state requires proto tcp")]
    SynproxyRequiresTcp,

    #[error("max-src-conn-rate needs a non-zero count and interval")]
    InvalidConnRate,

    #[error("af-to must translate into a different address family")]
    AfToSameFamily,

    #[error("binat-to needs a source network")]
    BinatNeedsSourceNetwork,

    #[error("anchor rules cannot block or match")]
    AnchorWithAction,

    #[error("anchor not found: {name}")]
    AnchorNotFound { name: String },

    #[error("duplicate anchor: {name}")]
    DuplicateAnchor { name: String },

    #[error("table not found: {name}")]
    TableNotFound { name: String },

    #[error(transparent)]
    Nat(#[from] NatError),
}

impl From<FirewallError> for DomainError {
    fn from(e: FirewallError) -> Self {
        match e {
            FirewallError::RuleNotFound { id } => Self::RuleNotFound(id),
            FirewallError::DuplicateAnchor { name } => Self::DuplicateRule(name),
            FirewallError::AnchorNotFound { .. } | FirewallError::TableNotFound { .. } => {
                Self::InvalidConfig(e.to_string())
            }
            FirewallError::Nat(inner) => inner.into(),
            other => Self::InvalidRule(other.to_string()),
        }
    }
}
