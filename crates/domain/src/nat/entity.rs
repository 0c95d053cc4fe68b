use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::common::entity::{Addr, AddressFamily, Protocol};
use crate::firewall::entity::IpNetwork;

use super::error::NatError;

/// Default source-port window used by `nat-to` when the pool sets none.
pub const PF_NAT_PROXY_PORT_LOW: u16 = 50001;
pub const PF_NAT_PROXY_PORT_HIGH: u16 = 65535;

// ── Pool ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolType {
    /// Use the pool address as-is.
    #[default]
    None,
    /// Keep the host bits of the original address under the pool network.
    Bitmask,
    Random,
    SourceHash,
    RoundRobin,
}

impl PoolType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bitmask => "bitmask",
            Self::Random => "random",
            Self::SourceHash => "source-hash",
            Self::RoundRobin => "round-robin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolAddr {
    Network(IpNetwork),
    /// First address of the interface, resolved at translation time.
    Interface(String),
}

/// Inclusive port window. `0..=0` means "leave the port alone".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortWindow {
    pub low: u16,
    pub high: u16,
}

impl PortWindow {
    pub const NONE: Self = Self { low: 0, high: 0 };

    pub fn is_set(self) -> bool {
        self.low != 0 || self.high != 0
    }
}

/// Round-robin position inside a pool.
#[derive(Debug, Clone, Default)]
pub struct PoolCursor {
    pub index: usize,
    /// Last host handed out from the network at `index`.
    pub counter: Option<Addr>,
}

/// Translation address pool (`nat-to`, `rdr-to`, `binat-to`, `af-to`).
#[derive(Debug)]
pub struct Pool {
    pub addrs: Vec<PoolAddr>,
    pub pool_type: PoolType,
    pub ports: PortWindow,
    pub static_port: bool,
    pub sticky_address: bool,
    /// Keys the source-hash pool.
    pub hash_key: u64,
    cursor: Mutex<PoolCursor>,
}

impl Pool {
    pub fn new(addrs: Vec<PoolAddr>, pool_type: PoolType) -> Self {
        Self {
            addrs,
            pool_type,
            ports: PortWindow::NONE,
            static_port: false,
            sticky_address: false,
            hash_key: 0,
            cursor: Mutex::new(PoolCursor::default()),
        }
    }

    /// Single-network pool of type `None`.
    pub fn single(net: IpNetwork) -> Self {
        Self::new(vec![PoolAddr::Network(net)], PoolType::None)
    }

    #[must_use]
    pub fn with_ports(mut self, low: u16, high: u16) -> Self {
        self.ports = PortWindow { low, high };
        self
    }

    #[must_use]
    pub fn with_static_port(mut self) -> Self {
        self.static_port = true;
        self
    }

    #[must_use]
    pub fn with_sticky_address(mut self) -> Self {
        self.sticky_address = true;
        self
    }

    #[must_use]
    pub fn with_hash_key(mut self, key: u64) -> Self {
        self.hash_key = key;
        self
    }

    pub fn validate(&self) -> Result<(), NatError> {
        if self.addrs.is_empty() {
            return Err(NatError::EmptyPool);
        }
        if self.ports.low > self.ports.high {
            return Err(NatError::InvalidPortWindow {
                low: self.ports.low,
                high: self.ports.high,
            });
        }
        if self.addrs.len() > 1
            && !matches!(self.pool_type, PoolType::RoundRobin | PoolType::Random)
        {
            return Err(NatError::PoolTypeNeedsSingleAddress {
                pool_type: self.pool_type.as_str(),
            });
        }
        if self.sticky_address
            && !matches!(
                self.pool_type,
                PoolType::RoundRobin | PoolType::Random | PoolType::SourceHash
            )
        {
            return Err(NatError::StickyWithoutPool);
        }
        Ok(())
    }

    /// Family of the first network entry, if any.
    pub fn af(&self) -> Option<AddressFamily> {
        self.addrs.iter().find_map(|a| match a {
            PoolAddr::Network(net) => Some(net.af()),
            PoolAddr::Interface(_) => None,
        })
    }

    pub(crate) fn with_cursor<T>(&self, f: impl FnOnce(&mut PoolCursor) -> T) -> T {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut cursor)
    }
}

/// Address-family translation directive.
#[derive(Debug)]
pub struct AfTo {
    pub af: AddressFamily,
    pub src: Pool,
    /// Without a destination pool the v4 destination is taken from the low
    /// 32 bits of the v6 destination (or embedded into the source prefix).
    pub dst: Option<Pool>,
}

// ── Translation results ─────────────────────────────────────────────

/// Packet addressing after translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translated {
    pub af: AddressFamily,
    pub proto: Protocol,
    pub src: Addr,
    pub sport: u16,
    pub dst: Addr,
    pub dport: u16,
}

/// Which directive a translated address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationKind {
    Nat,
    Rdr,
}

/// Pool address chosen for a sticky pool, recorded on a source node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StickyBinding {
    pub kind: TranslationKind,
    pub addr: Addr,
}
