use thiserror::Error;

use crate::common::entity::DropReason;
use crate::common::error::DomainError;
use crate::srctrack::error::SourceTrackError;

#[derive(Debug, Error)]
pub enum NatError {
    #[error("translation pool has no addresses")]
    EmptyPool,

    #[error("invalid port window: {low}:{high}")]
    InvalidPortWindow { low: u16, high: u16 },

    #[error("pool type {pool_type} accepts a single address only")]
    PoolTypeNeedsSingleAddress { pool_type: &'static str },

    #[error("sticky-address requires a round-robin, random or source-hash pool")]
    StickyWithoutPool,

    #[error("pool address family {pool} does not match rule family {rule}")]
    AfMismatch { pool: String, rule: String },

    #[error("af-to is only valid on inbound rules")]
    AfToRequiresInbound,

    #[error("no pool address available for {af}")]
    NoAddress { af: String },

    #[error("no free source port in {low}:{high}")]
    PortsExhausted { low: u16, high: u16 },

    #[error("sticky address node: {0}")]
    SourceTrack(#[from] SourceTrackError),
}

impl NatError {
    /// Drop reason for a packet whose translation failed.
    pub fn reason(&self) -> DropReason {
        match self {
            Self::SourceTrack(e) => e.reason(),
            _ => DropReason::Translate,
        }
    }
}

impl From<NatError> for DomainError {
    fn from(e: NatError) -> Self {
        match e {
            NatError::NoAddress { .. }
            | NatError::PortsExhausted { .. }
            | NatError::SourceTrack(_) => {
                Self::EngineError(e.to_string())
            }
            other => Self::InvalidRule(other.to_string()),
        }
    }
}
