use thiserror::Error;

use crate::common::entity::DropReason;
use crate::common::error::DomainError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceTrackError {
    #[error("source node table full ({limit} nodes)")]
    TableFull { limit: usize },

    #[error("rule source node limit reached ({limit})")]
    TooManyNodes { limit: u32 },

    #[error("source state limit reached ({limit})")]
    TooManyStates { limit: u32 },

    #[error("source connection limit reached ({limit})")]
    TooManyConnections { limit: u32 },

    #[error("source connection rate exceeded")]
    ConnRateExceeded,
}

impl SourceTrackError {
    /// Drop reason reported for a packet refused by this error.
    pub fn reason(&self) -> DropReason {
        match self {
            Self::TableFull { .. } => DropReason::Memory,
            Self::ConnRateExceeded => DropReason::SrcConnRate,
            Self::TooManyNodes { .. }
            | Self::TooManyStates { .. }
            | Self::TooManyConnections { .. } => DropReason::SrcLimit,
        }
    }
}

impl From<SourceTrackError> for DomainError {
    fn from(e: SourceTrackError) -> Self {
        Self::EngineError(e.to_string())
    }
}
