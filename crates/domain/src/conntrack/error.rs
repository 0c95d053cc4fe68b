use thiserror::Error;

use crate::common::error::DomainError;

#[derive(Debug, Error)]
pub enum ConnTrackError {
    #[error("invalid timeout {name}: {reason}")]
    InvalidTimeout {
        name: &'static str,
        reason: &'static str,
    },

    #[error("invalid limit {name}: {reason}")]
    InvalidLimit {
        name: &'static str,
        reason: &'static str,
    },

    #[error("state not found: {id}")]
    StateNotFound { id: String },

    #[error("state table full ({limit} states)")]
    TableFull { limit: usize },

    #[error("state key already owned: {key}")]
    Collision { key: String },

    #[error("rejected state snapshot: {reason}")]
    InvalidSnapshot { reason: String },
}

impl From<ConnTrackError> for DomainError {
    fn from(e: ConnTrackError) -> Self {
        match e {
            ConnTrackError::StateNotFound { id } => Self::StateNotFound(id),
            ConnTrackError::InvalidTimeout { .. } | ConnTrackError::InvalidLimit { .. } => {
                Self::InvalidConfig(e.to_string())
            }
            other => Self::EngineError(other.to_string()),
        }
    }
}
