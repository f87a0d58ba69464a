use crate::storage::{ErrorReason, ResponseError};
use thiserror::Error;

/// Why a tile failed to load
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TileError {
    #[error("tile not found: {0}")]
    NotFound(String),

    #[error("{reason} loading tile: {message}")]
    Network {
        reason: ErrorReason,
        message: String,
    },

    #[error("tile parse error: {0}")]
    Parse(String),
}

impl TileError {
    /// Permanent errors never schedule a reload
    pub fn is_permanent(&self) -> bool {
        matches!(self, TileError::NotFound(_) | TileError::Parse(_))
    }
}

impl From<&ResponseError> for TileError {
    fn from(error: &ResponseError) -> Self {
        match error.reason {
            ErrorReason::NotFound => TileError::NotFound(error.message.clone()),
            reason => TileError::Network {
                reason,
                message: error.message.clone(),
            },
        }
    }
}
