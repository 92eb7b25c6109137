use thiserror::Error;

use crate::types::{RunId, RunStatus};

#[derive(Debug, Error)]
pub enum VoyageError {
    // Graph errors
    #[error("Graph configuration error: {0}")]
    GraphConfig(String),

    #[error("Invalid transition from node '{node}' to '{target}'")]
    InvalidTransition { node: String, target: String },

    // Run state errors
    #[error("Run {run_id} is {status} and accepts no further transitions")]
    InvalidState { run_id: RunId, status: RunStatus },

    #[error("Payload slot '{slot}' already written by {owner} (attempt {attempt})")]
    SlotConflict {
        slot: String,
        owner: String,
        attempt: u32,
    },

    #[error("Node '{node}' wrote payload slot '{slot}' it does not declare")]
    UndeclaredSlot { node: String, slot: String },

    #[error("Run not found: {0}")]
    NotFound(RunId),

    // Storage errors
    #[error("Persistence conflict for run {run_id}: expected revision {expected}, found {found}")]
    PersistenceConflict {
        run_id: RunId,
        expected: u64,
        found: u64,
    },

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VoyageError>;

/// Failure reported by an agent capability.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error("capability timed out after {0}s")]
    Timeout(u64),

    #[error("capability failed: {message}")]
    Failed { message: String, retryable: bool },

    #[error("invalid result: {0}")]
    InvalidResult(String),
}

impl CapabilityError {
    /// A failure the caller may retry.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that must end the run.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::InvalidResult(_) => true,
            Self::Failed { retryable, .. } => *retryable,
        }
    }
}
