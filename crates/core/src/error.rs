use thiserror::Error;

use crate::types::Height;

/// Errors that can occur while synchronizing a height range
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Range task is already running")]
    AlreadyRunning,

    #[error("Invalid range: start {start} is greater than end {end}")]
    InvalidRange { start: Height, end: Height },

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Failed to fetch block {height}: {reason}")]
    Fetch { height: Height, reason: String },

    #[error("Sync stalled at height {height} after {attempts} attempts")]
    Stalled { height: Height, attempts: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
