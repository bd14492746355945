use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("run {run_id} not found")]
    NotFound { run_id: String },
    #[error("run {run_id} has corrupt column {column}: {reason}")]
    Corrupt {
        run_id: String,
        column: &'static str,
        reason: String,
    },
    #[error("run store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("background task failed: {0}")]
    Join(String),
}

pub type RunStoreResult<T> = std::result::Result<T, RunStoreError>;
