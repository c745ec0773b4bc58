//! Error types for swarm

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to acquire state lock: {0}")]
    LockAcquireFailed(String),

    #[error("no agent found for '{0}'")]
    RecordNotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("failed to spawn backend: {0}")]
    SpawnFailed(String),

    #[error("backend exited with code {code}: {stderr}")]
    ChildFailed { code: i32, stderr: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
