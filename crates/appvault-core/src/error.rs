use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("application not published on server: {0}")]
    NotFound(String),

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("authentication failed (wrong secret or tampered artifact)")]
    AuthenticationFailure,

    #[error("storage failure: {0}")]
    StorageFailure(#[from] std::io::Error),

    #[error("corrupt install for {app}: artifact failed authentication")]
    CorruptInstall { app: String },

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid application key {0:?}")]
    InvalidAppKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Serializable summary of a failure, carried by `UpdateState::Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Unreachable,
    NotFound,
    IntegrityMismatch,
    AuthenticationFailure,
    StorageFailure,
    Cancelled,
    Other,
}

impl SyncError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Unreachable(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Unreachable(_) => FailureKind::Unreachable,
            SyncError::NotFound(_) => FailureKind::NotFound,
            SyncError::IntegrityMismatch { .. } => FailureKind::IntegrityMismatch,
            SyncError::AuthenticationFailure | SyncError::CorruptInstall { .. } => {
                FailureKind::AuthenticationFailure
            }
            SyncError::StorageFailure(_) => FailureKind::StorageFailure,
            SyncError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Other,
        }
    }
}
