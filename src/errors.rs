use thiserror::Error;

/// Failure categories for the distribution pipeline.
///
/// The category decides the retry treatment (configuration and integrity
/// failures are never silently retried at the session level, network failures
/// are) and maps to a stable process exit code so wrapper scripts can branch
/// on it.
#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdaterError {
    pub fn exit_code(&self) -> i32 {
        match self {
            UpdaterError::Config(_) => 2,
            UpdaterError::Network(_) => 3,
            UpdaterError::Integrity(_) => 4,
            UpdaterError::Storage(_) => 5,
            UpdaterError::Io(_) => 6,
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdaterError>;
