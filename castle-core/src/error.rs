//! Castle error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The requested key or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A failure which may clear up on its own, such as a store which is unreachable or a
    /// subprocess which exited in a retryable state.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    /// A device holds foreign data and force-format was not requested.
    #[error("refusing to partition device {device}: {reason}")]
    PartitionHazard { device: String, reason: String },
    /// The monitors did not form a quorum within the configured retries.
    #[error("monitor quorum not reached: {0}")]
    QuorumLoss(String),
    /// User supplied configuration failed validation.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),
    /// A supervised process keeps exiting.
    #[error("process {name} is crash looping after {failures} consecutive failures")]
    ProcessCrashLoop { name: String, failures: u32 },
}

impl AppError {
    /// Check if the given error is an `AppError::NotFound`.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<AppError>(), Some(AppError::NotFound(_)))
    }

    /// Check if the given error is an `AppError::ConfigInvalid`.
    pub fn is_config_invalid(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<AppError>(), Some(AppError::ConfigInvalid(_)))
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
