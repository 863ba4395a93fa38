//! Pool error types.

use thiserror::Error;

/// Errors returned by the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `max_size` was zero.
    #[error("Max size must be greater than 0")]
    InvalidMaxSize,

    /// `starting_size` was zero.
    #[error("Starting size must be greater than 0")]
    InvalidStartingSize,

    /// `starting_size` was larger than `max_size`.
    #[error("Max size must be greater than or equal to starting size")]
    StartingSizeExceedsMax,

    /// No job is ready or busy; every job is still connecting or has ended.
    #[error("no job available in pool")]
    NoJobAvailable,

    /// The pool has been ended.
    #[error("pool is closed")]
    Closed,

    /// A job operation failed.
    #[error(transparent)]
    Job(#[from] mapepire_client::Error),
}

impl PoolError {
    /// Whether this error comes from invalid pool sizing.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidMaxSize | Self::InvalidStartingSize | Self::StartingSizeExceedsMax
        )
    }
}
