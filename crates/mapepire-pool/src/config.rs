//! Pool configuration.

use std::time::Duration;

use mapepire_client::{DaemonServer, JdbcOptions};

use crate::error::PoolError;

/// Configuration for a [`Pool`](crate::Pool).
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Daemon every job connects to.
    pub creds: DaemonServer,

    /// Connection options of every job.
    pub opts: JdbcOptions,

    /// Maximum number of live jobs (default: 5).
    pub max_size: u32,

    /// Jobs created by `init` (default: 1).
    pub starting_size: u32,

    /// Per-request response timeout. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl PoolOptions {
    /// Default maximum size.
    pub const DEFAULT_MAX_SIZE: u32 = 5;
    /// Default starting size.
    pub const DEFAULT_STARTING_SIZE: u32 = 1;

    /// Options with default sizing.
    pub fn new(creds: DaemonServer) -> Self {
        Self {
            creds,
            opts: JdbcOptions::new(),
            max_size: Self::DEFAULT_MAX_SIZE,
            starting_size: Self::DEFAULT_STARTING_SIZE,
            request_timeout: None,
        }
    }

    /// Set the job options.
    #[must_use]
    pub fn opts(mut self, opts: JdbcOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Set the maximum size.
    #[must_use]
    pub fn max_size(mut self, size: u32) -> Self {
        self.max_size = size;
        self
    }

    /// Set the starting size.
    #[must_use]
    pub fn starting_size(mut self, size: u32) -> Self {
        self.starting_size = size;
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Check the sizing.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidMaxSize);
        }
        if self.starting_size == 0 {
            return Err(PoolError::InvalidStartingSize);
        }
        if self.starting_size > self.max_size {
            return Err(PoolError::StartingSizeExceedsMax);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> DaemonServer {
        DaemonServer::new("localhost", "QUSER", "secret")
    }

    #[test]
    fn test_defaults_are_valid() {
        let options = PoolOptions::new(creds());
        assert_eq!(options.max_size, 5);
        assert_eq!(options.starting_size, 1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validation_order() {
        let zero_both = PoolOptions::new(creds()).max_size(0).starting_size(0);
        assert!(matches!(zero_both.validate(), Err(PoolError::InvalidMaxSize)));

        let zero_start = PoolOptions::new(creds()).starting_size(0);
        assert!(matches!(zero_start.validate(), Err(PoolError::InvalidStartingSize)));

        let too_many = PoolOptions::new(creds()).max_size(2).starting_size(3);
        assert!(matches!(too_many.validate(), Err(PoolError::StartingSizeExceedsMax)));

        let equal = PoolOptions::new(creds()).max_size(3).starting_size(3);
        assert!(equal.validate().is_ok());
    }
}
