//! Lifecycle states of jobs and queries.

use std::fmt;

/// Lifecycle status of a [`SqlJob`](crate::SqlJob).
///
/// `Busy` is never stored; it is derived from the live count of pending
/// requests whenever the status is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Created but not connected, or a connect was refused by the daemon.
    NotStarted,
    /// A connect is in progress.
    Connecting,
    /// Connected with no request in flight.
    Ready,
    /// Connected with at least one request in flight.
    Busy,
    /// The channel is gone.
    Ended,
}

impl JobStatus {
    /// Whether the job counts against a pool's capacity.
    #[must_use]
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Ended | Self::NotStarted)
    }

    /// Whether the job can accept requests.
    #[must_use]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "notStarted",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Ended => "ended",
        })
    }
}

/// Execution state of a [`Query`](crate::Query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryState {
    /// Not sent yet.
    NotYetRun,
    /// Run; the server holds more rows.
    RunMoreDataAvailable,
    /// Run to completion, or closed.
    RunDone,
    /// Failed. Terminal.
    Error,
}

impl QueryState {
    /// Whether the query still holds (or may acquire) server resources.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::NotYetRun | Self::RunMoreDataAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_statuses() {
        assert!(JobStatus::Connecting.is_live());
        assert!(JobStatus::Ready.is_live());
        assert!(JobStatus::Busy.is_live());
        assert!(!JobStatus::Ended.is_live());
        assert!(!JobStatus::NotStarted.is_live());
    }

    #[test]
    fn test_usable_excludes_connecting() {
        assert!(!JobStatus::Connecting.is_usable());
        assert!(JobStatus::Busy.is_usable());
    }

    #[test]
    fn test_open_query_states() {
        assert!(QueryState::NotYetRun.is_open());
        assert!(QueryState::RunMoreDataAvailable.is_open());
        assert!(!QueryState::RunDone.is_open());
        assert!(!QueryState::Error.is_open());
    }
}
