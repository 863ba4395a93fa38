//! Client error types.

use std::time::Duration;

use mapepire_channel::ChannelError;
use mapepire_protocol::{ProtocolError, ServerReply};
use thiserror::Error;

/// Errors returned by jobs and queries.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller used the API incorrectly. Raised before any I/O.
    #[error("{0}")]
    Usage(String),

    /// An argument was out of range. Raised before any I/O.
    #[error("{0}")]
    Argument(String),

    /// The channel to the daemon could not be opened.
    #[error("failed to connect to {host}:{port}: {source}")]
    Connection {
        /// Daemon host.
        host: String,
        /// Daemon port.
        port: u16,
        /// Underlying channel error.
        #[source]
        source: ChannelError,
    },

    /// The daemon refused to start a job.
    #[error("{0}")]
    ConnectRefused(String),

    /// The daemon answered with `success: false`.
    #[error("{message}")]
    Server {
        /// Composite message from `error`, `sql_state` and `sql_rc`.
        message: String,
        /// SQLSTATE, when supplied.
        sql_state: Option<String>,
        /// SQL return code, when supplied.
        sql_rc: Option<i64>,
    },

    /// Channel fault after the job was connected.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Malformed request or response.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The job has no open channel.
    #[error("job is not connected")]
    NotConnected,

    /// The channel closed before the response to `id` arrived.
    #[error("connection closed while waiting for response to {0}")]
    ConnectionClosed(String),

    /// No response to `id` arrived in time.
    #[error("no response to {id} within {timeout:?}")]
    Timeout {
        /// Correlation id of the request.
        id: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// Invalid configuration or connection URL.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Server error with the composite `error, sql_state, sql_rc` message.
    pub(crate) fn from_reply(reply: &impl ServerReply) -> Self {
        Self::Server {
            message: reply.error_message(),
            sql_state: reply.sql_state().map(str::to_string),
            sql_rc: reply.sql_rc(),
        }
    }

    /// Server error with the `error` field, or `fallback` when absent.
    pub(crate) fn from_reply_or(reply: &impl ServerReply, fallback: &str) -> Self {
        Self::Server {
            message: reply.error_or(fallback),
            sql_state: reply.sql_state().map(str::to_string),
            sql_rc: reply.sql_rc(),
        }
    }

    /// Whether this error is caller misuse.
    #[must_use]
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_) | Self::Argument(_))
    }

    /// Whether the daemon reported the failure.
    #[must_use]
    pub fn is_server(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::ConnectRefused(_))
    }

    /// Whether retrying on a fresh job might succeed.
    ///
    /// The library never retries on its own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Channel(_)
                | Self::NotConnected
                | Self::ConnectionClosed(_)
                | Self::Timeout { .. }
        )
    }

    /// SQLSTATE of a server error.
    #[must_use]
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Server { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
