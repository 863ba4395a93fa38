//! Daemon endpoint description.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mapepire_protocol::{DEFAULT_PORT, ENDPOINT_PATH};

/// TLS trust options for an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// PEM-encoded trust anchor. When absent, `webpki-roots` is used.
    pub ca: Option<String>,
    /// Explicit override of the computed "reject unauthorized" flag.
    pub reject_unauthorized: Option<bool>,
}

/// Where and how to open a channel.
#[derive(Clone)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// Daemon port.
    pub port: u16,
    /// User profile.
    pub user: String,
    /// Password.
    pub password: String,
    /// TLS trust options.
    pub tls: TlsOptions,
    /// Upper bound on TCP connect, TLS and WebSocket handshakes combined.
    pub connect_timeout: Duration,
}

impl Endpoint {
    /// Default connect timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create an endpoint on the default port.
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            password: password.into(),
            tls: TlsOptions::default(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// WebSocket URL of the daemon, e.g. `wss://myibmi:8076/db/`.
    #[must_use]
    pub fn url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("wss://[{}]:{}{}", self.host, self.port, ENDPOINT_PATH)
        } else {
            format!("wss://{}:{}{}", self.host, self.port, ENDPOINT_PATH)
        }
    }

    /// Value of the `Authorization` header.
    #[must_use]
    pub fn basic_auth(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.user, self.password));
        format!("Basic {token}")
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
