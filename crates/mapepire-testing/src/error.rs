//! Mock daemon errors.

use thiserror::Error;

/// Errors starting or running the mock daemon.
#[derive(Debug, Error)]
pub enum MockError {
    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate generation failed.
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// TLS configuration failed.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// WebSocket handshake or framing failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
