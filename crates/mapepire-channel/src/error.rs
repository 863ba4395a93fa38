//! Channel error types.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Hint appended to handshake failures that look like a protocol mismatch
/// with an older daemon TLS stack.
pub const LEGACY_PROTOCOL_HINT: &str = "the server may only offer TLS versions or cipher suites \
     this client does not support; check the daemon's Java TLS configuration";

/// Errors that can occur while opening or using a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// IO error on the underlying socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint could not be turned into a request URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// TLS configuration or handshake failure.
    #[error("TLS error: {message}{}", hint_suffix(.hint))]
    Tls {
        /// Underlying TLS error text.
        message: String,
        /// Additional guidance when the failure matches a known pattern.
        hint: Option<&'static str>,
    },

    /// The server certificate is not trusted.
    #[error("certificate not trusted: {0}")]
    Untrusted(String),

    /// A supplied certificate could not be parsed.
    #[error("invalid certificate: {0}")]
    Certificate(String),

    /// The server rejected the WebSocket upgrade.
    #[error("handshake rejected with HTTP status {status}")]
    Handshake {
        /// HTTP status code of the rejection.
        status: u16,
    },

    /// WebSocket protocol error.
    #[error("websocket error: {0}")]
    WebSocket(#[source] Box<tungstenite::Error>),

    /// Opening the channel took longer than the configured timeout.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The channel has been closed.
    #[error("channel closed")]
    Closed,

    /// An inbound frame was not a JSON object.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

fn hint_suffix(hint: &Option<&'static str>) -> String {
    hint.map(|h| format!(" ({h})")).unwrap_or_default()
}

impl ChannelError {
    /// Whether this error indicates a certificate trust failure.
    #[must_use]
    pub fn is_untrusted(&self) -> bool {
        matches!(self, Self::Untrusted(_))
    }

    /// Classify a rustls error, attaching the legacy-protocol hint where it
    /// applies.
    #[must_use]
    pub fn from_rustls(err: &rustls::Error) -> Self {
        match err {
            rustls::Error::InvalidCertificate(reason) => Self::Untrusted(format!("{reason:?}")),
            rustls::Error::InvalidMessage(_)
            | rustls::Error::PeerIncompatible(_)
            | rustls::Error::AlertReceived(rustls::AlertDescription::ProtocolVersion)
            | rustls::Error::AlertReceived(rustls::AlertDescription::HandshakeFailure) => {
                Self::Tls {
                    message: err.to_string(),
                    hint: Some(LEGACY_PROTOCOL_HINT),
                }
            }
            other => Self::Tls {
                message: other.to_string(),
                hint: None,
            },
        }
    }

    fn from_io(err: std::io::Error) -> Self {
        if let Some(tls) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Self::from_rustls(tls);
        }
        Self::Io(err)
    }
}

impl From<tungstenite::Error> for ChannelError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io) => Self::from_io(io),
            tungstenite::Error::Tls(tls) => Self::Tls {
                message: tls.to_string(),
                hint: None,
            },
            tungstenite::Error::Http(response) => Self::Handshake {
                status: response.status().as_u16(),
            },
            tungstenite::Error::Url(url) => Self::InvalidEndpoint(url.to_string()),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            other => Self::WebSocket(Box::new(other)),
        }
    }
}

impl From<rustls::Error> for ChannelError {
    fn from(err: rustls::Error) -> Self {
        Self::from_rustls(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_certificate_is_untrusted() {
        let err = ChannelError::from(rustls::Error::InvalidCertificate(
            rustls::CertificateError::UnknownIssuer,
        ));
        assert!(err.is_untrusted());
        assert!(err.to_string().contains("UnknownIssuer"));
    }

    #[test]
    fn test_protocol_version_alert_gets_hint() {
        let err = ChannelError::from(rustls::Error::AlertReceived(
            rustls::AlertDescription::ProtocolVersion,
        ));
        assert!(err.to_string().contains(LEGACY_PROTOCOL_HINT));
    }

    #[test]
    fn test_unrelated_tls_error_has_no_hint() {
        let err = ChannelError::from(rustls::Error::General("boom".into()));
        let text = err.to_string();
        assert!(text.contains("boom"));
        assert!(!text.contains(LEGACY_PROTOCOL_HINT));
    }

    #[test]
    fn test_wrapped_io_error_is_classified() {
        let io = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::Expired),
        );
        let err = ChannelError::from(tungstenite::Error::Io(io));
        assert!(err.is_untrusted());
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ChannelError::from(tungstenite::Error::Io(io));
        assert!(matches!(err, ChannelError::Io(_)));
    }
}
