//! Retrieval of a daemon's certificate chain.
//!
//! Opens a TLS connection that accepts any certificate, reads the peer
//! chain and hangs up. Nothing is validated: the caller decides whether to
//! trust what comes back, typically by supplying it as the CA for
//! subsequent connections.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::ChannelError;
use crate::tls::AcceptAnyVerifier;

const RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A certificate presented by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    der: CertificateDer<'static>,
}

impl PeerCertificate {
    /// DER encoding.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        self.der.as_ref()
    }

    /// PEM encoding, suitable for use as a CA.
    #[must_use]
    pub fn to_pem(&self) -> String {
        let encoded = STANDARD.encode(self.der.as_ref());
        let mut pem = String::with_capacity(encoded.len() + encoded.len() / 64 + 64);
        pem.push_str("-----BEGIN CERTIFICATE-----\n");
        for line in encoded.as_bytes().chunks(64) {
            // base64 output is ASCII
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }
}

/// Fetch the full chain presented by `host:port`, leaf first.
pub async fn get_certificate_chain(
    host: &str,
    port: u16,
) -> Result<Vec<PeerCertificate>, ChannelError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ChannelError::InvalidEndpoint(e.to_string()))?;
    let connector = TlsConnector::from(AcceptAnyVerifier::client_config()?);

    let handshake = async {
        let tcp = TcpStream::connect((host, port)).await?;
        connector.connect(server_name, tcp).await
    };
    let stream = tokio::time::timeout(RETRIEVAL_TIMEOUT, handshake)
        .await
        .map_err(|_| ChannelError::Timeout(RETRIEVAL_TIMEOUT))?
        .map_err(ChannelError::Io)?;

    let (_, session) = stream.get_ref();
    let chain: Vec<PeerCertificate> = session
        .peer_certificates()
        .unwrap_or_default()
        .iter()
        .map(|der| PeerCertificate {
            der: der.clone().into_owned(),
        })
        .collect();

    tracing::debug!(host = %host, port = port, certificates = chain.len(), "retrieved certificate chain");
    Ok(chain)
}

/// Fetch the root of the chain presented by `host:port` (its last entry).
pub async fn get_certificate(host: &str, port: u16) -> Result<PeerCertificate, ChannelError> {
    get_certificate_chain(host, port)
        .await?
        .pop()
        .ok_or_else(|| ChannelError::Certificate("server presented no certificate".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pem_wraps_at_64_columns() {
        let cert = PeerCertificate {
            der: CertificateDer::from(vec![0xABu8; 100]),
        };
        let pem = cert.to_pem();
        let lines: Vec<&str> = pem.lines().collect();

        assert_eq!(lines.first(), Some(&"-----BEGIN CERTIFICATE-----"));
        assert_eq!(lines.last(), Some(&"-----END CERTIFICATE-----"));
        assert!(lines[1..lines.len() - 1].iter().all(|l| l.len() <= 64));
        assert_eq!(lines[1].len(), 64);
    }

    #[test]
    fn test_pem_round_trips_through_parser() {
        let cert = PeerCertificate {
            der: CertificateDer::from(vec![1u8, 2, 3, 4, 5]),
        };
        let parsed = crate::tls::parse_pem_certificate(&cert.to_pem());
        assert_eq!(parsed.ok().as_deref(), Some(cert.der()));
    }
}
