//! TLS client configuration and trust policy.

use std::io::BufReader;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::endpoint::TlsOptions;
use crate::error::ChannelError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse the first certificate of a PEM document.
pub fn parse_pem_certificate(pem: &str) -> Result<CertificateDer<'static>, ChannelError> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| ChannelError::Certificate("no certificate found in PEM data".into()))?
        .map_err(|e| ChannelError::Certificate(e.to_string()))
}

/// Whether a certificate's subject equals its issuer.
pub fn is_self_signed(cert: &CertificateDer<'_>) -> Result<bool, ChannelError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| ChannelError::Certificate(e.to_string()))?;
    Ok(parsed.subject().as_raw() == parsed.issuer().as_raw())
}

/// Effective "reject unauthorized" flag for the given options.
///
/// An explicit override wins. Otherwise unauthorized servers are rejected
/// unless the supplied CA is self-signed, i.e. an internal CA that the
/// caller chose to trust directly.
pub fn reject_unauthorized(opts: &TlsOptions) -> Result<bool, ChannelError> {
    if let Some(reject) = opts.reject_unauthorized {
        return Ok(reject);
    }
    match &opts.ca {
        Some(pem) => Ok(!is_self_signed(&parse_pem_certificate(pem)?)?),
        None => Ok(true),
    }
}

/// Build the rustls client configuration for the given trust options.
pub fn build_client_config(opts: &TlsOptions) -> Result<Arc<ClientConfig>, ChannelError> {
    let reject = reject_unauthorized(opts)?;
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = match (&opts.ca, reject) {
        (Some(pem), true) => {
            let ca = parse_pem_certificate(pem)?;
            let mut roots = RootCertStore::empty();
            roots.add(ca)?;
            tracing::debug!("trusting supplied CA as the only root");
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        (Some(pem), false) => {
            let ca = parse_pem_certificate(pem)?;
            tracing::debug!("pinning supplied self-signed certificate");
            let verifier = PinnedCertVerifier::new(ca, provider)?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth()
        }
        (None, true) => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        (None, false) => {
            tracing::warn!("server certificate validation is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyVerifier::new(provider)))
                .with_no_client_auth()
        }
    };

    Ok(Arc::new(config))
}

/// Trusts exactly one certificate: either presented directly as the end
/// entity, or as the sole root of the presented chain.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned: CertificateDer<'static>,
    chain: Arc<WebPkiServerVerifier>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    fn new(
        pinned: CertificateDer<'static>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, ChannelError> {
        let mut roots = RootCertStore::empty();
        roots.add(pinned.clone())?;
        let chain = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| ChannelError::Certificate(e.to_string()))?;

        Ok(Self {
            pinned,
            chain,
            provider,
        })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            return Ok(ServerCertVerified::assertion());
        }
        self.chain
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
pub(crate) struct AcceptAnyVerifier {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyVerifier {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }

    pub(crate) fn client_config() -> Result<Arc<ClientConfig>, ChannelError> {
        let provider = provider();
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(Self::new(provider)))
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

impl ServerCertVerifier for AcceptAnyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
