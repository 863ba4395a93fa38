//! Throwaway certificates for the mock daemon.

use std::net::{IpAddr, Ipv4Addr};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// A server certificate chain, its key, and the certificate a client
/// should trust.
#[derive(Debug, Clone)]
pub struct TestCertificates {
    chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
    trust_anchor_pem: String,
    trust_anchor_der: CertificateDer<'static>,
}

fn leaf_params() -> Result<CertificateParams, rcgen::Error> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.distinguished_name.push(DnType::CommonName, "localhost");
    params.subject_alt_names = vec![
        SanType::DnsName("localhost".try_into()?),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    Ok(params)
}

impl TestCertificates {
    /// A single self-signed certificate for `localhost` and `127.0.0.1`.
    pub fn self_signed() -> Result<Self, rcgen::Error> {
        let key = KeyPair::generate()?;
        let cert = leaf_params()?.self_signed(&key)?;

        Ok(Self {
            chain: vec![cert.der().clone()],
            key_der: key.serialize_der(),
            trust_anchor_pem: cert.pem(),
            trust_anchor_der: cert.der().clone(),
        })
    }

    /// A leaf signed by a freshly generated CA. The CA is the trust anchor
    /// and is sent as the last certificate of the chain.
    pub fn with_ca() -> Result<Self, rcgen::Error> {
        let ca_key = KeyPair::generate()?;
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "Mapepire Test CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key)?;

        let key = KeyPair::generate()?;
        let leaf = leaf_params()?.signed_by(&key, &ca, &ca_key)?;

        Ok(Self {
            chain: vec![leaf.der().clone(), ca.der().clone()],
            key_der: key.serialize_der(),
            trust_anchor_pem: ca.pem(),
            trust_anchor_der: ca.der().clone(),
        })
    }

    /// Chain presented by the server, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Private key of the leaf.
    #[must_use]
    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key_der.clone()).into()
    }

    /// PEM of the certificate clients should trust.
    #[must_use]
    pub fn trust_anchor_pem(&self) -> &str {
        &self.trust_anchor_pem
    }

    /// DER of the certificate clients should trust.
    #[must_use]
    pub fn trust_anchor_der(&self) -> &CertificateDer<'static> {
        &self.trust_anchor_der
    }
}
