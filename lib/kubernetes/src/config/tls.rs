use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_native_certs::CertificateResult;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse PEM failed: {0}")]
    Pem(#[from] pem::PemError),

    #[error("client identity has no private key, PKCS8, PKCS1 and SEC1 keys are accepted")]
    MissingPrivateKey,

    #[error("client identity has no certificate")]
    MissingCertificate,

    #[error("unexpected PEM section \"{0}\" in client identity")]
    UnsupportedSection(String),

    #[error("add root certificate failed: {0}")]
    RootCertificate(#[source] rustls::Error),

    #[error("client certificate or key rejected: {0}")]
    ClientAuth(#[source] rustls::Error),
}

/// Certificate chain and private key presented to the API server.
pub struct Identity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Parse concatenated PEM sections, in any order. When more than one key is
    /// present the first one is used.
    pub fn from_pem(data: &[u8]) -> Result<Self, Error> {
        let mut chain = Vec::new();
        let mut key = None;

        for section in pem::parse_many(data)? {
            let tag = section.tag().to_string();
            let parsed = match tag.as_str() {
                "CERTIFICATE" => {
                    chain.push(CertificateDer::from(section.into_contents()));
                    continue;
                }
                "PRIVATE KEY" => PrivateKeyDer::Pkcs8(section.into_contents().into()),
                "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(section.into_contents().into()),
                "EC PRIVATE KEY" => PrivateKeyDer::Sec1(section.into_contents().into()),
                _ => return Err(Error::UnsupportedSection(tag)),
            };

            if key.is_none() {
                key = Some(parsed);
            }
        }

        let key = key.ok_or(Error::MissingPrivateKey)?;
        if chain.is_empty() {
            return Err(Error::MissingCertificate);
        }

        Ok(Identity { chain, key })
    }
}

/// Root store holding every CERTIFICATE section of `data`, other sections are skipped.
pub fn roots_from_pem(data: &[u8]) -> Result<RootCertStore, Error> {
    let mut store = RootCertStore::empty();
    for section in pem::parse_many(data)? {
        if section.tag() != "CERTIFICATE" {
            continue;
        }

        store
            .add(CertificateDer::from(section.into_contents()))
            .map_err(Error::RootCertificate)?;
    }

    Ok(store)
}

/// Root store of the platform. Certificates which cannot be loaded are logged and
/// skipped, an empty store only fails once a connection is made.
pub fn native_roots() -> RootCertStore {
    let CertificateResult { certs, errors, .. } = rustls_native_certs::load_native_certs();
    for err in errors {
        debug!(message = "load native certificate failed", %err);
    }

    let mut store = RootCertStore::empty();
    let (_, ignored) = store.add_parsable_certificates(certs);
    if ignored > 0 {
        debug!(message = "invalid native root certificates ignored", count = ignored);
    }
    if store.is_empty() {
        warn!(message = "no valid native root certificates found");
    }

    store
}

pub fn client_config(
    roots: RootCertStore,
    identity: Option<Identity>,
    insecure_skip_verify: bool,
) -> Result<ClientConfig, Error> {
    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match identity {
        Some(Identity { chain, key }) => builder
            .with_client_auth_cert(chain, key)
            .map_err(Error::ClientAuth)?,
        None => builder.with_no_client_auth(),
    };

    if insecure_skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Ok(config)
}

/// Accepts any server certificate, used when `insecure-skip-tls-verify` is set.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        debug!(message = "api server certificate not verified", server = ?server_name);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
