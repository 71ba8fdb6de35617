//! Both TLS layers of the stack.
//!
//! The **outer** layer exists only when the gateway URL is `wss`: it keeps
//! TLS-terminating middleboxes happy and deliberately skips certificate
//! verification, because it carries nothing but the safe tunnel. Trust is
//! anchored entirely in the **safe** layer: TLS with a private CA where the
//! gateway requires and verifies a client certificate, and the client
//! verifies the gateway against the same CA under the configured server
//! name. No application byte crosses the carrier before the safe handshake
//! has completed.

use super::TransportError;
use crate::config::Credentials;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Connector for the outer `wss` layer. Certificate verification is
/// disabled; the safe tunnel authenticates both peers afterwards.
pub fn outer_connector() -> TlsConnector {
    let mut config = ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoVerification));
    TlsConnector::from(Arc::new(config))
}

/// Client config for the safe tunnel: roots from the CA bundle, client
/// certificate presented.
pub fn safe_connector(credentials: &Credentials) -> Result<TlsConnector, TransportError> {
    let roots = root_store(&credentials.ca)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(credentials.certs.clone(), credentials.key.clone_key())
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server config for the safe tunnel. Client certificates are required and
/// verified against the CA bundle; this check is the gateway's sole
/// authentication.
pub fn safe_acceptor(credentials: &Credentials) -> Result<TlsAcceptor, TransportError> {
    let roots = root_store(&credentials.ca)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(credentials.certs.clone(), credentials.key.clone_key())
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Turn a host into a TLS server name, accepting IP addresses.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TransportError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid server name {host:?}: {e}")))
}

fn root_store(ca: &[CertificateDer<'static>]) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in ca {
        roots
            .add(cert.clone())
            .map_err(|e| TransportError::Tls(format!("bad CA certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(TransportError::Tls("no CA certificates".to_string()));
    }
    Ok(roots)
}

/// Accepts any certificate for the outer carrier layer.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
