//! TLS material for the secure socket transport.
//!
//! The server presents a process-local self-signed certificate whose only
//! subject name is the server identity string. Clients do not match the
//! certificate against the address they dialled; they match it against the
//! identity they expect to reach, so a certificate for any other identity is
//! rejected as an invalid certificate.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Self-signed certificate and TLS server configuration for one identity.
pub struct ServerIdentity {
    name: String,
    certificate: CertificateDer<'static>,
    config: Arc<ServerConfig>,
}

impl ServerIdentity {
    /// Generate a fresh key pair and certificate for `name`.
    pub fn generate(name: &str) -> Result<Self> {
        parse_identity(name)?;

        let certified = rcgen::generate_simple_self_signed(vec![name.to_string()])?;
        let certificate = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![certificate.clone()], key)?;

        info!(identity = name, "generated self-signed server identity");

        Ok(Self {
            name: name.to_string(),
            certificate,
            config: Arc::new(config),
        })
    }

    /// The identity string the certificate was issued for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// DER encoding of the certificate.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    /// Shared server configuration presenting this identity.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("name", &self.name)
            .field("certificate", &format_args!("<{} bytes>", self.certificate.len()))
            .finish()
    }
}

/// Client configuration that trusts exactly the certificates issued for
/// `expected_identity`.
pub fn client_config(expected_identity: &str) -> Result<Arc<ClientConfig>> {
    let expected = parse_identity(expected_identity)?;
    let provider = provider();
    let verifier = IdentityVerifier {
        expected,
        algorithms: provider.signature_verification_algorithms,
    };

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Whether an I/O error from a TLS handshake was caused by the peer's
/// certificate being rejected.
pub fn is_identity_mismatch(err: &std::io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|tls| matches!(tls, rustls::Error::InvalidCertificate(_)))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn parse_identity(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|_| TransportError::InvalidIdentity(name.to_string()))
}

#[derive(Debug)]
struct IdentityVerifier {
    expected: ServerName<'static>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for IdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let parsed = ParsedCertificate::try_from(end_entity)?;
        if let Err(err) = rustls::client::verify_server_name(&parsed, &self.expected) {
            debug!(expected = ?self.expected, "peer certificate identity mismatch");
            return Err(err);
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
