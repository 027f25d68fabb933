//! rustls client configurations.
//!
//! Three channels exist over the life of an agent:
//!
//! - `Insecure`: first contact, server certificate not verified. Only used
//!   to fetch the cluster CA (and, without pins, to register).
//! - `Pinned`: trusts only a CA that matched a configured pin.
//! - `Mutual`: trusts the identity's CA bundle and presents its certificate.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{AgentError, Result};
use crate::identity::{certs, Identity};

/// Trust mode of a TLS channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Insecure,
    Pinned,
    Mutual,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Insecure => "insecure",
            Self::Pinned => "pinned",
            Self::Mutual => "mutual",
        };
        f.write_str(s)
    }
}

/// A client TLS configuration labelled with its trust mode.
#[derive(Clone)]
pub struct TlsChannel {
    pub kind: ChannelKind,
    pub config: Arc<ClientConfig>,
}

impl std::fmt::Debug for TlsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsChannel")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl TlsChannel {
    /// Accepts any server certificate.
    pub fn insecure() -> Result<Self> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let verifier = AcceptAnyServerCert {
            provider: provider.clone(),
        };
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        Ok(Self {
            kind: ChannelKind::Insecure,
            config: Arc::new(config),
        })
    }

    /// Trusts only the given CA certificates.
    pub fn pinned(ca_certs: &[String]) -> Result<Self> {
        let roots = root_store(ca_certs)?;
        let config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            kind: ChannelKind::Pinned,
            config: Arc::new(config),
        })
    }

    /// Mutual TLS with the identity's certificate and CA bundle.
    pub fn mutual(identity: &Identity) -> Result<Self> {
        let roots = root_store(&identity.certs.tls_ca_certs)?;
        let cert = certs::decode_pem(&identity.certs.tls_cert, "CERTIFICATE")
            .map_err(|e| AgentError::TlsConfig(e.to_string()))?;
        let key = certs::decode_pem(identity.private_key_pem(), "PRIVATE KEY")
            .map_err(|_| AgentError::TlsConfig("private key is not PKCS#8 PEM".into()))?;

        let config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_root_certificates(roots)
            .with_client_auth_cert(
                vec![CertificateDer::from(cert)],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key)),
            )
            .map_err(tls_err)?;
        Ok(Self {
            kind: ChannelKind::Mutual,
            config: Arc::new(config),
        })
    }
}

fn root_store(ca_certs: &[String]) -> Result<RootCertStore> {
    if ca_certs.is_empty() {
        return Err(AgentError::TlsConfig("no CA certificates to trust".into()));
    }
    let mut roots = RootCertStore::empty();
    for pem in ca_certs {
        let der = certs::decode_pem(pem, "CERTIFICATE")
            .map_err(|e| AgentError::TlsConfig(e.to_string()))?;
        roots.add(CertificateDer::from(der)).map_err(tls_err)?;
    }
    Ok(roots)
}

fn tls_err(e: rustls::Error) -> AgentError {
    AgentError::TlsConfig(e.to_string())
}

/// Server verifier for the insecure bootstrap channel. Handshake signatures
/// are still checked so the session key is bound to the presented cert.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
