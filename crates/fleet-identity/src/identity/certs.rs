//! Certificate inspection helpers.
//!
//! Only what the agent needs to decide things locally: validity window,
//! subject public key, and the key embedded in an OpenSSH certificate.
//! Chain verification is left to the TLS stack.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use x509_parser::parse_x509_certificate;

use crate::crypto::keys::read_ssh_string;
use crate::error::{AgentError, Result};

/// Key type string of an OpenSSH Ed25519 user/host certificate.
pub const SSH_ED25519_CERT: &str = "ssh-ed25519-cert-v01@openssh.com";

/// Parsed view of an X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DER SubjectPublicKeyInfo.
    pub spki_der: Vec<u8>,
    /// Raw signature bits.
    pub signature: Vec<u8>,
}

impl CertInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }
}

/// Decode one PEM block with the given tag.
pub fn decode_pem(input: &str, tag: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(input)
        .map_err(|e| AgentError::InvalidIdentity(format!("invalid {tag} PEM: {e}")))?;
    if block.tag() != tag {
        return Err(AgentError::InvalidIdentity(format!(
            "expected {tag} PEM block, found {}",
            block.tag()
        )));
    }
    Ok(block.contents().to_vec())
}

/// Parse a PEM certificate.
pub fn inspect(cert_pem: &str) -> Result<CertInfo> {
    let der = decode_pem(cert_pem, "CERTIFICATE")?;
    inspect_der(&der)
}

/// Parse a DER certificate.
pub fn inspect_der(der: &[u8]) -> Result<CertInfo> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| AgentError::InvalidIdentity(format!("invalid X.509 certificate: {e}")))?;

    let validity = cert.validity();
    Ok(CertInfo {
        subject: cert.subject().to_string(),
        not_before: to_utc(validity.not_before.timestamp())?,
        not_after: to_utc(validity.not_after.timestamp())?,
        spki_der: cert.public_key().raw.to_vec(),
        signature: cert.signature_value.data.to_vec(),
    })
}

/// DER SubjectPublicKeyInfo of a PEM `PUBLIC KEY`.
pub fn public_key_spki(public_key_pem: &str) -> Result<Vec<u8>> {
    decode_pem(public_key_pem, "PUBLIC KEY")
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
        AgentError::InvalidIdentity(format!("certificate time {timestamp} out of range"))
    })
}

/// Leading fields of an OpenSSH certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCertInfo {
    pub key_type: String,
    /// Raw 32-byte Ed25519 key the certificate binds.
    pub public_key: Vec<u8>,
}

/// Parse the `<type> <base64>` line of an OpenSSH certificate far enough to
/// recover the certified key: `string type, string nonce, string pk, ...`.
pub fn inspect_ssh_cert(line: &str) -> Result<SshCertInfo> {
    let mut fields = line.split_whitespace();
    let (Some(kind), Some(b64)) = (fields.next(), fields.next()) else {
        return Err(AgentError::InvalidIdentity("SSH certificate is empty".into()));
    };
    if kind != SSH_ED25519_CERT {
        return Err(AgentError::InvalidIdentity(format!(
            "unsupported SSH certificate type {kind}"
        )));
    }
    let blob = STANDARD
        .decode(b64)
        .map_err(|e| AgentError::InvalidIdentity(format!("SSH certificate base64: {e}")))?;

    let mut rest = blob.as_slice();
    let key_type = read_ssh_string(&mut rest, "SSH certificate")?;
    if key_type != kind.as_bytes() {
        return Err(AgentError::InvalidIdentity(
            "SSH certificate blob type does not match".into(),
        ));
    }
    let _nonce = read_ssh_string(&mut rest, "SSH certificate")?;
    let public_key = read_ssh_string(&mut rest, "SSH certificate")?;

    Ok(SshCertInfo {
        key_type: kind.to_string(),
        public_key: public_key.to_vec(),
    })
}
