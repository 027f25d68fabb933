//! CA pins for trust-on-first-use hardening.
//!
//! A pin is `sha256:` followed by the lowercase hex SHA-256 digest of the
//! CA certificate's DER SubjectPublicKeyInfo. Pinning the key rather than
//! the certificate keeps a pin valid across CA re-issuance with the same key.

use sha2::{Digest, Sha256};

use crate::error::{AgentError, Result};
use crate::identity::certs;

const PIN_PREFIX: &str = "sha256:";

/// Compute the pin of a PEM-encoded CA certificate.
pub fn ca_pin(cert_pem: &str) -> Result<String> {
    let info = certs::inspect(cert_pem)?;
    Ok(pin_of_spki(&info.spki_der))
}

/// Pin of a raw DER SubjectPublicKeyInfo.
pub fn pin_of_spki(spki_der: &[u8]) -> String {
    format!("{PIN_PREFIX}{}", hex::encode(Sha256::digest(spki_der)))
}

/// Check that `pin` is well-formed.
pub fn validate_pin(pin: &str) -> Result<()> {
    let digest = pin
        .strip_prefix(PIN_PREFIX)
        .ok_or_else(|| AgentError::Config(format!("CA pin {pin:?} must start with {PIN_PREFIX}")))?;
    let bytes = hex::decode(digest)
        .map_err(|e| AgentError::Config(format!("CA pin {pin:?} is not hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(AgentError::Config(format!(
            "CA pin {pin:?} must be a 32-byte SHA-256 digest"
        )));
    }
    Ok(())
}

/// Return the first CA certificate whose pin appears in `pins`.
///
/// Pins are compared case-insensitively. Certificates that fail to parse
/// are skipped.
pub fn find_pinned<'a>(ca_certs: &'a [String], pins: &[String]) -> Option<&'a String> {
    ca_certs.iter().find(|cert| match ca_pin(cert) {
        Ok(pin) => pins.iter().any(|p| p.eq_ignore_ascii_case(&pin)),
        Err(e) => {
            log::debug!("skipping unparseable CA certificate: {e}");
            false
        }
    })
}
