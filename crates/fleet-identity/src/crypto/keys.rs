//! Key material generation.
//!
//! A host identity is backed by one Ed25519 key pair. The private half is
//! kept as PKCS#8 PEM; the public half is exported twice, once in OpenSSH
//! `authorized_keys` form for SSH certificate issuance and once as a PEM
//! SubjectPublicKeyInfo for TLS certificate issuance. Both encodings are
//! pure functions of the private key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::error::{AgentError, Result};

/// SSH wire name for Ed25519 keys.
const SSH_ED25519: &str = "ssh-ed25519";

/// Key algorithms the generator can produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyType {
    #[default]
    Ed25519,
}

/// Freshly generated (or reloaded) key material for one identity.
///
/// The PEM private key is zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    private_key_pem: Zeroizing<String>,
    ssh_public_key: String,
    tls_public_key: String,
}

impl KeyMaterial {
    /// Generate a new key pair. Consumes entropy from the OS and touches no
    /// shared state, so concurrent callers are safe.
    pub fn generate(key_type: KeyType) -> Result<Self> {
        Self::generate_with(key_type, &mut OsRng)
    }

    /// Generate from `rng`. A failing entropy source is reported as
    /// [`AgentError::KeyGeneration`].
    pub fn generate_with<R: CryptoRng + RngCore>(key_type: KeyType, rng: &mut R) -> Result<Self> {
        match key_type {
            KeyType::Ed25519 => {
                let mut seed = Zeroizing::new([0u8; 32]);
                rng.try_fill_bytes(&mut seed[..])
                    .map_err(|e| AgentError::KeyGeneration(format!("entropy source failed: {e}")))?;
                let signing_key = SigningKey::from_bytes(&seed);
                Self::from_signing_key(&signing_key)
            }
        }
    }

    /// Rebuild key material from a PKCS#8 PEM private key, re-deriving both
    /// public encodings.
    pub fn from_private_key_pem(pem: &str) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| AgentError::KeyGeneration(format!("invalid PKCS#8 private key: {e}")))?;
        Self::from_signing_key(&signing_key)
    }

    fn from_signing_key(signing_key: &SigningKey) -> Result<Self> {
        let private_key_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AgentError::KeyGeneration(format!("PKCS#8 encoding: {e}")))?;
        let verifying_key = signing_key.verifying_key();
        let tls_public_key = verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AgentError::KeyGeneration(format!("SPKI encoding: {e}")))?;

        Ok(Self {
            private_key_pem,
            ssh_public_key: ssh_authorized_key(&verifying_key),
            tls_public_key,
        })
    }

    /// PKCS#8 PEM private key.
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Public key in OpenSSH `authorized_keys` format.
    pub fn ssh_public_key(&self) -> &str {
        &self.ssh_public_key
    }

    /// Public key as PEM SubjectPublicKeyInfo.
    pub fn tls_public_key(&self) -> &str {
        &self.tls_public_key
    }

    /// Split into `(private key PEM, SSH public key, TLS public key)`.
    pub fn into_parts(self) -> (Zeroizing<String>, String, String) {
        (self.private_key_pem, self.ssh_public_key, self.tls_public_key)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("ssh_public_key", &self.ssh_public_key)
            .finish_non_exhaustive()
    }
}

/// Encode a verifying key as an OpenSSH public key line.
///
/// The blob is the SSH wire encoding: `string "ssh-ed25519"` followed by
/// `string key`, each prefixed with a big-endian u32 length.
pub fn ssh_authorized_key(key: &VerifyingKey) -> String {
    let mut blob = Vec::with_capacity(4 + SSH_ED25519.len() + 4 + 32);
    push_ssh_string(&mut blob, SSH_ED25519.as_bytes());
    push_ssh_string(&mut blob, key.as_bytes());
    format!("{SSH_ED25519} {}", STANDARD.encode(blob))
}

fn push_ssh_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

/// Parse an OpenSSH Ed25519 public key line back into a verifying key.
pub fn parse_ssh_authorized_key(line: &str) -> Result<VerifyingKey> {
    let mut fields = line.split_whitespace();
    let (Some(kind), Some(b64)) = (fields.next(), fields.next()) else {
        return Err(AgentError::InvalidIdentity("SSH public key is empty".into()));
    };
    if kind != SSH_ED25519 {
        return Err(AgentError::InvalidIdentity(format!(
            "unsupported SSH key type {kind}"
        )));
    }
    let blob = STANDARD
        .decode(b64)
        .map_err(|e| AgentError::InvalidIdentity(format!("SSH public key base64: {e}")))?;

    let mut rest = blob.as_slice();
    let name = read_ssh_string(&mut rest, "SSH key blob")?;
    if name != SSH_ED25519.as_bytes() {
        return Err(AgentError::InvalidIdentity(
            "SSH key blob type does not match".into(),
        ));
    }
    let key: [u8; 32] = read_ssh_string(&mut rest, "SSH key blob")?
        .try_into()
        .map_err(|_| AgentError::InvalidIdentity("SSH key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&key)
        .map_err(|e| AgentError::InvalidIdentity(format!("SSH key: {e}")))
}

/// Read one length-prefixed SSH wire string and advance `rest` past it.
/// `what` names the blob in the error.
pub(crate) fn read_ssh_string<'a>(rest: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    let truncated = || AgentError::InvalidIdentity(format!("truncated {what}"));
    let len_bytes: [u8; 4] = rest
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(truncated)?;
    let len = usize::try_from(u32::from_be_bytes(len_bytes)).map_err(|_| truncated())?;
    let tail = &rest[4..];
    if tail.len() < len {
        return Err(truncated());
    }
    let (data, tail) = tail.split_at(len);
    *rest = tail;
    Ok(data)
}
