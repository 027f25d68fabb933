//! Passphrase sealing of private keys at rest.
//!
//! passphrase → Argon2id(passphrase, salt) → master key →
//! HKDF-SHA256(master key, context) → sealing key → ChaCha20-Poly1305.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::error::StoreError;

const SEAL_ALGORITHM: &str = "chacha20-poly1305";
const SEAL_KDF: &str = "argon2id";

/// Argon2id parameters.
const ARGON2_M_COST: u32 = 65536; // 64 MiB
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 4;

/// HKDF info for the sealing key. Must remain stable across versions.
const SEALING_CONTEXT: &str = "fleet-identity/private-key-seal";

/// A sealed private key as stored inside the identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub algorithm: String,
    pub kdf: String,
    /// Base64 Argon2id salt (16 bytes).
    pub salt: String,
    /// Base64 ChaCha20-Poly1305 nonce (12 bytes).
    pub nonce: String,
    /// Base64 ciphertext with authentication tag.
    pub ciphertext: String,
}

/// Seal `plaintext` under `passphrase` with a fresh salt and nonce.
pub fn seal(plaintext: &[u8], passphrase: &str) -> Result<SealedKey, StoreError> {
    let mut salt = [0u8; 16];
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = sealing_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_slice())
        .map_err(|e| StoreError::Sealed(format!("cipher init: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| StoreError::Sealed(format!("encrypt: {e}")))?;

    Ok(SealedKey {
        algorithm: SEAL_ALGORITHM.to_string(),
        kdf: SEAL_KDF.to_string(),
        salt: STANDARD.encode(salt),
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
    })
}

/// Open a sealed key. A wrong passphrase or tampered ciphertext fails AEAD
/// authentication and is reported as [`StoreError::Sealed`].
pub fn open(sealed: &SealedKey, passphrase: &str) -> Result<Zeroizing<Vec<u8>>, StoreError> {
    if sealed.algorithm != SEAL_ALGORITHM || sealed.kdf != SEAL_KDF {
        return Err(StoreError::Format(format!(
            "unsupported seal algorithm={} kdf={}",
            sealed.algorithm, sealed.kdf
        )));
    }

    let salt: [u8; 16] = decode_field(&sealed.salt, "salt")?
        .try_into()
        .map_err(|_| StoreError::Format("seal salt must be 16 bytes".into()))?;
    let nonce: [u8; 12] = decode_field(&sealed.nonce, "nonce")?
        .try_into()
        .map_err(|_| StoreError::Format("seal nonce must be 12 bytes".into()))?;
    let ciphertext = decode_field(&sealed.ciphertext, "ciphertext")?;

    let key = sealing_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_slice())
        .map_err(|e| StoreError::Sealed(format!("cipher init: {e}")))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| StoreError::Sealed("wrong passphrase or corrupted key".into()))?;
    Ok(Zeroizing::new(plaintext))
}

fn sealing_key(passphrase: &str, salt: &[u8; 16]) -> Result<Zeroizing<[u8; 32]>, StoreError> {
    let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(32))
        .map_err(|e| StoreError::Sealed(format!("Argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut master = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut master)
        .map_err(|e| StoreError::Sealed(format!("Argon2 hash: {e}")))?;

    let hk = Hkdf::<Sha256>::new(None, &master);
    master.zeroize();
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(SEALING_CONTEXT.as_bytes(), key.as_mut_slice())
        .map_err(|e| StoreError::Sealed(format!("HKDF expand: {e}")))?;
    Ok(key)
}

fn decode_field(value: &str, name: &str) -> Result<Vec<u8>, StoreError> {
    STANDARD
        .decode(value)
        .map_err(|e| StoreError::Format(format!("invalid seal {name} base64: {e}")))
}
