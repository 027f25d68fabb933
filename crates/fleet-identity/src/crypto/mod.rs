//! Cryptographic primitives for fleet-identity.
//!
//! This module provides:
//! - Ed25519 key generation with SSH and TLS public encodings
//! - Passphrase sealing of private keys (Argon2id, HKDF-SHA256, ChaCha20-Poly1305)
//! - CA pin computation for trust-on-first-use

pub mod keys;
pub mod pin;
pub mod seal;
