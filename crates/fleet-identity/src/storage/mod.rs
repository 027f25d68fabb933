//! Durable identity storage.
//!
//! A [`DestinationSpec`] string resolves to a concrete [`IdentityStore`]:
//!
//! ```text
//! dir:/var/lib/fleetbot    → DirectoryStore
//! memory                   → MemoryStore (process-local)
//! ```
//!
//! # Directory layout
//!
//! ```text
//! {root}/
//! ├── identity.json   authoritative record, read back by `load`
//! ├── key             PKCS#8 private key (omitted when sealed)
//! ├── key.pub         OpenSSH public key
//! ├── sshcert         OpenSSH certificate
//! ├── tlscert         PEM X.509 certificate
//! ├── tlscacerts      PEM CA bundle
//! └── sshcacerts      SSH CA public keys
//! ```
//!
//! # Modules
//!
//! - [`dir`]: file-backed store with atomic replace.
//! - [`memory`]: in-memory store.
//! - [`record`]: on-disk record format.

pub mod dir;
pub mod memory;
pub mod record;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Passphrase;
use crate::error::StoreError;
use crate::identity::Identity;

pub use dir::DirectoryStore;
pub use memory::MemoryStore;

/// Storage backend for the single identity of one destination.
pub trait IdentityStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<Identity>, StoreError>;

    /// Replace the stored identity. All-or-nothing: a crash mid-save
    /// leaves the previous identity readable.
    fn save(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Where an identity lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DestinationSpec {
    Directory(PathBuf),
    Memory,
}

impl DestinationSpec {
    /// Parse `dir:<path>` or `memory`.
    pub fn parse(spec: &str) -> Result<Self, StoreError> {
        let spec = spec.trim();
        if spec == "memory" {
            return Ok(Self::Memory);
        }
        match spec.split_once(':') {
            Some(("dir", path)) if !path.is_empty() => Ok(Self::Directory(PathBuf::from(path))),
            Some(("dir", _)) => Err(StoreError::InvalidDestination(
                "dir: destination needs a path".into(),
            )),
            _ => Err(StoreError::InvalidDestination(format!(
                "unrecognised destination {spec:?} (expected dir:<path> or memory)"
            ))),
        }
    }

    /// Build the store this destination names.
    pub fn open(&self, passphrase: Option<Passphrase>) -> Arc<dyn IdentityStore> {
        match self {
            Self::Directory(path) => Arc::new(DirectoryStore::new(path.clone(), passphrase)),
            Self::Memory => Arc::new(MemoryStore::new()),
        }
    }
}

impl std::fmt::Display for DestinationSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Directory(path) => write!(f, "dir:{}", path.display()),
            Self::Memory => f.write_str("memory"),
        }
    }
}

impl std::str::FromStr for DestinationSpec {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DestinationSpec {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DestinationSpec> for String {
    fn from(spec: DestinationSpec) -> Self {
        spec.to_string()
    }
}
