//! File-backed identity store for `dir:<path>` destinations.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::client::CredentialBundle;
use crate::config::Passphrase;
use crate::crypto::keys::KeyMaterial;
use crate::crypto::seal;
use crate::error::StoreError;
use crate::identity::Identity;
use crate::storage::record::IdentityRecord;
use crate::storage::IdentityStore;

pub const RECORD_FILE: &str = "identity.json";
pub const KEY_FILE: &str = "key";
pub const SEALED_KEY_FILE: &str = "key.sealed";
pub const PUBLIC_KEY_FILE: &str = "key.pub";
pub const SSH_CERT_FILE: &str = "sshcert";
pub const TLS_CERT_FILE: &str = "tlscert";
pub const TLS_CA_FILE: &str = "tlscacerts";
pub const SSH_CA_FILE: &str = "sshcacerts";
pub const USERS_DIR: &str = "users";

/// Identity store rooted at one directory.
///
/// Only `identity.json` is read back; the other files are exports for
/// external tooling and are rewritten before the record is committed.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    passphrase: Option<Passphrase>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>, passphrase: Option<Passphrase>) -> Self {
        Self {
            root: root.into(),
            passphrase,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self) -> PathBuf {
        self.root.join(RECORD_FILE)
    }

    /// Export delegated credentials to `{root}/users/{principal}/`.
    ///
    /// With a passphrase the private key goes to `key.sealed` as a sealed
    /// JSON blob and no plaintext `key` is left behind.
    pub fn save_user_credentials(
        &self,
        keys: &KeyMaterial,
        bundle: &CredentialBundle,
    ) -> Result<PathBuf, StoreError> {
        let principal = bundle.principal.as_str();
        if principal.is_empty()
            || principal == "."
            || principal == ".."
            || principal.contains(['/', '\\'])
        {
            return Err(StoreError::InvalidDestination(format!(
                "principal {principal:?} is not usable as a directory name"
            )));
        }
        self.ensure_root()?;
        let dir = self.root.join(USERS_DIR).join(principal);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        match &self.passphrase {
            Some(p) => {
                let sealed = seal::seal(keys.private_key_pem().as_bytes(), p.expose())?;
                let json = serde_json::to_string_pretty(&sealed)
                    .map_err(|e| StoreError::Format(e.to_string()))?;
                write_atomic(&dir.join(SEALED_KEY_FILE), json.as_bytes())?;
                remove_if_present(&dir.join(KEY_FILE))?;
            }
            None => {
                write_atomic(&dir.join(KEY_FILE), keys.private_key_pem().as_bytes())?;
                remove_if_present(&dir.join(SEALED_KEY_FILE))?;
            }
        }
        write_atomic(&dir.join(PUBLIC_KEY_FILE), line(keys.ssh_public_key()).as_bytes())?;
        write_atomic(&dir.join(SSH_CERT_FILE), line(&bundle.ssh_cert).as_bytes())?;
        write_atomic(&dir.join(TLS_CERT_FILE), bundle.tls_cert.as_bytes())?;
        write_atomic(&dir.join(TLS_CA_FILE), bundle.tls_ca_certs.concat().as_bytes())?;
        Ok(dir)
    }

    fn ensure_root(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| StoreError::io(&self.root, e))?;
        }
        Ok(())
    }
}

impl IdentityStore for DirectoryStore {
    fn load(&self) -> Result<Option<Identity>, StoreError> {
        let path = self.record_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let record = IdentityRecord::from_json(&bytes)?;
        record.into_identity(self.passphrase.as_ref()).map(Some)
    }

    fn save(&self, identity: &Identity) -> Result<(), StoreError> {
        self.ensure_root()?;
        let record = IdentityRecord::from_identity(identity, self.passphrase.as_ref())?;

        if record.private_key.is_sealed() {
            // A plaintext export from an earlier unsealed save must not survive.
            remove_if_present(&self.root.join(KEY_FILE))?;
        } else {
            write_atomic(&self.root.join(KEY_FILE), identity.private_key_pem().as_bytes())?;
        }
        write_atomic(
            &self.root.join(PUBLIC_KEY_FILE),
            line(identity.ssh_public_key()).as_bytes(),
        )?;
        write_atomic(
            &self.root.join(SSH_CERT_FILE),
            line(&identity.certs.ssh_cert).as_bytes(),
        )?;
        write_atomic(&self.root.join(TLS_CERT_FILE), identity.certs.tls_cert.as_bytes())?;
        write_atomic(
            &self.root.join(TLS_CA_FILE),
            identity.certs.tls_ca_certs.concat().as_bytes(),
        )?;
        let ssh_cas: String = identity.certs.ssh_ca_keys.iter().map(|k| line(k)).collect();
        write_atomic(&self.root.join(SSH_CA_FILE), ssh_cas.as_bytes())?;

        // The record goes last: it is the commit point.
        write_atomic(&self.record_path(), record.to_json()?.as_bytes())?;
        log::debug!("identity {} saved to {}", identity.id, self.root.display());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }
}

fn line(s: &str) -> String {
    let mut out = s.trim_end().to_string();
    out.push('\n');
    out
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Write `data` to `path` through a sibling temp file: write, fsync,
/// rename, then fsync the directory. Files are created `0600`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidDestination(format!("bad path {}", path.display())))?;
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(&tmp_path)
        .map_err(|e| StoreError::io(&tmp_path, e))?;
    file.write_all(data)
        .map_err(|e| StoreError::io(&tmp_path, e))?;
    file.sync_all().map_err(|e| StoreError::io(&tmp_path, e))?;
    drop(file);

    std::fs::rename(&tmp_path, path).map_err(|e| StoreError::io(path, e))?;

    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
