//! Resilience tests: corrupted records, interrupted saves, tampered data.

#[path = "../support/mod.rs"]
mod support;

use fleet_identity::storage::dir::{RECORD_FILE, TLS_CERT_FILE};
use fleet_identity::storage::dir::write_atomic;
use fleet_identity::{DirectoryStore, IdentityStore, Passphrase, Role, StoreError};

use support::FakeAuthority;

fn saved_store() -> (tempfile::TempDir, DirectoryStore, fleet_identity::Identity) {
    let tmp = tempfile::tempdir().unwrap();
    let store = DirectoryStore::new(tmp.path(), None);
    let identity = FakeAuthority::new().issue_identity(Role::Bot, "resilient");
    store.save(&identity).unwrap();
    (tmp, store, identity)
}

fn edit_record(store: &DirectoryStore, edit: impl FnOnce(&mut serde_json::Value)) {
    let path = store.record_path();
    let mut record: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    edit(&mut record);
    std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();
}

#[test]
fn resilience_corrupted_record_detected() {
    let (_tmp, store, _identity) = saved_store();
    let path = store.record_path();

    let mut data = std::fs::read(&path).unwrap();
    for item in data.iter_mut().take(60).skip(40) {
        *item ^= 0xFF;
    }
    std::fs::write(&path, data).unwrap();

    let err = store.load().unwrap_err();
    assert!(err.is_format_error(), "corrupted record should be a format error: {err}");
}

#[test]
fn resilience_truncated_record_detected() {
    let (_tmp, store, _identity) = saved_store();
    let path = store.record_path();

    let data = std::fs::read(&path).unwrap();
    std::fs::write(&path, &data[..data.len() / 2]).unwrap();

    assert!(matches!(store.load(), Err(StoreError::Format(_))));
}

#[test]
fn resilience_empty_record_detected() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join(RECORD_FILE), b"").unwrap();

    let store = DirectoryStore::new(tmp.path(), None);
    assert!(matches!(store.load(), Err(StoreError::Format(_))));
}

#[test]
fn resilience_missing_directory_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DirectoryStore::new(tmp.path().join("never-created"), None);
    assert!(store.load().unwrap().is_none());
}

#[test]
fn resilience_save_creates_parent_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DirectoryStore::new(tmp.path().join("a").join("b").join("c"), None);
    let identity = FakeAuthority::new().issue_identity(Role::Node, "deep-save");

    store.save(&identity).unwrap();
    assert_eq!(store.load().unwrap().unwrap().id, identity.id);
}

#[test]
fn resilience_tampered_public_key_detected() {
    let (_tmp, store, _identity) = saved_store();
    let other = FakeAuthority::new().issue_identity(Role::Bot, "other");
    edit_record(&store, |record| {
        record["ssh_public_key"] = serde_json::Value::String(other.ssh_public_key().into());
    });

    assert!(matches!(store.load(), Err(StoreError::Format(_))));
}

#[test]
fn resilience_future_record_version_rejected() {
    let (_tmp, store, _identity) = saved_store();
    edit_record(&store, |record| record["version"] = 99.into());

    match store.load() {
        Err(StoreError::UnsupportedVersion { version, .. }) => assert_eq!(version, 99),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn resilience_interrupted_save_keeps_previous_identity() {
    let (tmp, store, identity) = saved_store();

    // A crash after the temp file was written but before the rename.
    std::fs::write(tmp.path().join(format!(".{RECORD_FILE}.tmp")), b"{\"partial\":").unwrap();

    assert_eq!(store.load().unwrap().unwrap(), identity);

    // The next save overwrites the stale temp file.
    let next = FakeAuthority::new().issue_identity(Role::Bot, "resilient");
    store.save(&next).unwrap();
    assert_eq!(store.load().unwrap().unwrap(), next);
}

#[test]
fn resilience_exports_are_not_read_back() {
    let (tmp, store, identity) = saved_store();
    std::fs::remove_file(tmp.path().join(TLS_CERT_FILE)).unwrap();
    write_atomic(&tmp.path().join("sshcert"), b"garbage").unwrap();

    assert_eq!(store.load().unwrap().unwrap(), identity);
}

#[test]
fn resilience_wrong_passphrase_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let identity = FakeAuthority::new().issue_identity(Role::Bot, "sealed");
    DirectoryStore::new(tmp.path(), Some(Passphrase::new("correct_password")))
        .save(&identity)
        .unwrap();

    let result = DirectoryStore::new(tmp.path(), Some(Passphrase::new("wrong_password"))).load();
    assert!(matches!(result, Err(StoreError::Sealed(_))));
}

#[test]
fn resilience_record_roundtrip_repeated() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DirectoryStore::new(tmp.path(), None);
    let authority = FakeAuthority::new();

    for i in 0..25 {
        let identity = authority.issue_identity(Role::Bot, &format!("roundtrip-{i}"));
        store.save(&identity).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), identity, "roundtrip {i} failed");
    }
}

#[cfg(unix)]
#[test]
fn resilience_record_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let (_tmp, store, _identity) = saved_store();
    let mode = std::fs::metadata(store.record_path())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o077, 0, "record must not be group/world accessible");
}
