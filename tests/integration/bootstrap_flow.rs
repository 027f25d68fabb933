//! Integration test: the load-or-register bootstrap decision.
//!
//! Covers first registration, reuse of a stored identity without network
//! access, CA pinning, rejected tokens and the on-load-failure policies.

#[path = "../support/mod.rs"]
mod support;

use std::sync::Arc;

use fleet_identity::client::ChannelKind;
use fleet_identity::storage::dir::{KEY_FILE, RECORD_FILE};
use fleet_identity::{
    AgentError, DestinationSpec, DirectoryStore, IdentityStore, JoinToken, LoadFailurePolicy,
    MemoryStore, Passphrase, Registrar, RegistrarState, RegistrationError, Role, StoreError,
};

use support::{FakeAuthority, FakeTransport, CLUSTER, TOKEN};

#[tokio::test]
async fn empty_store_registers_and_persists() {
    let authority = FakeAuthority::new();
    let transport = FakeTransport::new(&authority);
    let store = Arc::new(MemoryStore::new());
    let config = support::config(DestinationSpec::Memory);

    let mut registrar = Registrar::new(&config, store.clone(), transport);
    let identity = registrar.bootstrap().await.unwrap();

    assert_eq!(
        registrar.history(),
        &[
            RegistrarState::NoIdentity,
            RegistrarState::Registering,
            RegistrarState::Registered
        ]
    );
    identity.validate().unwrap();
    assert_eq!(identity.id.role, Role::Bot);
    assert_eq!(identity.id.node_name, "ci-runner-1");
    assert_eq!(identity.cluster_name(), Some(CLUSTER));

    let stored = store.load().unwrap().expect("identity should be persisted");
    assert_eq!(stored, identity);
    assert_eq!(authority.count("register"), 1);
    assert_eq!(authority.channels(), vec![ChannelKind::Insecure]);
}

#[tokio::test]
async fn stored_identity_is_reused_without_network() {
    let authority = FakeAuthority::new();
    let existing = authority.issue_identity(Role::Node, "ci-runner-1");
    let store = Arc::new(MemoryStore::with_identity(existing.clone()));
    authority.set_unreachable(true);

    let mut config = support::config(DestinationSpec::Memory);
    config.token = None;
    let mut registrar = Registrar::new(&config, store, FakeTransport::new(&authority));
    let loaded = registrar.bootstrap().await.unwrap();

    assert_eq!(loaded, existing);
    assert_eq!(
        registrar.history(),
        &[RegistrarState::NoIdentity, RegistrarState::Registered]
    );
    assert!(authority.calls().is_empty(), "no network calls expected");
    assert!(authority.channels().is_empty());
}

#[tokio::test]
async fn matching_ca_pin_registers_over_pinned_channel() {
    let authority = FakeAuthority::new();
    let config = support::config(DestinationSpec::Memory).with_ca_pins(vec![authority.ca_pin()]);

    let mut registrar = Registrar::new(
        &config,
        Arc::new(MemoryStore::new()),
        FakeTransport::new(&authority),
    );
    let identity = registrar.bootstrap().await.unwrap();

    assert_eq!(authority.calls(), vec!["cluster_ca_certs", "register"]);
    assert_eq!(
        authority.channels(),
        vec![ChannelKind::Insecure, ChannelKind::Pinned]
    );
    assert!(identity.certs.tls_ca_certs.contains(&authority.ca_pem));
}

#[tokio::test]
async fn pin_is_case_insensitive() {
    let authority = FakeAuthority::new();
    let config = support::config(DestinationSpec::Memory)
        .with_ca_pins(vec![authority.ca_pin().to_uppercase().replace("SHA256:", "sha256:")]);

    let mut registrar = Registrar::new(
        &config,
        Arc::new(MemoryStore::new()),
        FakeTransport::new(&authority),
    );
    assert!(registrar.bootstrap().await.is_ok());
}

#[tokio::test]
async fn mismatched_ca_pin_aborts_before_register() {
    let authority = FakeAuthority::new();
    let store = Arc::new(MemoryStore::new());
    let config = support::config(DestinationSpec::Memory)
        .with_ca_pins(vec![format!("sha256:{}", "00".repeat(32))]);

    let mut registrar = Registrar::new(&config, store.clone(), FakeTransport::new(&authority));
    let err = registrar.bootstrap().await.unwrap_err();

    assert!(matches!(
        err,
        AgentError::Registration(RegistrationError::CaPinMismatch)
    ));
    assert_eq!(authority.count("register"), 0);
    assert!(store.load().unwrap().is_none());
}

#[tokio::test]
async fn rejected_token_is_reported_and_nothing_saved() {
    let authority = FakeAuthority::new();
    let store = Arc::new(MemoryStore::new());
    let config =
        support::config(DestinationSpec::Memory).with_token(JoinToken::new("tok-bogus-9999"));

    let mut registrar = Registrar::new(&config, store.clone(), FakeTransport::new(&authority));
    let err = registrar.bootstrap().await.unwrap_err();

    assert!(
        matches!(err, AgentError::Registration(RegistrationError::TokenRejected(_))),
        "unexpected error: {err}"
    );
    assert!(!err.to_string().contains("tok-bogus-9999"));
    assert_eq!(registrar.state(), RegistrarState::Registering);
    assert!(store.load().unwrap().is_none());
}

#[tokio::test]
async fn join_token_is_single_use() {
    let authority = FakeAuthority::new();
    let config = support::config(DestinationSpec::Memory);

    let mut first = Registrar::new(
        &config,
        Arc::new(MemoryStore::new()),
        FakeTransport::new(&authority),
    );
    first.bootstrap().await.unwrap();

    let mut second = Registrar::new(
        &config,
        Arc::new(MemoryStore::new()),
        FakeTransport::new(&authority),
    );
    assert!(matches!(
        second.bootstrap().await,
        Err(AgentError::Registration(RegistrationError::TokenRejected(_)))
    ));
}

#[tokio::test]
async fn unreachable_control_plane_is_distinct_from_bad_token() {
    let authority = FakeAuthority::new();
    authority.set_unreachable(true);
    let config = support::config(DestinationSpec::Memory);

    let mut registrar = Registrar::new(
        &config,
        Arc::new(MemoryStore::new()),
        FakeTransport::new(&authority),
    );
    let err = registrar.bootstrap().await.unwrap_err();
    match &err {
        AgentError::Registration(RegistrationError::Unreachable { servers, .. }) => {
            assert_eq!(servers, support::SERVER);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("unreachable"));
}

#[tokio::test]
async fn missing_token_with_empty_store_is_config_error() {
    let authority = FakeAuthority::new();
    let mut config = support::config(DestinationSpec::Memory);
    config.token = None;

    let mut registrar = Registrar::new(
        &config,
        Arc::new(MemoryStore::new()),
        FakeTransport::new(&authority),
    );
    assert!(matches!(
        registrar.bootstrap().await,
        Err(AgentError::Config(_))
    ));
    assert!(authority.calls().is_empty());
}

#[tokio::test]
async fn corrupt_record_fails_by_default() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(RECORD_FILE), b"{ not json").unwrap();
    let authority = FakeAuthority::new();
    let config = support::config(DestinationSpec::Directory(dir.path().into()));

    let mut registrar = Registrar::new(
        &config,
        Arc::new(DirectoryStore::new(dir.path(), None)),
        FakeTransport::new(&authority),
    );
    let err = registrar.bootstrap().await.unwrap_err();

    assert!(matches!(err, AgentError::Store(StoreError::Format(_))));
    assert_eq!(registrar.state(), RegistrarState::LoadFailed);
    assert!(authority.calls().is_empty());
}

#[tokio::test]
async fn corrupt_record_reregisters_when_allowed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(RECORD_FILE), b"{ not json").unwrap();
    let authority = FakeAuthority::new();
    let mut config = support::config(DestinationSpec::Directory(dir.path().into()));
    config.on_load_failure = LoadFailurePolicy::Register;
    let store = Arc::new(DirectoryStore::new(dir.path(), None));

    let mut registrar = Registrar::new(&config, store.clone(), FakeTransport::new(&authority));
    let identity = registrar.bootstrap().await.unwrap();

    assert_eq!(
        registrar.history(),
        &[
            RegistrarState::NoIdentity,
            RegistrarState::LoadFailed,
            RegistrarState::Registering,
            RegistrarState::Registered
        ]
    );
    assert_eq!(store.load().unwrap().unwrap().id, identity.id);
}

#[tokio::test]
async fn directory_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let authority = FakeAuthority::new();
    let config = support::config(DestinationSpec::Directory(dir.path().into()));

    let first = {
        let mut registrar = Registrar::new(
            &config,
            Arc::new(DirectoryStore::new(dir.path(), None)),
            FakeTransport::new(&authority),
        );
        registrar.bootstrap().await.unwrap()
    };

    // A restarted agent with no token still comes up with the same identity.
    let mut restarted = config.clone();
    restarted.token = None;
    let mut registrar = Registrar::new(
        &restarted,
        Arc::new(DirectoryStore::new(dir.path(), None)),
        FakeTransport::new(&authority),
    );
    let second = registrar.bootstrap().await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.certs, first.certs);
    assert_eq!(second.ssh_public_key(), first.ssh_public_key());
    assert_eq!(authority.count("register"), 1);

    let record = std::fs::read_to_string(dir.path().join(RECORD_FILE)).unwrap();
    assert!(!record.contains(TOKEN), "join token must not be persisted");
}

#[tokio::test]
async fn sealed_store_needs_the_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let authority = FakeAuthority::new();
    let passphrase = Passphrase::new("correct horse battery staple");
    let config = support::config(DestinationSpec::Directory(dir.path().into()))
        .with_passphrase(passphrase.clone());

    let mut registrar = Registrar::new(
        &config,
        Arc::new(DirectoryStore::new(dir.path(), Some(passphrase.clone()))),
        FakeTransport::new(&authority),
    );
    let identity = registrar.bootstrap().await.unwrap();

    let record = std::fs::read_to_string(dir.path().join(RECORD_FILE)).unwrap();
    assert!(!record.contains("PRIVATE KEY"));
    assert!(!dir.path().join(KEY_FILE).exists());

    let reopened = DirectoryStore::new(dir.path(), Some(passphrase))
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(reopened.id, identity.id);
    assert_eq!(reopened.private_key_pem(), identity.private_key_pem());

    let wrong = DirectoryStore::new(dir.path(), Some(Passphrase::new("wrong")));
    assert!(matches!(wrong.load(), Err(StoreError::Sealed(_))));
    let missing = DirectoryStore::new(dir.path(), None);
    assert!(matches!(missing.load(), Err(StoreError::Sealed(_))));
}
