//! Integration test: the full agent flow.
//!
//! 1. Bootstrap (register) against the fake control plane
//! 2. Heartbeat through the restricted, session-following announcer
//! 3. Expiry-driven rotation on the primary flow
//! 4. Delegated user certificates

#[path = "../support/mod.rs"]
mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use fleet_identity::agent::HEARTBEAT_COMPONENT;
use fleet_identity::config::UserCertsSettings;
use fleet_identity::crypto::keys::{KeyMaterial, KeyType};
use fleet_identity::storage::dir::{SSH_CERT_FILE, USERS_DIR};
use fleet_identity::{
    Agent, AgentError, CredentialIssuer, DestinationSpec, IssuanceError, JoinToken,
    RegistrarState, Role,
};
use tokio_util::sync::CancellationToken;

use support::{FakeAuthority, FakeTransport};

#[tokio::test(start_paused = true)]
async fn bootstrap_then_heartbeat_until_cancelled() {
    let authority = FakeAuthority::new();
    let config = support::config(DestinationSpec::Memory).with_role(Role::Node);

    let agent = Agent::bootstrap(config, FakeTransport::new(&authority))
        .await
        .unwrap();
    assert_eq!(
        agent.registrar_history(),
        &[
            RegistrarState::NoIdentity,
            RegistrarState::Registering,
            RegistrarState::Registered
        ]
    );
    let identity = agent.identity();
    assert_eq!(identity.id.role, Role::Node);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(agent.run(cancel.clone()));
    tokio::time::sleep(Duration::from_secs(130)).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(authority.count("upsert_presence"), 1);
    assert_eq!(authority.count("keep_alive"), 2);
    assert_eq!(authority.count("reregister"), 0);
    assert_eq!(authority.core_topology_calls(), 0);

    let state = authority.state.lock().unwrap();
    assert_eq!(state.presence[0].name, "ci-runner-1");
    assert_eq!(state.presence[0].host_id, identity.id.host_uuid);
}

#[tokio::test]
async fn heartbeat_component_is_the_agent_name() {
    let authority = FakeAuthority::new();
    let agent = Agent::bootstrap(
        support::config(DestinationSpec::Memory),
        FakeTransport::new(&authority),
    )
    .await
    .unwrap();

    let heartbeat = agent.heartbeat_config();
    assert_eq!(heartbeat.component, HEARTBEAT_COMPONENT);
    assert_eq!(heartbeat.component, "fleetbot");
    assert_ne!(heartbeat.component, agent.identity().id.node_name);
}

#[tokio::test(start_paused = true)]
async fn due_certificate_is_rotated_and_heartbeat_follows() {
    let authority = FakeAuthority::new();
    authority.set_validity((1975, 1, 1), (support::next_year(), 1, 1));
    let config = support::config(DestinationSpec::Memory);

    let agent = Agent::bootstrap(config, FakeTransport::new(&authority))
        .await
        .unwrap();
    let session = agent.session().clone();
    let original = session.current();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(agent.run(cancel.clone()));
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let rotated = session.current();
    assert_eq!(authority.count("reregister"), 1);
    assert_eq!(rotated.identity.id, original.identity.id);
    assert_ne!(rotated.identity.ssh_public_key(), original.identity.ssh_public_key());
}

#[tokio::test(start_paused = true)]
async fn rotation_failure_is_retried_at_next_check() {
    let authority = FakeAuthority::new();
    authority.set_validity((1975, 1, 1), (support::next_year(), 1, 1));
    authority.reregister_failures.store(1, Ordering::SeqCst);
    let mut config = support::config(DestinationSpec::Memory);
    config.rotation.check_interval = Duration::from_secs(60);

    let agent = Agent::bootstrap(config, FakeTransport::new(&authority))
        .await
        .unwrap();
    let session = agent.session().clone();
    let original = session.current();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(agent.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(authority.count("reregister"), 1);
    assert_eq!(
        session.current().identity.ssh_public_key(),
        original.identity.ssh_public_key()
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(authority.count("reregister"), 2);
    assert_ne!(
        session.current().identity.ssh_public_key(),
        original.identity.ssh_public_key()
    );
}

#[tokio::test]
async fn invalid_config_fails_before_any_network_call() {
    let authority = FakeAuthority::new();
    let mut config = support::config(DestinationSpec::Memory);
    config.auth_servers.clear();

    let err = Agent::bootstrap(config, FakeTransport::new(&authority))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Config(_)));
    assert!(authority.calls().is_empty());
}

#[tokio::test]
async fn configured_user_certs_are_exported() {
    let dir = tempfile::tempdir().unwrap();
    let authority = FakeAuthority::new();
    let mut config = support::config(DestinationSpec::Directory(dir.path().into()));
    config.user_certs = Some(UserCertsSettings {
        principal: "deploy".into(),
        ttl: Duration::from_secs(4 * 3600),
    });

    let agent = Agent::bootstrap(config, FakeTransport::new(&authority))
        .await
        .unwrap();
    let (keys, bundle) = agent.issue_configured_user_certs().await.unwrap().unwrap();

    assert_eq!(bundle.principal, "deploy");
    assert!(dir.path().join(USERS_DIR).join("deploy").join(SSH_CERT_FILE).exists());
    let request = authority.state.lock().unwrap().user_cert_requests[0].clone();
    assert_eq!(request.public_key, keys.ssh_public_key());
    let not_after = agent.identity().tls_cert_info().unwrap().not_after;
    assert!(request.expires <= not_after);
}

#[tokio::test]
async fn delegated_expiry_is_clamped_to_issuer() {
    let authority = FakeAuthority::new();
    authority.set_validity((1975, 1, 1), (support::next_year(), 1, 1));
    let agent = Agent::bootstrap(
        support::config(DestinationSpec::Memory),
        FakeTransport::new(&authority),
    )
    .await
    .unwrap();
    let principal = KeyMaterial::generate(KeyType::default()).unwrap();

    let bundle = CredentialIssuer::default()
        .issue_for_session(
            agent.session(),
            "deploy",
            principal.ssh_public_key(),
            Duration::from_secs(10 * 365 * 24 * 3600),
        )
        .await
        .unwrap();

    let not_after = agent.identity().tls_cert_info().unwrap().not_after;
    assert_eq!(bundle.expires, not_after);
}

#[tokio::test]
async fn expired_issuer_cannot_delegate() {
    let authority = FakeAuthority::new();
    authority.set_validity((2000, 1, 1), (2001, 1, 1));
    let agent = Agent::bootstrap(
        support::config(DestinationSpec::Memory),
        FakeTransport::new(&authority),
    )
    .await
    .unwrap();
    let principal = KeyMaterial::generate(KeyType::default()).unwrap();

    let err = CredentialIssuer::default()
        .issue_for_session(
            agent.session(),
            "deploy",
            principal.ssh_public_key(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IssuanceError::IssuerExpired));
    assert_eq!(authority.count("generate_user_certs"), 0);
}

#[tokio::test]
async fn initial_renewable_certs_use_the_join_token() {
    let authority = FakeAuthority::new();
    let transport = FakeTransport::new(&authority);
    let config = support::config(DestinationSpec::Memory);
    let registrar = fleet_identity::Registrar::new(
        &config,
        std::sync::Arc::new(fleet_identity::MemoryStore::new()),
        transport,
    );
    let client = registrar.open_bootstrap_client().await.unwrap();
    let principal = KeyMaterial::generate(KeyType::default()).unwrap();

    let bundle = CredentialIssuer::default()
        .issue_initial(
            client.as_ref(),
            &JoinToken::new(support::TOKEN),
            "deploy",
            principal.ssh_public_key(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
    assert_eq!(bundle.principal, "deploy");
    assert!(bundle.expires > Utc::now());

    let rejected = CredentialIssuer::default()
        .issue_initial(
            client.as_ref(),
            &JoinToken::new("tok-unknown"),
            "deploy",
            principal.ssh_public_key(),
            Duration::from_secs(3600),
        )
        .await;
    assert!(matches!(
        rejected,
        Err(IssuanceError::Request(fleet_identity::ApiError::AccessDenied(_)))
    ));
}
