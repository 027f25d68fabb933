//! Integration test: the HTTP/JSON transport against a mock control plane.

#[path = "../support/mod.rs"]
mod support;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleet_identity::client::{
    AuthApi, BootstrapApi, KeepAlive, RegisterRequest, ResourceKind, ServerResource, TlsChannel,
    Transport,
};
use fleet_identity::crypto::keys::{KeyMaterial, KeyType};
use fleet_identity::{ApiError, HttpTransport, IdentityId, JoinToken, Role};

use support::FakeAuthority;

fn transport() -> HttpTransport {
    HttpTransport::new().scheme("http")
}

fn addr(server: &MockServer) -> String {
    server.address().to_string()
}

fn bootstrap(servers: &[String]) -> Arc<dyn BootstrapApi> {
    transport()
        .open_bootstrap(servers, TlsChannel::insecure().unwrap())
        .unwrap()
}

fn auth(servers: &[String]) -> Arc<dyn AuthApi> {
    transport()
        .open_auth(servers, TlsChannel::insecure().unwrap())
        .unwrap()
}

fn register_request() -> (RegisterRequest, KeyMaterial) {
    let keys = KeyMaterial::generate(KeyType::default()).unwrap();
    let request = RegisterRequest {
        token: JoinToken::new("tok-http-0001"),
        id: IdentityId::mint(Role::Bot, "bot-http"),
        ssh_public_key: keys.ssh_public_key().to_string(),
        tls_public_key: keys.tls_public_key().to_string(),
        dns_names: vec![],
        additional_principals: vec![],
    };
    (request, keys)
}

fn resource() -> ServerResource {
    ServerResource {
        kind: ResourceKind::Bot,
        name: "bot-http".into(),
        namespace: "default".into(),
        host_id: "h-1".into(),
        addr: String::new(),
        labels: Default::default(),
        expires: Utc::now(),
    }
}

#[tokio::test]
async fn register_posts_json_and_decodes_certs() {
    let server = MockServer::start().await;
    let certs = FakeAuthority::new().issue_identity(Role::Bot, "bot-http").certs;
    Mock::given(method("POST"))
        .and(path("/v1/bootstrap/register"))
        .and(body_partial_json(json!({"token": "tok-http-0001"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(&certs))
        .expect(1)
        .mount(&server)
        .await;

    let (request, _keys) = register_request();
    let issued = bootstrap(&[addr(&server)]).register(request).await.unwrap();
    assert_eq!(issued, certs);
}

#[tokio::test]
async fn cluster_ca_certs_uses_get() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/bootstrap/ca"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["ca-1", "ca-2"])))
        .mount(&server)
        .await;

    let cas = bootstrap(&[addr(&server)]).cluster_ca_certs().await.unwrap();
    assert_eq!(cas, vec!["ca-1".to_string(), "ca-2".to_string()]);
}

#[tokio::test]
async fn error_statuses_map_to_classes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/bootstrap/register"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({"error": "token expired"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/presence"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let (request, _keys) = register_request();
    let err = bootstrap(&[addr(&server)]).register(request).await.unwrap_err();
    assert_eq!(err, ApiError::AccessDenied("token expired".into()));

    let err = auth(&[addr(&server)])
        .upsert_presence(&resource())
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::Internal("boom".into()));
}

#[tokio::test]
async fn unreachable_server_falls_through_to_next() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/presence"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_id": "lease-7",
            "name": "bot-http",
            "namespace": "default",
            "expires": Utc::now(),
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Nothing listens on port 1.
    let servers = vec!["127.0.0.1:1".to_string(), addr(&server)];
    let lease = auth(&servers).upsert_presence(&resource()).await.unwrap();
    assert_eq!(lease.lease_id, "lease-7");
}

#[tokio::test]
async fn unavailable_status_falls_through_but_rejection_does_not() {
    let busy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&busy)
        .await;
    let rejecting = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "bad key"})))
        .mount(&rejecting)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/presence/keepalive"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;

    let keep_alive = KeepAlive {
        lease_id: "lease-1".into(),
        name: "bot-http".into(),
        namespace: "default".into(),
        expires: Utc::now(),
    };

    auth(&[addr(&busy), addr(&healthy)])
        .keep_alive(&keep_alive)
        .await
        .unwrap();

    let err = auth(&[addr(&rejecting), addr(&healthy)])
        .keep_alive(&keep_alive)
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::BadRequest("bad key".into()));
}

#[tokio::test]
async fn every_server_down_is_unreachable() {
    let servers = vec!["127.0.0.1:1".to_string(), "127.0.0.1:2".to_string()];
    let err = auth(&servers)
        .upsert_auth_server(&resource())
        .await
        .unwrap_err();
    assert!(err.is_unreachable(), "unexpected: {err}");
}

#[tokio::test]
async fn malformed_success_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/bootstrap/ca"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = bootstrap(&[addr(&server)])
        .cluster_ca_certs()
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidResponse(_)));
}
