//! Control-plane client seam.
//!
//! The agent talks to the control plane through two traits. Bootstrap calls
//! ([`BootstrapApi`]) authenticate with the join token and are only
//! reachable before an identity exists; authenticated calls ([`AuthApi`])
//! go over mutual TLS with the agent's certificate. A [`Transport`] opens
//! either kind from a server list and a TLS channel description.
//!
//! # Modules
//!
//! - [`tls`]: rustls client configurations.
//! - [`factory`]: the client factory, tagged by trust mode.
//! - [`http`]: JSON over HTTPS binding.

pub mod factory;
pub mod http;
pub mod tls;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::JoinToken;
use crate::identity::{IdentityId, IssuedCerts};

pub use factory::{BootstrapTrust, ClientFactory};
pub use tls::{ChannelKind, TlsChannel};

/// Errors surfaced by a control-plane call, classified by what the caller
/// can do about them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal server error: {0}")]
    Internal(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Whether another server address might succeed where this one failed.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

// ── Requests and responses ────────────────────────────────────────────────────

/// First-contact registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub token: JoinToken,
    pub id: IdentityId,
    pub ssh_public_key: String,
    pub tls_public_key: String,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub additional_principals: Vec<String>,
}

/// Control-plane-defined rotation state, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RotationState(pub serde_json::Value);

/// Re-registration of an existing identity with new keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReRegisterRequest {
    pub id: IdentityId,
    pub ssh_public_key: String,
    pub tls_public_key: String,
    #[serde(default)]
    pub rotation: RotationState,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub additional_principals: Vec<String>,
}

/// Delegated user certificates requested with an authenticated identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCertsRequest {
    pub principal: String,
    /// OpenSSH public key line of the principal.
    pub public_key: String,
    pub expires: DateTime<Utc>,
}

/// Renewable user certificates requested with the join token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewableCertsRequest {
    pub token: JoinToken,
    pub principal: String,
    pub public_key: String,
    pub expires: DateTime<Utc>,
}

/// Credentials issued for a delegated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub principal: String,
    pub ssh_cert: String,
    pub tls_cert: String,
    #[serde(default)]
    pub tls_ca_certs: Vec<String>,
    pub expires: DateTime<Utc>,
}

/// Kinds of presence records an agent can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Node,
    Bot,
    Proxy,
    AuthServer,
}

impl ResourceKind {
    /// Core topology records a delegated client may not manage.
    pub fn is_core_topology(&self) -> bool {
        matches!(self, Self::Proxy | Self::AuthServer)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Node => "node",
            Self::Bot => "bot",
            Self::Proxy => "proxy",
            Self::AuthServer => "auth_server",
        };
        f.write_str(s)
    }
}

/// Presence snapshot of one server or agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResource {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub host_id: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub expires: DateTime<Utc>,
}

impl ServerResource {
    /// Equality ignoring the expiry stamp.
    pub fn same_content(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.namespace == other.namespace
            && self.host_id == other.host_id
            && self.addr == other.addr
            && self.labels == other.labels
    }
}

/// Handle returned by an announce; keep-alives extend it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    pub name: String,
    pub namespace: String,
    pub expires: DateTime<Utc>,
}

/// Liveness ping for a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    pub lease_id: String,
    pub name: String,
    pub namespace: String,
    pub expires: DateTime<Utc>,
}

impl KeepAlive {
    pub fn for_lease(lease: &Lease, expires: DateTime<Utc>) -> Self {
        Self {
            lease_id: lease.lease_id.clone(),
            name: lease.name.clone(),
            namespace: lease.namespace.clone(),
            expires,
        }
    }
}

/// Bound a control-plane call by `deadline`.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| ApiError::Timeout(format!("no response within {deadline:?}")))?
}

// ── API traits ────────────────────────────────────────────────────────────────

/// Calls available before the agent holds an identity.
#[async_trait]
pub trait BootstrapApi: Send + Sync {
    /// PEM certificates of the cluster's host CA.
    async fn cluster_ca_certs(&self) -> Result<Vec<String>, ApiError>;

    async fn register(&self, request: RegisterRequest) -> Result<IssuedCerts, ApiError>;

    async fn initial_renewable_user_certs(
        &self,
        request: RenewableCertsRequest,
    ) -> Result<CredentialBundle, ApiError>;
}

/// Calls made with the agent's own certificate.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn reregister(&self, request: ReRegisterRequest) -> Result<IssuedCerts, ApiError>;

    async fn generate_user_certs(
        &self,
        request: UserCertsRequest,
    ) -> Result<CredentialBundle, ApiError>;

    /// Upsert a node or bot presence record.
    async fn upsert_presence(&self, resource: &ServerResource) -> Result<Lease, ApiError>;

    async fn keep_alive(&self, keep_alive: &KeepAlive) -> Result<(), ApiError>;

    async fn upsert_auth_server(&self, resource: &ServerResource) -> Result<(), ApiError>;

    async fn upsert_proxy(&self, resource: &ServerResource) -> Result<(), ApiError>;
}

/// Opens API handles against a list of `host:port` server addresses.
pub trait Transport: Send + Sync {
    fn open_bootstrap(
        &self,
        servers: &[String],
        channel: TlsChannel,
    ) -> Result<Arc<dyn BootstrapApi>, ApiError>;

    fn open_auth(
        &self,
        servers: &[String],
        channel: TlsChannel,
    ) -> Result<Arc<dyn AuthApi>, ApiError>;
}
