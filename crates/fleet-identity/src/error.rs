//! Error types for fleet-identity.
//!
//! Every bootstrap-path failure is a typed variant so callers can tell an
//! expired join token from an unreachable control plane or an unwritable
//! identity store. Secrets (join tokens, private keys, passphrases) are
//! never included in error messages.

use crate::client::ApiError;

/// Top-level error covering all agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Identity store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Invalid TLS configuration: {0}")]
    TlsConfig(String),

    #[error("Rotation failed: {0}")]
    Rotation(#[from] RotationError),

    #[error("Credential issuance failed: {0}")]
    Issuance(#[from] IssuanceError),

    #[error("Heartbeat error: {0}")]
    Heartbeat(#[from] HeartbeatError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Control plane error: {0}")]
    Api(#[from] ApiError),
}

/// Failures of the durable identity store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed identity record: {0}")]
    Format(String),

    #[error("Unsupported identity record version={version} format={format}")]
    UnsupportedVersion { version: u32, format: String },

    #[error("Sealed private key could not be opened: {0}")]
    Sealed(String),

    #[error("Invalid destination spec: {0}")]
    InvalidDestination(String),
}

impl StoreError {
    /// Build an IO error tagged with the affected path.
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Whether the failure concerns the record's contents rather than the
    /// filesystem. Only these failures are eligible for fallback to fresh
    /// registration.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::Format(_) | Self::UnsupportedVersion { .. } | Self::Sealed(_)
        )
    }
}

/// Failures of the first-contact registration exchange.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("join token was rejected by the control plane (invalid, expired or already used): {0}")]
    TokenRejected(String),

    #[error("control plane unreachable at {servers}: {reason}")]
    Unreachable { servers: String, reason: String },

    #[error("none of the cluster CA certificates matched the configured CA pins")]
    CaPinMismatch,

    #[error("control plane returned an unusable identity: {0}")]
    InvalidResponse(String),

    #[error("registration request rejected: {0}")]
    Rejected(String),
}

impl RegistrationError {
    /// Classify a control-plane error raised during registration.
    pub fn from_api(err: ApiError, servers: &[String]) -> Self {
        match err {
            ApiError::AccessDenied(msg) => Self::TokenRejected(msg),
            ApiError::Unreachable(reason) | ApiError::Timeout(reason) => Self::Unreachable {
                servers: servers.join(","),
                reason,
            },
            ApiError::InvalidResponse(msg) => Self::InvalidResponse(msg),
            other => Self::Rejected(other.to_string()),
        }
    }
}

/// Failures while replacing the current identity with a fresh one.
///
/// Never fatal to a running agent: it keeps its current credential.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("could not generate replacement keys: {0}")]
    KeyGeneration(String),

    #[error("re-registration request failed: {0}")]
    Request(#[from] ApiError),

    #[error("re-issued identity is invalid: {0}")]
    InvalidResponse(String),

    #[error("re-issued identity could not be persisted: {0}")]
    Persist(#[from] StoreError),

    #[error("re-issued identity could not be installed: {0}")]
    Install(String),
}

/// Failures while requesting delegated user credentials.
#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    #[error("invalid credential request: {0}")]
    InvalidRequest(String),

    #[error("issuing identity has expired")]
    IssuerExpired,

    #[error("credential request failed: {0}")]
    Request(#[from] ApiError),
}

/// Heartbeat failures: configuration errors fail fast, beat errors are
/// reported through the callback and never stop the loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    #[error("invalid heartbeat configuration: {0}")]
    Config(String),

    #[error("server info unavailable: {0}")]
    ServerInfo(String),

    #[error("announce failed: {0}")]
    Announce(String),

    #[error("keep-alive failed: {0}")]
    KeepAlive(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, AgentError>;
