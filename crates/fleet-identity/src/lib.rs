//! fleet-identity: identity bootstrap and maintenance for fleet agents.
//!
//! An agent exchanges a one-time join token for a signed host identity
//! (an Ed25519 key pair with SSH and TLS certificates), keeps it in a
//! durable store, heartbeats its presence to the control plane over mutual
//! TLS, rotates its certificates before they expire and can request
//! narrower delegated credentials for other principals.
//!
//! The usual entry point is [`Agent`]:
//!
//! ```no_run
//! # async fn demo() -> fleet_identity::Result<()> {
//! use std::sync::Arc;
//! use fleet_identity::{Agent, AgentConfig, DestinationSpec, HttpTransport, JoinToken};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = AgentConfig::new(
//!     vec!["auth.example.com:3025".into()],
//!     DestinationSpec::parse("dir:/var/lib/fleetbot")?,
//!     "ci-runner-1",
//! )
//! .with_token(JoinToken::new("join-token-from-operator"));
//!
//! let agent = Agent::bootstrap(config, Arc::new(HttpTransport::new())).await?;
//! agent.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod crypto;
pub mod delegation;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod register;
pub mod rotation;
pub mod session;
pub mod storage;

// Re-export primary types
pub use agent::Agent;
pub use config::{AgentConfig, JoinToken, LoadFailurePolicy, Passphrase};
pub use error::{
    AgentError, HeartbeatError, IssuanceError, RegistrationError, Result, RotationError,
    StoreError,
};
pub use identity::{Identity, IdentityId, IssuedCerts, Role};

// Re-export client types
pub use client::http::HttpTransport;
pub use client::{ApiError, AuthApi, BootstrapApi, ClientFactory, CredentialBundle, Transport};

// Re-export storage types
pub use storage::{DestinationSpec, DirectoryStore, IdentityStore, MemoryStore};

// Re-export lifecycle types
pub use delegation::CredentialIssuer;
pub use heartbeat::{BeatOutcome, Heartbeat, HeartbeatConfig, HeartbeatMode};
pub use register::{Registrar, RegistrarState};
pub use rotation::{RotationPolicy, Rotator};
pub use session::{Session, SessionHandle};
