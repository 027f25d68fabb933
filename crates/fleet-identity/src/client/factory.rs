//! Client factory.
//!
//! The trust mode is a tag on the factory, not a flag: a
//! [`ClientFactory::Bootstrap`] factory can only open bootstrap clients and
//! a [`ClientFactory::Authenticated`] one can only open mutual-TLS clients,
//! so the insecure channel is unreachable once an identity exists.

use std::sync::Arc;

use crate::client::{AuthApi, BootstrapApi, TlsChannel, Transport};
use crate::error::{AgentError, Result};
use crate::identity::Identity;

/// Server trust used before the agent has an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapTrust {
    /// Accept any server certificate.
    Insecure,
    /// Trust only these PEM CA certificates.
    Pinned(Vec<String>),
}

#[derive(Debug, Clone)]
pub enum ClientFactory {
    Bootstrap(BootstrapTrust),
    Authenticated(Arc<Identity>),
}

impl ClientFactory {
    /// The TLS channel this factory hands to the transport.
    pub fn channel(&self) -> Result<TlsChannel> {
        match self {
            Self::Bootstrap(BootstrapTrust::Insecure) => TlsChannel::insecure(),
            Self::Bootstrap(BootstrapTrust::Pinned(cas)) => TlsChannel::pinned(cas),
            Self::Authenticated(identity) => TlsChannel::mutual(identity),
        }
    }

    pub fn connect_bootstrap(
        &self,
        transport: &dyn Transport,
        servers: &[String],
    ) -> Result<Arc<dyn BootstrapApi>> {
        if let Self::Bootstrap(BootstrapTrust::Insecure) = self {
            log::warn!("opening insecure bootstrap connection to {}", servers.join(","));
        }
        match self {
            Self::Bootstrap(_) => Ok(transport.open_bootstrap(servers, self.channel()?)?),
            Self::Authenticated(_) => Err(AgentError::TlsConfig(
                "bootstrap client requested from an authenticated factory".into(),
            )),
        }
    }

    pub fn connect(
        &self,
        transport: &dyn Transport,
        servers: &[String],
    ) -> Result<Arc<dyn AuthApi>> {
        match self {
            Self::Authenticated(_) => Ok(transport.open_auth(servers, self.channel()?)?),
            Self::Bootstrap(_) => Err(AgentError::TlsConfig(
                "authenticated client requested from a bootstrap factory".into(),
            )),
        }
    }
}

/// Build a mutually authenticated client for `identity`.
///
/// A malformed identity is rejected with `TlsConfig` rather than falling
/// back to any weaker channel.
pub fn build(
    identity: Arc<Identity>,
    transport: &dyn Transport,
    servers: &[String],
) -> Result<Arc<dyn AuthApi>> {
    identity
        .validate()
        .map_err(|e| AgentError::TlsConfig(format!("identity {}: {e}", identity.id)))?;
    ClientFactory::Authenticated(identity).connect(transport, servers)
}
