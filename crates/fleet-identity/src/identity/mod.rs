//! The agent's host identity.
//!
//! An [`Identity`] bundles the logical id (role, host uuid, node name), the
//! key material and the certificates the control plane signed for it. It
//! is created once at registration and replaced wholesale on rotation;
//! nothing mutates an identity in place.

pub mod certs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::keys::{parse_ssh_authorized_key, KeyMaterial};
use crate::error::{AgentError, Result};

pub use certs::CertInfo;

/// Principal kind the agent registers as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Node,
    #[default]
    Bot,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Node => "node",
            Role::Bot => "bot",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "node" => Ok(Role::Node),
            "bot" => Ok(Role::Bot),
            other => Err(AgentError::Config(format!(
                "unknown role {other:?} (expected node or bot)"
            ))),
        }
    }
}

/// Logical identity, stable across rotations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityId {
    pub role: Role,
    /// Minted once at first registration.
    pub host_uuid: String,
    pub node_name: String,
}

impl IdentityId {
    /// Mint a new id with a random host uuid.
    pub fn mint(role: Role, node_name: impl Into<String>) -> Self {
        Self {
            role,
            host_uuid: uuid::Uuid::new_v4().to_string(),
            node_name: node_name.into(),
        }
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.role, self.host_uuid, self.node_name)
    }
}

/// Certificates signed by the control plane for one key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCerts {
    /// OpenSSH certificate line.
    pub ssh_cert: String,
    /// PEM X.509 certificate.
    pub tls_cert: String,
    /// PEM trust bundle of the issuing CA(s).
    pub tls_ca_certs: Vec<String>,
    /// `authorized_keys` lines of the SSH CA(s).
    #[serde(default)]
    pub ssh_ca_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

/// A complete host identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: IdentityId,
    keys: KeyMaterial,
    pub certs: IssuedCerts,
    pub issued_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(id: IdentityId, keys: KeyMaterial, certs: IssuedCerts) -> Self {
        Self {
            id,
            keys,
            certs,
            issued_at: Utc::now(),
        }
    }

    /// Override the issue timestamp (used when reloading a stored record).
    pub fn with_issued_at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = issued_at;
        self
    }

    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    pub fn private_key_pem(&self) -> &str {
        self.keys.private_key_pem()
    }

    pub fn ssh_public_key(&self) -> &str {
        self.keys.ssh_public_key()
    }

    pub fn tls_public_key(&self) -> &str {
        self.keys.tls_public_key()
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.certs.cluster_name.as_deref()
    }

    /// Parsed TLS certificate.
    pub fn tls_cert_info(&self) -> Result<CertInfo> {
        certs::inspect(&self.certs.tls_cert)
    }

    /// Structural validation: every certificate parses and both
    /// certificates bind this identity's public key.
    pub fn validate(&self) -> Result<()> {
        let cert = self.tls_cert_info()?;
        let spki = certs::public_key_spki(self.keys.tls_public_key())?;
        if cert.spki_der != spki {
            return Err(AgentError::InvalidIdentity(
                "TLS certificate does not match the private key".into(),
            ));
        }

        if self.certs.tls_ca_certs.is_empty() {
            return Err(AgentError::InvalidIdentity("empty TLS CA bundle".into()));
        }
        for ca in &self.certs.tls_ca_certs {
            certs::inspect(ca)?;
        }

        let ssh = certs::inspect_ssh_cert(&self.certs.ssh_cert)?;
        let ssh_key = parse_ssh_authorized_key(self.keys.ssh_public_key())?;
        if ssh.public_key != ssh_key.as_bytes() {
            return Err(AgentError::InvalidIdentity(
                "SSH certificate does not match the private key".into(),
            ));
        }
        Ok(())
    }
}
