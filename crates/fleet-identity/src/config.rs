//! Agent configuration.
//!
//! Everything the agent needs is passed in explicitly through
//! [`AgentConfig`]; there are no process-wide defaults. The struct can be
//! loaded from a JSON file or assembled by an embedding program.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::pin;
use crate::error::{AgentError, Result};
use crate::identity::Role;
use crate::storage::DestinationSpec;

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Lifetime of an announced presence record.
pub const DEFAULT_ANNOUNCE_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_RENEW_FRACTION: f64 = 1.0 / 3.0;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest accepted duration setting (ten years). Larger values cannot be
/// added to a timestamp safely.
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 86_400);

// ── Secrets ───────────────────────────────────────────────────────────────────

/// One-time join token. Never printed in full.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct JoinToken(String);

impl JoinToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for the registration request only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// First four characters followed by `...`.
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(4).collect();
        format!("{prefix}...")
    }
}

impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("JoinToken").field(&self.redacted()).finish()
    }
}

impl std::fmt::Display for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Passphrase sealing the private key at rest.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(passphrase.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

// ── Policies ──────────────────────────────────────────────────────────────────

/// What to do when the stored identity exists but cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadFailurePolicy {
    /// Surface the store error and stop.
    #[default]
    Fail,
    /// Log the failure and register a fresh identity over it.
    Register,
}

/// Expiry-driven rotation settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotationSettings {
    /// Rotate once less than this fraction of the TLS validity remains.
    #[serde(default = "default_renew_fraction")]
    pub renew_fraction: f64,
    #[serde(default = "default_rotation_check", with = "duration_secs")]
    pub check_interval: Duration,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            renew_fraction: DEFAULT_RENEW_FRACTION,
            check_interval: DEFAULT_ROTATION_CHECK_INTERVAL,
        }
    }
}

/// Delegated user credentials requested after bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCertsSettings {
    pub principal: String,
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

// ── AgentConfig ───────────────────────────────────────────────────────────────

/// Complete agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Required only when no identity is stored yet.
    #[serde(default)]
    pub token: Option<JoinToken>,
    pub auth_servers: Vec<String>,
    pub destination: DestinationSpec,
    pub node_name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub ca_pins: Vec<String>,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub additional_principals: Vec<String>,
    #[serde(default)]
    pub passphrase: Option<Passphrase>,
    #[serde(default)]
    pub on_load_failure: LoadFailurePolicy,
    #[serde(default = "default_announce_ttl", with = "duration_secs")]
    pub announce_ttl: Duration,
    #[serde(default = "default_keep_alive", with = "duration_secs")]
    pub keep_alive_period: Duration,
    #[serde(default = "default_check_period", with = "duration_secs")]
    pub check_period: Duration,
    #[serde(default)]
    pub rotation: RotationSettings,
    #[serde(default = "default_request_timeout", with = "duration_secs")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub user_certs: Option<UserCertsSettings>,
}

impl AgentConfig {
    /// A configuration with every optional setting at its default.
    pub fn new(
        auth_servers: Vec<String>,
        destination: DestinationSpec,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            token: None,
            auth_servers,
            destination,
            node_name: node_name.into(),
            role: Role::default(),
            ca_pins: Vec::new(),
            dns_names: Vec::new(),
            additional_principals: Vec::new(),
            passphrase: None,
            on_load_failure: LoadFailurePolicy::default(),
            announce_ttl: DEFAULT_ANNOUNCE_TTL,
            keep_alive_period: DEFAULT_KEEP_ALIVE_PERIOD,
            check_period: DEFAULT_CHECK_PERIOD,
            rotation: RotationSettings::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_certs: None,
        }
    }

    pub fn with_token(mut self, token: JoinToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_ca_pins(mut self, pins: Vec<String>) -> Self {
        self.ca_pins = pins;
        self
    }

    pub fn with_passphrase(mut self, passphrase: Passphrase) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    /// Load from a JSON file and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| AgentError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the agent cannot act on.
    pub fn validate(&self) -> Result<()> {
        if self.token.as_ref().is_some_and(JoinToken::is_empty) {
            return Err(AgentError::Config("join token is empty".into()));
        }
        if self.auth_servers.is_empty() {
            return Err(AgentError::Config("at least one auth server is required".into()));
        }
        for addr in &self.auth_servers {
            validate_host_port(addr)?;
        }
        if self.node_name.trim().is_empty() {
            return Err(AgentError::Config("node name is empty".into()));
        }
        for p in &self.ca_pins {
            pin::validate_pin(p)?;
        }

        for (name, value) in [
            ("announce_ttl", self.announce_ttl),
            ("keep_alive_period", self.keep_alive_period),
            ("check_period", self.check_period),
            ("rotation.check_interval", self.rotation.check_interval),
            ("request_timeout", self.request_timeout),
        ] {
            check_duration(name, value)?;
        }
        let fraction = self.rotation.renew_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(AgentError::Config(format!(
                "rotation.renew_fraction must be between 0 and 1, got {fraction}"
            )));
        }

        if let Some(user_certs) = &self.user_certs {
            if user_certs.principal.trim().is_empty() {
                return Err(AgentError::Config("user_certs.principal is empty".into()));
            }
            check_duration("user_certs.ttl", user_certs.ttl)?;
        }
        Ok(())
    }
}

fn check_duration(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(AgentError::Config(format!("{name} must be non-zero")));
    }
    if value > MAX_DURATION {
        return Err(AgentError::Config(format!(
            "{name} {value:?} exceeds the maximum of {MAX_DURATION:?}"
        )));
    }
    Ok(())
}

fn validate_host_port(addr: &str) -> Result<()> {
    let bad = || AgentError::Config(format!("auth server {addr:?} must be host:port"));
    let (host, port) = addr.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() || port.parse::<u16>().map_or(true, |p| p == 0) {
        return Err(bad());
    }
    Ok(())
}

fn default_announce_ttl() -> Duration {
    DEFAULT_ANNOUNCE_TTL
}

fn default_keep_alive() -> Duration {
    DEFAULT_KEEP_ALIVE_PERIOD
}

fn default_check_period() -> Duration {
    DEFAULT_CHECK_PERIOD
}

fn default_rotation_check() -> Duration {
    DEFAULT_ROTATION_CHECK_INTERVAL
}

fn default_renew_fraction() -> f64 {
    DEFAULT_RENEW_FRACTION
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

/// Durations as whole seconds in JSON.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
