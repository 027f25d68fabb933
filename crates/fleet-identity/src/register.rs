//! Registrar: the bootstrap decision.
//!
//! ```text
//! NoIdentity ──load ok──────────────────────────▶ Registered
//!     │
//!     ├──not found──▶ Registering ──register+save──▶ Registered
//!     │
//!     └──format error──▶ LoadFailed ──policy=register──▶ Registering
//! ```
//!
//! A registration failure is final for this attempt; any retry policy
//! belongs to the caller.

use std::sync::Arc;

use crate::client::{
    with_deadline, ApiError, BootstrapApi, BootstrapTrust, ClientFactory, RegisterRequest,
    Transport,
};
use crate::config::{AgentConfig, LoadFailurePolicy};
use crate::crypto::keys::{KeyMaterial, KeyType};
use crate::crypto::pin;
use crate::error::{AgentError, RegistrationError, Result, StoreError};
use crate::identity::{Identity, IdentityId};
use crate::storage::IdentityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    NoIdentity,
    Registering,
    Registered,
    LoadFailed,
}

/// Runs the load-or-register decision for one destination.
pub struct Registrar<'a> {
    config: &'a AgentConfig,
    store: Arc<dyn IdentityStore>,
    transport: Arc<dyn Transport>,
    state: RegistrarState,
    history: Vec<RegistrarState>,
}

impl<'a> Registrar<'a> {
    pub fn new(
        config: &'a AgentConfig,
        store: Arc<dyn IdentityStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            state: RegistrarState::NoIdentity,
            history: vec![RegistrarState::NoIdentity],
        }
    }

    pub fn state(&self) -> RegistrarState {
        self.state
    }

    /// Every state visited, starting with `NoIdentity`.
    pub fn history(&self) -> &[RegistrarState] {
        &self.history
    }

    fn transition(&mut self, next: RegistrarState) {
        log::info!("registrar: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Load the stored identity, or register a new one.
    pub async fn bootstrap(&mut self) -> Result<Identity> {
        match self.store.load() {
            Ok(Some(identity)) => match identity.validate() {
                Ok(()) => {
                    log::info!(
                        "loaded identity {} from {}",
                        identity.id,
                        self.store.describe()
                    );
                    self.transition(RegistrarState::Registered);
                    return Ok(identity);
                }
                Err(e) => self.load_failed(StoreError::Format(e.to_string()))?,
            },
            Ok(None) => {
                log::info!("no identity stored in {}", self.store.describe());
            }
            Err(e) if e.is_format_error() => self.load_failed(e)?,
            Err(e) => return Err(e.into()),
        }
        self.register().await
    }

    fn load_failed(&mut self, err: StoreError) -> Result<()> {
        self.transition(RegistrarState::LoadFailed);
        match self.config.on_load_failure {
            LoadFailurePolicy::Fail => Err(err.into()),
            LoadFailurePolicy::Register => {
                log::warn!(
                    "stored identity in {} is unusable ({err}); registering a new one",
                    self.store.describe()
                );
                Ok(())
            }
        }
    }

    async fn register(&mut self) -> Result<Identity> {
        let token = self.config.token.clone().ok_or_else(|| {
            AgentError::Config("no identity is stored and no join token is configured".into())
        })?;
        self.transition(RegistrarState::Registering);

        let keys = KeyMaterial::generate(KeyType::default())?;
        let id = IdentityId::mint(self.config.role, self.config.node_name.clone());
        let client = self.open_bootstrap_client().await?;

        log::info!(
            "registering {id} at {} with token {}",
            self.servers().join(","),
            token.redacted()
        );
        let request = RegisterRequest {
            token,
            id: id.clone(),
            ssh_public_key: keys.ssh_public_key().to_string(),
            tls_public_key: keys.tls_public_key().to_string(),
            dns_names: self.config.dns_names.clone(),
            additional_principals: self.config.additional_principals.clone(),
        };
        let certs = with_deadline(self.config.request_timeout, client.register(request))
            .await
            .map_err(|e| self.classify(e))?;

        if !self.config.ca_pins.is_empty()
            && pin::find_pinned(&certs.tls_ca_certs, &self.config.ca_pins).is_none()
        {
            return Err(RegistrationError::InvalidResponse(
                "issued CA bundle does not contain the pinned CA".into(),
            )
            .into());
        }

        let identity = Identity::new(id, keys, certs);
        identity
            .validate()
            .map_err(|e| RegistrationError::InvalidResponse(e.to_string()))?;

        self.store.save(&identity)?;
        log::info!("identity {} saved to {}", identity.id, self.store.describe());
        self.transition(RegistrarState::Registered);
        Ok(identity)
    }

    /// Open the bootstrap client, pinning the cluster CA when pins are
    /// configured.
    pub async fn open_bootstrap_client(&self) -> Result<Arc<dyn BootstrapApi>> {
        let servers = self.servers();
        let insecure = ClientFactory::Bootstrap(BootstrapTrust::Insecure)
            .connect_bootstrap(self.transport.as_ref(), servers)
            .map_err(|e| self.classify_agent(e))?;

        if self.config.ca_pins.is_empty() {
            log::warn!("no CA pins configured; trusting the control plane on first use");
            return Ok(insecure);
        }

        let cas = with_deadline(self.config.request_timeout, insecure.cluster_ca_certs())
            .await
            .map_err(|e| self.classify(e))?;
        let pinned = pin::find_pinned(&cas, &self.config.ca_pins)
            .ok_or(RegistrationError::CaPinMismatch)?;
        log::info!("cluster CA matched a configured pin");

        ClientFactory::Bootstrap(BootstrapTrust::Pinned(vec![pinned.clone()]))
            .connect_bootstrap(self.transport.as_ref(), servers)
            .map_err(|e| self.classify_agent(e))
    }

    fn servers(&self) -> &[String] {
        &self.config.auth_servers
    }

    fn classify(&self, err: ApiError) -> AgentError {
        RegistrationError::from_api(err, self.servers()).into()
    }

    fn classify_agent(&self, err: AgentError) -> AgentError {
        match err {
            AgentError::Api(e) => self.classify(e),
            other => other,
        }
    }
}
