//! The agent's primary flow.
//!
//! ```text
//! bootstrap (load or register) → build client → publish session
//!     → [optional] delegated user certificates
//!     → heartbeat task + rotation checks until cancelled
//! ```
//!
//! Registration completes and is persisted before the heartbeat starts.
//! Rotation failures never stop the agent; it keeps the current identity
//! and tries again at the next check.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::client::{factory, CredentialBundle, RotationState, Transport};
use crate::config::AgentConfig;
use crate::crypto::keys::{KeyMaterial, KeyType};
use crate::delegation::CredentialIssuer;
use crate::error::Result;
use crate::heartbeat::{
    identity_server_info, Heartbeat, HeartbeatCallback, HeartbeatConfig, HeartbeatMode,
    RestrictedAnnouncer, SessionAnnouncer,
};
use crate::identity::Identity;
use crate::register::{Registrar, RegistrarState};
use crate::rotation::{NameOverrides, RotationPolicy, Rotator};
use crate::session::{Session, SessionHandle};
use crate::storage::{DestinationSpec, DirectoryStore, IdentityStore};

/// Component name this agent's heartbeat reports under.
pub const HEARTBEAT_COMPONENT: &str = "fleetbot";

/// A bootstrapped agent holding a live session.
pub struct Agent {
    config: AgentConfig,
    store: Arc<dyn IdentityStore>,
    transport: Arc<dyn Transport>,
    session: SessionHandle,
    history: Vec<RegistrarState>,
    on_heartbeat: Option<HeartbeatCallback>,
}

impl Agent {
    /// Validate `config`, open its destination and bootstrap.
    pub async fn bootstrap(config: AgentConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let store = config.destination.open(config.passphrase.clone());
        Self::bootstrap_with_store(config, store, transport).await
    }

    /// Bootstrap against an already opened store.
    pub async fn bootstrap_with_store(
        config: AgentConfig,
        store: Arc<dyn IdentityStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let (identity, history) = {
            let mut registrar = Registrar::new(&config, store.clone(), transport.clone());
            let identity = registrar.bootstrap().await?;
            (identity, registrar.history().to_vec())
        };

        let identity = Arc::new(identity);
        let client = factory::build(identity.clone(), transport.as_ref(), &config.auth_servers)?;
        let session = SessionHandle::new(Session::new(identity, client));

        Ok(Self {
            config,
            store,
            transport,
            session,
            history,
            on_heartbeat: None,
        })
    }

    /// Observe every heartbeat outcome.
    #[must_use]
    pub fn on_heartbeat(mut self, callback: HeartbeatCallback) -> Self {
        self.on_heartbeat = Some(callback);
        self
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn identity(&self) -> Arc<Identity> {
        self.session.current().identity.clone()
    }

    /// Registrar states visited during bootstrap.
    pub fn registrar_history(&self) -> &[RegistrarState] {
        &self.history
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Heartbeat descriptor for the current identity.
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        let identity = self.identity();
        let announcer = RestrictedAnnouncer::new(SessionAnnouncer::new(self.session.clone()));
        let mut config = HeartbeatConfig::new(
            HEARTBEAT_COMPONENT,
            HeartbeatMode::from(identity.id.role),
            Arc::new(announcer),
            identity_server_info(&identity),
        )
        .ttl(self.config.announce_ttl)
        .keep_alive_period(self.config.keep_alive_period)
        .check_period(self.config.check_period)
        .call_timeout(self.config.request_timeout);
        if let Some(callback) = &self.on_heartbeat {
            config = config.on_heartbeat(callback.clone());
        }
        config
    }

    pub fn rotator(&self) -> Rotator {
        Rotator::new(
            self.store.clone(),
            self.transport.clone(),
            self.config.auth_servers.clone(),
            self.session.clone(),
        )
        .overrides(NameOverrides {
            dns_names: self.config.dns_names.clone(),
            additional_principals: self.config.additional_principals.clone(),
        })
        .deadline(self.config.request_timeout)
    }

    /// Rotate once, now.
    pub async fn rotate_now(&self) -> Result<Arc<Session>> {
        Ok(self
            .rotator()
            .rotate_and_install(RotationState::default())
            .await?)
    }

    /// Request the delegated credentials named in `user_certs`, if any.
    ///
    /// A fresh key pair is generated for the principal. With a `dir:`
    /// destination the bundle is exported under `users/<principal>/`,
    /// with the key sealed when the agent has a passphrase.
    pub async fn issue_configured_user_certs(
        &self,
    ) -> Result<Option<(KeyMaterial, CredentialBundle)>> {
        let Some(settings) = &self.config.user_certs else {
            return Ok(None);
        };
        let keys = KeyMaterial::generate(KeyType::default())?;
        let bundle = CredentialIssuer::new(self.config.request_timeout)
            .issue_for_session(
                &self.session,
                &settings.principal,
                keys.ssh_public_key(),
                settings.ttl,
            )
            .await?;

        if let Some(dir) = self.export_dir() {
            let written = DirectoryStore::new(dir, self.config.passphrase.clone())
                .save_user_credentials(&keys, &bundle)?;
            log::info!(
                "user certificates for {} written to {}",
                bundle.principal,
                written.display()
            );
        }
        Ok(Some((keys, bundle)))
    }

    fn export_dir(&self) -> Option<PathBuf> {
        match &self.config.destination {
            DestinationSpec::Directory(path) => Some(path.clone()),
            DestinationSpec::Memory => None,
        }
    }

    /// Heartbeat and rotation checks until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let heartbeat = Heartbeat::new(self.heartbeat_config())?;

        if let Err(e) = self.issue_configured_user_certs().await {
            log::warn!("delegated user certificates not issued: {e}");
        }

        let heartbeat_cancel = cancel.child_token();
        let heartbeat_task = heartbeat.spawn(heartbeat_cancel.clone());

        let policy = RotationPolicy::new(self.config.rotation.renew_fraction);
        let rotator = self.rotator();
        let mut ticker = tokio::time::interval(self.config.rotation.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = self.session.current();
            if !policy.due(&current.identity, Utc::now()) {
                continue;
            }
            log::info!("certificate of {} is due for rotation", current.identity.id);

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = rotator.rotate_and_install(RotationState::default()) => match result {
                    Ok(session) => log::info!(
                        "rotation complete, certificates issued {}",
                        session.identity.issued_at
                    ),
                    Err(e) => log::warn!("rotation failed, keeping current identity: {e}"),
                },
            }
        }

        heartbeat_cancel.cancel();
        if let Err(e) = heartbeat_task.await {
            log::error!("heartbeat task ended abnormally: {e}");
        }
        log::info!("agent stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("session", &self.session.current())
            .field("store", &self.store.describe())
            .finish_non_exhaustive()
    }
}
