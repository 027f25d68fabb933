//! Credential rotation.
//!
//! Rotation swaps the whole identity: a new key pair and new certificates
//! bound to the same role, host uuid and node name. The current session
//! stays in place until the replacement is persisted, so there is never a
//! moment without a usable credential.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::client::{factory, with_deadline, AuthApi, ReRegisterRequest, RotationState, Transport};
use crate::config::DEFAULT_RENEW_FRACTION;
use crate::crypto::keys::{KeyMaterial, KeyType};
use crate::error::RotationError;
use crate::identity::{CertInfo, Identity};
use crate::session::{Session, SessionHandle};
use crate::storage::IdentityStore;

/// Principal and DNS names requested for the rotated certificates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameOverrides {
    pub dns_names: Vec<String>,
    pub additional_principals: Vec<String>,
}

/// Ask the control plane to re-issue `current` with fresh keys.
///
/// The returned identity is validated but not persisted.
pub async fn rotate(
    client: &dyn AuthApi,
    current: &Identity,
    rotation: RotationState,
    overrides: &NameOverrides,
    deadline: Duration,
) -> Result<Identity, RotationError> {
    let keys = KeyMaterial::generate(KeyType::default())
        .map_err(|e| RotationError::KeyGeneration(e.to_string()))?;

    let request = ReRegisterRequest {
        id: current.id.clone(),
        ssh_public_key: keys.ssh_public_key().to_string(),
        tls_public_key: keys.tls_public_key().to_string(),
        rotation,
        dns_names: overrides.dns_names.clone(),
        additional_principals: overrides.additional_principals.clone(),
    };
    log::info!("requesting re-issued credentials for {}", current.id);
    let mut certs = with_deadline(deadline, client.reregister(request)).await?;
    if certs.cluster_name.is_none() {
        certs.cluster_name = current.certs.cluster_name.clone();
    }

    let rotated = Identity::new(current.id.clone(), keys, certs);
    rotated
        .validate()
        .map_err(|e| RotationError::InvalidResponse(e.to_string()))?;
    if rotated.ssh_public_key() == current.ssh_public_key() {
        return Err(RotationError::InvalidResponse(
            "re-issued identity reuses the current key".into(),
        ));
    }
    Ok(rotated)
}

/// Rotates the current session in place.
pub struct Rotator {
    store: Arc<dyn IdentityStore>,
    transport: Arc<dyn Transport>,
    servers: Vec<String>,
    session: SessionHandle,
    overrides: NameOverrides,
    deadline: Duration,
}

impl Rotator {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        transport: Arc<dyn Transport>,
        servers: Vec<String>,
        session: SessionHandle,
    ) -> Self {
        Self {
            store,
            transport,
            servers,
            session,
            overrides: NameOverrides::default(),
            deadline: crate::config::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn overrides(mut self, overrides: NameOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// rotate → validate → build client → persist → publish.
    ///
    /// Any failure leaves the current session published and the stored
    /// identity untouched.
    pub async fn rotate_and_install(
        &self,
        rotation: RotationState,
    ) -> Result<Arc<Session>, RotationError> {
        let current = self.session.current();
        let rotated = rotate(
            current.client.as_ref(),
            &current.identity,
            rotation,
            &self.overrides,
            self.deadline,
        )
        .await?;

        let rotated = Arc::new(rotated);
        let client = factory::build(rotated.clone(), self.transport.as_ref(), &self.servers)
            .map_err(|e| RotationError::Install(e.to_string()))?;

        self.store.save(&rotated)?;
        log::info!("rotated identity {} persisted to {}", rotated.id, self.store.describe());

        self.session.publish(Session::new(rotated, client));
        Ok(self.session.current())
    }
}

/// When to rotate: once less than `renew_fraction` of the TLS certificate's
/// validity window remains, or once it has expired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationPolicy {
    pub renew_fraction: f64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            renew_fraction: DEFAULT_RENEW_FRACTION,
        }
    }
}

impl RotationPolicy {
    pub fn new(renew_fraction: f64) -> Self {
        Self { renew_fraction }
    }

    pub fn should_rotate(&self, cert: &CertInfo, now: DateTime<Utc>) -> bool {
        if cert.is_expired_at(now) {
            return true;
        }
        let total = (cert.not_after - cert.not_before).num_seconds();
        if total <= 0 {
            return true;
        }
        let remaining = (cert.not_after - now).num_seconds();
        (remaining as f64) < (total as f64) * self.renew_fraction
    }

    /// Evaluate against an identity's TLS certificate.
    pub fn due(&self, identity: &Identity, now: DateTime<Utc>) -> bool {
        match identity.tls_cert_info() {
            Ok(cert) => self.should_rotate(&cert, now),
            Err(e) => {
                log::warn!("cannot inspect certificate of {}: {e}", identity.id);
                false
            }
        }
    }
}
