//! Delegated user credentials.
//!
//! An authenticated agent can request renewable certificates for another
//! principal. The requested lifetime is clamped to the agent's own TLS
//! certificate so a delegated bundle never outlives the identity that
//! vouched for it.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::client::{
    with_deadline, ApiError, AuthApi, BootstrapApi, CredentialBundle, RenewableCertsRequest,
    UserCertsRequest,
};
use crate::config::{JoinToken, DEFAULT_REQUEST_TIMEOUT};
use crate::crypto::keys::parse_ssh_authorized_key;
use crate::error::IssuanceError;
use crate::identity::Identity;
use crate::session::SessionHandle;

#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    deadline: Duration,
}

impl Default for CredentialIssuer {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl CredentialIssuer {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    /// Request certificates for `principal` using `issuer`'s client.
    pub async fn issue(
        &self,
        client: &dyn AuthApi,
        issuer: &Identity,
        principal: &str,
        public_key: &str,
        ttl: Duration,
    ) -> Result<CredentialBundle, IssuanceError> {
        validate_request(principal, public_key, ttl)?;

        let not_after = issuer
            .tls_cert_info()
            .map_err(|e| IssuanceError::InvalidRequest(format!("issuing certificate: {e}")))?
            .not_after;
        let now = Utc::now();
        if now >= not_after {
            return Err(IssuanceError::IssuerExpired);
        }
        let expires = clamp_expiry(now, ttl, not_after);

        log::info!("requesting user certificates for {principal} until {expires}");
        let request = UserCertsRequest {
            principal: principal.to_string(),
            public_key: public_key.to_string(),
            expires,
        };
        let bundle = with_deadline(self.deadline, client.generate_user_certs(request)).await?;
        if bundle.expires > not_after {
            return Err(IssuanceError::Request(ApiError::InvalidResponse(format!(
                "bundle expires {} after the issuing identity ({not_after})",
                bundle.expires
            ))));
        }
        Ok(bundle)
    }

    /// [`issue`](Self::issue) through whatever session is current.
    pub async fn issue_for_session(
        &self,
        session: &SessionHandle,
        principal: &str,
        public_key: &str,
        ttl: Duration,
    ) -> Result<CredentialBundle, IssuanceError> {
        let current = session.current();
        self.issue(
            current.client.as_ref(),
            &current.identity,
            principal,
            public_key,
            ttl,
        )
        .await
    }

    /// Request renewable certificates with the join token, before any host
    /// identity exists.
    pub async fn issue_initial(
        &self,
        client: &dyn BootstrapApi,
        token: &JoinToken,
        principal: &str,
        public_key: &str,
        ttl: Duration,
    ) -> Result<CredentialBundle, IssuanceError> {
        validate_request(principal, public_key, ttl)?;
        if token.is_empty() {
            return Err(IssuanceError::InvalidRequest("join token is empty".into()));
        }

        let expires = chrono_duration(ttl)
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| IssuanceError::InvalidRequest(format!("ttl {ttl:?} is out of range")))?;

        log::info!(
            "requesting initial renewable certificates for {principal} with token {}",
            token.redacted()
        );
        let request = RenewableCertsRequest {
            token: token.clone(),
            principal: principal.to_string(),
            public_key: public_key.to_string(),
            expires,
        };
        Ok(with_deadline(self.deadline, client.initial_renewable_user_certs(request)).await?)
    }
}

fn validate_request(principal: &str, public_key: &str, ttl: Duration) -> Result<(), IssuanceError> {
    if principal.trim().is_empty() {
        return Err(IssuanceError::InvalidRequest("principal is empty".into()));
    }
    if ttl.is_zero() {
        return Err(IssuanceError::InvalidRequest("ttl must be positive".into()));
    }
    parse_ssh_authorized_key(public_key)
        .map_err(|e| IssuanceError::InvalidRequest(format!("public key: {e}")))?;
    Ok(())
}

/// `now + ttl`, but never past `not_after`. A ttl too large to represent
/// lands on `not_after`.
pub fn clamp_expiry(now: DateTime<Utc>, ttl: Duration, not_after: DateTime<Utc>) -> DateTime<Utc> {
    chrono_duration(ttl)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .map_or(not_after, |expires| expires.min(not_after))
}

fn chrono_duration(d: Duration) -> Option<chrono::Duration> {
    chrono::Duration::from_std(d).ok()
}
