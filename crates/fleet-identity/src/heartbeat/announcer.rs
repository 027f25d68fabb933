//! The announce capability used by the heartbeat loop.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::{ApiError, AuthApi, KeepAlive, Lease, ServerResource};
use crate::session::SessionHandle;

/// Presence calls a heartbeat makes.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn upsert_presence(&self, resource: &ServerResource) -> Result<Lease, ApiError>;

    async fn keep_alive(&self, keep_alive: &KeepAlive) -> Result<(), ApiError>;

    async fn upsert_auth_server(&self, resource: &ServerResource) -> Result<(), ApiError>;

    async fn upsert_proxy(&self, resource: &ServerResource) -> Result<(), ApiError>;
}

#[async_trait]
impl<T: AuthApi + ?Sized> Announcer for Arc<T> {
    async fn upsert_presence(&self, resource: &ServerResource) -> Result<Lease, ApiError> {
        AuthApi::upsert_presence(self.as_ref(), resource).await
    }

    async fn keep_alive(&self, keep_alive: &KeepAlive) -> Result<(), ApiError> {
        AuthApi::keep_alive(self.as_ref(), keep_alive).await
    }

    async fn upsert_auth_server(&self, resource: &ServerResource) -> Result<(), ApiError> {
        AuthApi::upsert_auth_server(self.as_ref(), resource).await
    }

    async fn upsert_proxy(&self, resource: &ServerResource) -> Result<(), ApiError> {
        AuthApi::upsert_proxy(self.as_ref(), resource).await
    }
}

/// This client cannot manage core topology resources.
///
/// Agents heartbeat with a delegated identity that holds no privilege over
/// auth server and proxy records, so those two upserts succeed here without
/// contacting the control plane. Node and bot presence calls pass through.
pub struct RestrictedAnnouncer<A> {
    inner: A,
}

impl<A: Announcer> RestrictedAnnouncer<A> {
    pub fn new(inner: A) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<A: Announcer> Announcer for RestrictedAnnouncer<A> {
    async fn upsert_presence(&self, resource: &ServerResource) -> Result<Lease, ApiError> {
        self.inner.upsert_presence(resource).await
    }

    async fn keep_alive(&self, keep_alive: &KeepAlive) -> Result<(), ApiError> {
        self.inner.keep_alive(keep_alive).await
    }

    async fn upsert_auth_server(&self, resource: &ServerResource) -> Result<(), ApiError> {
        log::trace!("skipping auth server upsert for {}", resource.name);
        Ok(())
    }

    async fn upsert_proxy(&self, resource: &ServerResource) -> Result<(), ApiError> {
        log::trace!("skipping proxy upsert for {}", resource.name);
        Ok(())
    }
}

/// Announces through whichever client is current at call time, so a
/// rotated identity is picked up on the next beat.
#[derive(Clone)]
pub struct SessionAnnouncer {
    session: SessionHandle,
}

impl SessionAnnouncer {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Announcer for SessionAnnouncer {
    async fn upsert_presence(&self, resource: &ServerResource) -> Result<Lease, ApiError> {
        let client = self.session.current().client.clone();
        client.upsert_presence(resource).await
    }

    async fn keep_alive(&self, keep_alive: &KeepAlive) -> Result<(), ApiError> {
        let client = self.session.current().client.clone();
        client.keep_alive(keep_alive).await
    }

    async fn upsert_auth_server(&self, resource: &ServerResource) -> Result<(), ApiError> {
        let client = self.session.current().client.clone();
        client.upsert_auth_server(resource).await
    }

    async fn upsert_proxy(&self, resource: &ServerResource) -> Result<(), ApiError> {
        let client = self.session.current().client.clone();
        client.upsert_proxy(resource).await
    }
}
