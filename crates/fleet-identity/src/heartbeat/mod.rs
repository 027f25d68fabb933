//! Heartbeat reporter.
//!
//! A background loop that keeps the agent's presence record alive. Every
//! check period it decides between a full announce (fresh snapshot from the
//! server-info factory, expiry stamped now + TTL) and a cheap keep-alive of
//! the current lease:
//!
//! - announce when there is no lease, when the snapshot changed, or when the
//!   jittered announce deadline passed;
//! - otherwise keep-alive once the keep-alive period elapsed.
//!
//! A failed beat is reported to `on_heartbeat` and logged; the loop keeps
//! going. Only cancellation stops it.

pub mod announcer;
pub mod jitter;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::{with_deadline, ApiError, KeepAlive, Lease, ResourceKind, ServerResource};
use crate::config::{
    DEFAULT_ANNOUNCE_TTL, DEFAULT_CHECK_PERIOD, DEFAULT_KEEP_ALIVE_PERIOD, MAX_DURATION,
};
use crate::error::HeartbeatError;
use crate::identity::{Identity, Role};

pub use announcer::{Announcer, RestrictedAnnouncer, SessionAnnouncer};

/// Namespace presence records are written to.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Which presence record the heartbeat maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    Node,
    Bot,
    Proxy,
    Auth,
}

impl HeartbeatMode {
    /// Node and bot records are leased and kept alive between announces.
    pub fn uses_lease(&self) -> bool {
        matches!(self, Self::Node | Self::Bot)
    }

    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            Self::Node => ResourceKind::Node,
            Self::Bot => ResourceKind::Bot,
            Self::Proxy => ResourceKind::Proxy,
            Self::Auth => ResourceKind::AuthServer,
        }
    }
}

impl From<Role> for HeartbeatMode {
    fn from(role: Role) -> Self {
        match role {
            Role::Node => Self::Node,
            Role::Bot => Self::Bot,
        }
    }
}

/// Result of one successful network beat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeatOutcome {
    Announced,
    KeptAlive,
}

pub type ServerInfoFn = Arc<dyn Fn() -> Result<ServerResource, HeartbeatError> + Send + Sync>;
pub type HeartbeatCallback = Arc<dyn Fn(Result<BeatOutcome, HeartbeatError>) + Send + Sync>;

/// Heartbeat descriptor. Built fresh for every run.
#[derive(Clone)]
pub struct HeartbeatConfig {
    pub component: String,
    pub mode: HeartbeatMode,
    pub announcer: Arc<dyn Announcer>,
    /// Produces the current snapshot; its expiry is overwritten at call time.
    pub server_info: ServerInfoFn,
    pub keep_alive_period: Duration,
    /// Base announce period, jittered by up to a tenth on every cycle.
    pub announce_period: Duration,
    pub check_period: Duration,
    pub server_ttl: Duration,
    /// Upper bound on one network call.
    pub call_timeout: Duration,
    pub on_heartbeat: Option<HeartbeatCallback>,
}

impl HeartbeatConfig {
    /// A descriptor with default timing.
    pub fn new(
        component: impl Into<String>,
        mode: HeartbeatMode,
        announcer: Arc<dyn Announcer>,
        server_info: ServerInfoFn,
    ) -> Self {
        Self {
            component: component.into(),
            mode,
            announcer,
            server_info,
            keep_alive_period: DEFAULT_KEEP_ALIVE_PERIOD,
            announce_period: jitter::default_announce_period(DEFAULT_ANNOUNCE_TTL),
            check_period: DEFAULT_CHECK_PERIOD,
            server_ttl: DEFAULT_ANNOUNCE_TTL,
            call_timeout: Duration::from_secs(30),
            on_heartbeat: None,
        }
    }

    /// Set the announce TTL and derive the announce period from it.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.server_ttl = ttl;
        self.announce_period = jitter::default_announce_period(ttl);
        self
    }

    #[must_use]
    pub fn keep_alive_period(mut self, period: Duration) -> Self {
        self.keep_alive_period = period;
        self
    }

    #[must_use]
    pub fn check_period(mut self, period: Duration) -> Self {
        self.check_period = period;
        self
    }

    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn on_heartbeat(mut self, callback: HeartbeatCallback) -> Self {
        self.on_heartbeat = Some(callback);
        self
    }

    fn validate(&self) -> Result<(), HeartbeatError> {
        if self.component.is_empty() {
            return Err(HeartbeatError::Config("component name is empty".into()));
        }
        for (name, value) in [
            ("keep_alive_period", self.keep_alive_period),
            ("announce_period", self.announce_period),
            ("check_period", self.check_period),
            ("server_ttl", self.server_ttl),
            ("call_timeout", self.call_timeout),
        ] {
            if value.is_zero() {
                return Err(HeartbeatError::Config(format!("{name} must be non-zero")));
            }
            if value > MAX_DURATION {
                return Err(HeartbeatError::Config(format!(
                    "{name} {value:?} exceeds the maximum of {MAX_DURATION:?}"
                )));
            }
        }
        if self.mode.uses_lease() && self.keep_alive_period >= self.server_ttl {
            return Err(HeartbeatError::Config(format!(
                "keep_alive_period {:?} must be shorter than the TTL {:?}",
                self.keep_alive_period, self.server_ttl
            )));
        }
        if self.announce_period >= self.server_ttl {
            return Err(HeartbeatError::Config(format!(
                "announce_period {:?} must be shorter than the TTL {:?}",
                self.announce_period, self.server_ttl
            )));
        }
        Ok(())
    }
}

/// Presence snapshot factory for the agent's own identity.
pub fn identity_server_info(identity: &Identity) -> ServerInfoFn {
    let kind = HeartbeatMode::from(identity.id.role).resource_kind();
    let name = identity.id.node_name.clone();
    let host_id = identity.id.host_uuid.clone();
    Arc::new(move || {
        Ok(ServerResource {
            kind,
            name: name.clone(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            host_id: host_id.clone(),
            addr: String::new(),
            labels: Default::default(),
            expires: Utc::now(),
        })
    })
}

/// A validated heartbeat ready to run.
pub struct Heartbeat {
    config: HeartbeatConfig,
    lease: Option<Lease>,
    announced: bool,
    last_snapshot: Option<ServerResource>,
    next_announce: Instant,
    next_keep_alive: Instant,
}

impl Heartbeat {
    /// Fails fast on a misconfigured descriptor.
    pub fn new(config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        config.validate()?;
        let now = Instant::now();
        Ok(Self {
            config,
            lease: None,
            announced: false,
            last_snapshot: None,
            next_announce: now,
            next_keep_alive: now,
        })
    }

    /// Run on a background task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Beat every check period until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let check = self.config.check_period;
        let mut ticker = tokio::time::interval(check);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_beat = Instant::now();
        log::info!(
            "heartbeat {} started ({:?} mode, announce every {:?})",
            self.config.component,
            self.config.mode,
            self.config.announce_period
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let late = now.saturating_duration_since(last_beat);
            let drifted = late > check.saturating_mul(2);
            if drifted {
                log::warn!(
                    "heartbeat {} check fired {:?} late; rescheduling",
                    self.config.component,
                    late - check
                );
                self.next_keep_alive = now;
            }

            self.beat(now, drifted, &cancel).await;
            last_beat = Instant::now();
        }
        log::info!("heartbeat {} stopped", self.config.component);
    }

    async fn beat(&mut self, now: Instant, force_announce: bool, cancel: &CancellationToken) {
        let snapshot = match (self.config.server_info)() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.report(Err(e));
                return;
            }
        };

        let changed = self
            .last_snapshot
            .as_ref()
            .map_or(true, |prev| !prev.same_content(&snapshot));
        let unannounced = if self.config.mode.uses_lease() {
            self.lease.is_none()
        } else {
            !self.announced
        };

        if force_announce || unannounced || changed || now >= self.next_announce {
            self.announce(snapshot, now, cancel).await;
        } else if self.config.mode.uses_lease() && now >= self.next_keep_alive {
            self.keep_alive(now, cancel).await;
        }
    }

    async fn announce(
        &mut self,
        mut snapshot: ServerResource,
        now: Instant,
        cancel: &CancellationToken,
    ) {
        snapshot.expires = match expiry_after(self.config.server_ttl) {
            Ok(expires) => expires,
            Err(e) => {
                self.report(Err(e));
                return;
            }
        };
        let announcer = self.config.announcer.clone();
        let result = match self.config.mode {
            HeartbeatMode::Node | HeartbeatMode::Bot => {
                self.bounded(cancel, announcer.upsert_presence(&snapshot))
                    .await
                    .map(|r| r.map(Some))
            }
            HeartbeatMode::Proxy => self
                .bounded(cancel, announcer.upsert_proxy(&snapshot))
                .await
                .map(|r| r.map(|()| None)),
            HeartbeatMode::Auth => self
                .bounded(cancel, announcer.upsert_auth_server(&snapshot))
                .await
                .map(|r| r.map(|()| None)),
        };

        match result {
            None => {}
            Some(Ok(lease)) => {
                self.lease = lease;
                self.announced = true;
                self.last_snapshot = Some(snapshot);
                let scheduled = after(now, jitter::jittered(self.config.announce_period))
                    .and_then(|announce| {
                        after(now, self.config.keep_alive_period).map(|keep| (announce, keep))
                    });
                match scheduled {
                    Ok((next_announce, next_keep_alive)) => {
                        self.next_announce = next_announce;
                        self.next_keep_alive = next_keep_alive;
                        self.report(Ok(BeatOutcome::Announced));
                    }
                    Err(e) => self.report(Err(e)),
                }
            }
            Some(Err(e)) => self.report(Err(HeartbeatError::Announce(e.to_string()))),
        }
    }

    async fn keep_alive(&mut self, now: Instant, cancel: &CancellationToken) {
        let Some(lease) = self.lease.as_ref() else {
            return;
        };
        let expires = match expiry_after(self.config.server_ttl) {
            Ok(expires) => expires,
            Err(e) => {
                self.report(Err(e));
                return;
            }
        };
        let keep_alive = KeepAlive::for_lease(lease, expires);
        let announcer = self.config.announcer.clone();

        match self.bounded(cancel, announcer.keep_alive(&keep_alive)).await {
            None => {}
            Some(Ok(())) => {
                if let Some(lease) = self.lease.as_mut() {
                    lease.expires = keep_alive.expires;
                }
                match after(now, self.config.keep_alive_period) {
                    Ok(next) => {
                        self.next_keep_alive = next;
                        self.report(Ok(BeatOutcome::KeptAlive));
                    }
                    Err(e) => self.report(Err(e)),
                }
            }
            Some(Err(e)) => {
                self.lease = None;
                self.announced = false;
                self.report(Err(HeartbeatError::KeepAlive(e.to_string())));
            }
        }
    }

    /// Race one network call against the timeout and cancellation. `None`
    /// means cancelled.
    async fn bounded<T>(
        &self,
        cancel: &CancellationToken,
        call: impl std::future::Future<Output = Result<T, ApiError>>,
    ) -> Option<Result<T, ApiError>> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            result = with_deadline(self.config.call_timeout, call) => Some(result),
        }
    }

    fn report(&self, outcome: Result<BeatOutcome, HeartbeatError>) {
        match &outcome {
            Ok(beat) => log::debug!("heartbeat {}: {beat:?}", self.config.component),
            Err(e) => log::warn!("heartbeat {}: {e}", self.config.component),
        }
        if let Some(callback) = &self.config.on_heartbeat {
            callback(outcome);
        }
    }
}

/// Wall-clock expiry `ttl` from now.
fn expiry_after(ttl: Duration) -> Result<DateTime<Utc>, HeartbeatError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| HeartbeatError::Config(format!("ttl {ttl:?} is out of range")))
}

fn after(now: Instant, period: Duration) -> Result<Instant, HeartbeatError> {
    now.checked_add(period)
        .ok_or_else(|| HeartbeatError::Config(format!("period {period:?} is out of range")))
}
