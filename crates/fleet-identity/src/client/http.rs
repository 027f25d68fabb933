//! JSON over HTTPS binding of the control-plane API.
//!
//! Every call is tried against the configured servers in order; only an
//! `Unreachable` failure moves on to the next address.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::{
    ApiError, AuthApi, BootstrapApi, CredentialBundle, KeepAlive, Lease, ReRegisterRequest,
    RegisterRequest, RenewableCertsRequest, ServerResource, TlsChannel, Transport,
    UserCertsRequest,
};
use crate::identity::IssuedCerts;

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const PATH_CLUSTER_CA: &str = "/v1/bootstrap/ca";
const PATH_REGISTER: &str = "/v1/bootstrap/register";
const PATH_INITIAL_USER_CERTS: &str = "/v1/bootstrap/user-certs";
const PATH_REREGISTER: &str = "/v1/identity/reregister";
const PATH_USER_CERTS: &str = "/v1/identity/user-certs";
const PATH_PRESENCE: &str = "/v1/presence";
const PATH_KEEP_ALIVE: &str = "/v1/presence/keepalive";
const PATH_AUTH_SERVERS: &str = "/v1/auth-servers";
const PATH_PROXIES: &str = "/v1/proxies";

/// Opens reqwest clients over the rustls configuration of a [`TlsChannel`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    scheme: String,
    timeout: Duration,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            scheme: "https".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the URL scheme (useful for testing against plain HTTP).
    #[must_use]
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    fn open(&self, servers: &[String], channel: TlsChannel) -> Result<HttpApi, ApiError> {
        if servers.is_empty() {
            return Err(ApiError::Unreachable("no servers configured".into()));
        }
        log::debug!(
            "opening {} channel to {}",
            channel.kind,
            servers.join(",")
        );
        let http = HttpClient::builder()
            .use_preconfigured_tls((*channel.config).clone())
            .timeout(self.timeout)
            .build()
            .map_err(|e| ApiError::Internal(format!("http client setup: {e}")))?;
        Ok(HttpApi {
            http,
            base_urls: servers
                .iter()
                .map(|s| format!("{}://{s}", self.scheme))
                .collect(),
        })
    }
}

impl Transport for HttpTransport {
    fn open_bootstrap(
        &self,
        servers: &[String],
        channel: TlsChannel,
    ) -> Result<Arc<dyn BootstrapApi>, ApiError> {
        Ok(Arc::new(self.open(servers, channel)?))
    }

    fn open_auth(
        &self,
        servers: &[String],
        channel: TlsChannel,
    ) -> Result<Arc<dyn AuthApi>, ApiError> {
        Ok(Arc::new(self.open(servers, channel)?))
    }
}

struct HttpApi {
    http: HttpClient,
    base_urls: Vec<String>,
}

impl HttpApi {
    async fn call<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let mut last = ApiError::Unreachable("no servers configured".into());
        for base in &self.base_urls {
            let url = format!("{base}{path}");
            log::debug!("{method} {url}");

            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }
            let result = match request.send().await {
                Ok(response) => handle_response(response).await,
                Err(e) => Err(classify_transport_error(&e)),
            };
            match result {
                Err(e) if e.is_unreachable() => {
                    log::warn!("{url}: {e}");
                    last = e;
                }
                other => return other,
            }
        }
        Err(last)
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.call(Method::POST, path, Some(body)).await
    }

    async fn post_empty<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        let _: serde_json::Value = self.post(path, body).await?;
        Ok(())
    }
}

fn classify_transport_error(e: &reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout(e.to_string())
    } else if e.is_decode() {
        ApiError::InvalidResponse(e.to_string())
    } else {
        ApiError::Unreachable(e.to_string())
    }
}

async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

    if status.is_success() {
        let body = if body.trim().is_empty() { "null" } else { body.as_str() };
        return serde_json::from_str(body).map_err(|e| ApiError::InvalidResponse(e.to_string()));
    }

    // Try to parse error message from JSON
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or(body);
    Err(classify_status(status, message))
}

/// Map an HTTP error status to an [`ApiError`] class.
pub fn classify_status(status: StatusCode, message: String) -> ApiError {
    match status.as_u16() {
        400 | 409 | 422 => ApiError::BadRequest(message),
        401 | 403 => ApiError::AccessDenied(message),
        404 => ApiError::NotFound(message),
        408 | 504 => ApiError::Timeout(message),
        502 | 503 => ApiError::Unreachable(message),
        500..=599 => ApiError::Internal(message),
        code => ApiError::InvalidResponse(format!("unexpected status {code}: {message}")),
    }
}

#[async_trait]
impl BootstrapApi for HttpApi {
    async fn cluster_ca_certs(&self) -> Result<Vec<String>, ApiError> {
        self.call::<_, ()>(Method::GET, PATH_CLUSTER_CA, None).await
    }

    async fn register(&self, request: RegisterRequest) -> Result<IssuedCerts, ApiError> {
        self.post(PATH_REGISTER, &request).await
    }

    async fn initial_renewable_user_certs(
        &self,
        request: RenewableCertsRequest,
    ) -> Result<CredentialBundle, ApiError> {
        self.post(PATH_INITIAL_USER_CERTS, &request).await
    }
}

#[async_trait]
impl AuthApi for HttpApi {
    async fn reregister(&self, request: ReRegisterRequest) -> Result<IssuedCerts, ApiError> {
        self.post(PATH_REREGISTER, &request).await
    }

    async fn generate_user_certs(
        &self,
        request: UserCertsRequest,
    ) -> Result<CredentialBundle, ApiError> {
        self.post(PATH_USER_CERTS, &request).await
    }

    async fn upsert_presence(&self, resource: &ServerResource) -> Result<Lease, ApiError> {
        self.post(PATH_PRESENCE, resource).await
    }

    async fn keep_alive(&self, keep_alive: &KeepAlive) -> Result<(), ApiError> {
        self.post_empty(PATH_KEEP_ALIVE, keep_alive).await
    }

    async fn upsert_auth_server(&self, resource: &ServerResource) -> Result<(), ApiError> {
        self.post_empty(PATH_AUTH_SERVERS, resource).await
    }

    async fn upsert_proxy(&self, resource: &ServerResource) -> Result<(), ApiError> {
        self.post_empty(PATH_PROXIES, resource).await
    }
}
