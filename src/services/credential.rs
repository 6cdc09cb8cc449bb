// src/services/credential.rs
//! Bearer-token acquisition for the Azure OpenAI provider.
//!
//! [`default_credential`] mirrors the usual Azure lookup order: a service
//! principal from `AZURE_TENANT_ID`/`AZURE_CLIENT_ID`/`AZURE_CLIENT_SECRET`
//! when all three are set, then the managed identity of the host.

use std::{
    collections::HashMap,
    env,
    fmt::{self, Debug},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Scope for Azure AI services (Azure OpenAI included).
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);
const IDENTITY_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IDENTITY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: SystemTime,
}

impl Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// True when the token is expired or expires within `margin`.
    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.expires_on.duration_since(SystemTime::now()) {
            Ok(remaining) => remaining <= margin,
            Err(_) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("{source_name} credential is unavailable: {reason}")]
    Unavailable {
        source_name: &'static str,
        reason: String,
    },

    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed token response: {0}")]
    Malformed(String),

    #[error("no credential produced a token: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

/// Something that can hand out bearer tokens for a scope.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
}

/// Managed identity endpoints take a resource, not a scope.
pub fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

// Identity endpoints disagree on whether numbers are quoted.
#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Number(u64),
    Text(String),
}

impl Seconds {
    fn get(&self) -> Option<u64> {
        match self {
            Seconds::Number(n) => Some(*n),
            Seconds::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<Seconds>,
    #[serde(default)]
    expires_in: Option<Seconds>,
}

impl TokenResponse {
    fn into_access_token(self) -> Result<AccessToken, CredentialError> {
        let TokenResponse {
            access_token,
            expires_on,
            expires_in,
        } = self;

        let expires_on = match (
            expires_on.as_ref().and_then(Seconds::get),
            expires_in.as_ref().and_then(Seconds::get),
        ) {
            (Some(epoch), _) => UNIX_EPOCH.checked_add(Duration::from_secs(epoch)),
            (None, Some(secs)) => SystemTime::now().checked_add(Duration::from_secs(secs)),
            (None, None) => {
                return Err(CredentialError::Malformed(
                    "neither expires_on nor expires_in present".to_string(),
                ));
            }
        }
        .ok_or_else(|| CredentialError::Malformed("token expiry out of range".to_string()))?;

        if access_token.is_empty() {
            return Err(CredentialError::Malformed("empty access_token".to_string()));
        }

        Ok(AccessToken::new(access_token, expires_on))
    }
}

async fn read_token(response: reqwest::Response) -> Result<AccessToken, CredentialError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CredentialError::Rejected { status, body });
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .map_err(|e| CredentialError::Malformed(e.to_string()))?;
    parsed.into_access_token()
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// OAuth2 client-credentials grant for a service principal.
pub struct ClientSecretCredential {
    http: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("authority_host", &self.authority_host)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl ClientSecretCredential {
    pub fn new(
        http: reqwest::Client,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn with_authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into();
        self
    }

    /// `None` unless tenant, client id and secret are all set.
    pub fn from_env(http: reqwest::Client) -> Option<Self> {
        let credential = Self::new(
            http,
            non_empty_var("AZURE_TENANT_ID")?,
            non_empty_var("AZURE_CLIENT_ID")?,
            non_empty_var("AZURE_CLIENT_SECRET")?,
        );
        Some(match non_empty_var("AZURE_AUTHORITY_HOST") {
            Some(host) => credential.with_authority_host(host),
            None => credential,
        })
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await?;
        read_token(response).await
    }
}

#[derive(Debug, Clone)]
enum ManagedIdentitySource {
    AppService { endpoint: String, header: String },
    Imds { endpoint: String },
}

/// Token from the identity assigned to the host (VM, App Service, Container Apps).
#[derive(Debug)]
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    source: ManagedIdentitySource,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    /// App Service style when `IDENTITY_ENDPOINT`/`IDENTITY_HEADER` are set,
    /// the instance metadata service otherwise.
    pub fn from_env(http: reqwest::Client) -> Self {
        let credential = match (
            non_empty_var("IDENTITY_ENDPOINT"),
            non_empty_var("IDENTITY_HEADER"),
        ) {
            (Some(endpoint), Some(header)) => Self::app_service(http, endpoint, header),
            _ => Self::imds(http, IMDS_ENDPOINT),
        };
        match non_empty_var("AZURE_CLIENT_ID") {
            Some(id) => credential.with_client_id(id),
            None => credential,
        }
    }

    pub fn imds(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            source: ManagedIdentitySource::Imds { endpoint: endpoint.into() },
            client_id: None,
        }
    }

    pub fn app_service(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        header: impl Into<String>,
    ) -> Self {
        Self {
            http,
            source: ManagedIdentitySource::AppService {
                endpoint: endpoint.into(),
                header: header.into(),
            },
            client_id: None,
        }
    }

    /// Select a user-assigned identity.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let resource = scope_to_resource(scope);

        let request = match &self.source {
            ManagedIdentitySource::AppService { endpoint, header } => {
                let mut query = vec![
                    ("api-version", APP_SERVICE_API_VERSION),
                    ("resource", resource),
                ];
                if let Some(id) = &self.client_id {
                    query.push(("client_id", id.as_str()));
                }
                self.http
                    .get(endpoint)
                    .header("X-IDENTITY-HEADER", header)
                    .query(&query)
            }
            ManagedIdentitySource::Imds { endpoint } => {
                let mut query = vec![
                    ("api-version", IMDS_API_VERSION),
                    ("resource", resource),
                ];
                if let Some(id) = &self.client_id {
                    query.push(("client_id", id.as_str()));
                }
                self.http
                    .get(endpoint)
                    .header("Metadata", "true")
                    .query(&query)
            }
        };

        // No reachable endpoint means we are not running on Azure.
        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                CredentialError::Unavailable {
                    source_name: "managed identity",
                    reason: e.to_string(),
                }
            } else {
                CredentialError::Transport(e)
            }
        })?;

        read_token(response).await
    }
}

/// Tries each credential in order and returns the first token.
#[derive(Default)]
pub struct ChainedCredential {
    sources: Vec<(&'static str, Arc<dyn TokenCredential>)>,
}

impl ChainedCredential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, credential: Arc<dyn TokenCredential>) -> Self {
        self.sources.push((name, credential));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|(name, _)| *name).collect()
    }
}

#[async_trait]
impl TokenCredential for ChainedCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let mut failures = Vec::with_capacity(self.sources.len());
        for (name, credential) in &self.sources {
            match credential.get_token(scope).await {
                Ok(token) => {
                    debug!(credential = name, "acquired access token");
                    return Ok(token);
                }
                Err(e @ CredentialError::Unavailable { .. }) => {
                    debug!(credential = name, error = %e, "credential unavailable, trying next");
                    failures.push(format!("{name}: {e}"));
                }
                // A configured source that fails for real ends the chain.
                Err(e) => {
                    warn!(credential = name, error = %e, "credential failed");
                    failures.push(format!("{name}: {e}"));
                    break;
                }
            }
        }
        Err(CredentialError::Exhausted(failures))
    }
}

/// Client for identity endpoints. Off Azure the metadata address usually
/// swallows packets, so connecting must give up quickly.
pub fn identity_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(IDENTITY_CONNECT_TIMEOUT)
        .timeout(IDENTITY_REQUEST_TIMEOUT)
        .build()
}

/// Service principal (when configured) followed by managed identity.
pub fn default_credential() -> reqwest::Result<ChainedCredential> {
    let http = identity_http_client()?;
    let mut chain = ChainedCredential::new();
    if let Some(sp) = ClientSecretCredential::from_env(http.clone()) {
        chain = chain.with("client secret", Arc::new(sp));
    }
    Ok(chain.with(
        "managed identity",
        Arc::new(ManagedIdentityCredential::from_env(http)),
    ))
}

/// Reuses a token per scope until it gets close to expiry.
pub struct CachedCredential<C> {
    inner: C,
    tokens: RwLock<HashMap<String, AccessToken>>,
    refresh_margin: Duration,
}

impl<C> CachedCredential<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            tokens: RwLock::new(HashMap::new()),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }
}

#[async_trait]
impl<C: TokenCredential> TokenCredential for CachedCredential<C> {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        {
            let guard = self.tokens.read().await;
            if let Some(token) = guard
                .get(scope)
                .filter(|t| !t.expires_within(self.refresh_margin))
            {
                return Ok(token.clone());
            }
        }

        let token = self.inner.get_token(scope).await?;
        let mut guard = self.tokens.write().await;
        guard.insert(scope.to_string(), token.clone());
        Ok(token)
    }
}
