//! Azure AD tokens for AKS clusters with AAD integration.
use std::{fmt, path::PathBuf, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderValue, Request, StatusCode,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{de, Deserialize, Deserializer};
use tower::BoxError;

use super::{non_empty, AccessToken, CachedToken, Clock, CloseFlag, Error, TokenCache, TOKEN_SKEW_SECONDS};
use crate::{
    client::{Body, Transport},
    config::Environment,
    error::ConfigError,
};

/// `AZURE_TENANT_ID`
pub const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
/// `AZURE_CLIENT_ID`
pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
/// `AZURE_CLIENT_SECRET`
pub const AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
/// `AZURE_FEDERATED_TOKEN_FILE`
pub const AZURE_FEDERATED_TOKEN_FILE: &str = "AZURE_FEDERATED_TOKEN_FILE";
/// `AZURE_AUTHORITY_HOST`
pub const AZURE_AUTHORITY_HOST: &str = "AZURE_AUTHORITY_HOST";

/// Scope of the AKS AAD server application.
pub const AKS_SCOPE: &str = "6dae42f8-4368-4678-94ff-3960e28e3630/.default";

const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const JWT_BEARER_ASSERTION: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

#[derive(thiserror::Error, Debug)]
/// Possible errors when requesting a token from Azure AD
pub enum AzureError {
    /// Failed to build a request
    #[error("failed to build token request: {0}")]
    BuildRequest(#[source] http::Error),

    /// The transport failed
    #[error("token request failed: {0}")]
    Request(#[source] BoxError),

    /// Azure AD rejected the request
    #[error("Azure AD returned {status}: {error}: {description}")]
    Rejected {
        /// HTTP status
        status: StatusCode,
        /// OAuth2 error code
        error: String,
        /// Error description
        description: String,
    },

    /// The token response is not the expected JSON
    #[error("failed to parse token response: {0}")]
    ParseResponse(#[source] serde_json::Error),

    /// Failed to read the federated token file
    #[error("failed to read federated token file '{path:?}': {source}")]
    ReadAssertion {
        /// The file
        path: PathBuf,
        /// The cause
        #[source]
        source: std::io::Error,
    },
}

/// A source of Azure AD access tokens.
pub trait TokenCredential: Send + Sync + fmt::Debug {
    /// Request a token for `scopes`.
    fn get_token<'a>(&'a self, scopes: &'a [String]) -> BoxFuture<'a, Result<AccessToken, BoxError>>;

    /// Release network resources. Repeated calls are no-ops.
    fn close(&self) {}
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default, deserialize_with = "deserialize_expires_in")]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Azure AD sends `expires_in` as a number or as a string.
fn deserialize_expires_in<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| Some(n.as_f64()? as i64))
            .map(Some)
            .ok_or(de::Error::custom("cannot be casted to i64")),
        Some(serde_json::Value::String(s)) => s.trim().parse().map(Some).map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!("unexpected expires_in {other}"))),
    }
}

/// The v2.0 token endpoint of a tenant.
#[derive(Clone, Debug)]
struct TokenEndpoint {
    transport: Transport,
    url: String,
    clock: Clock,
}

impl TokenEndpoint {
    fn new(transport: Transport, authority_host: &str, tenant_id: &str) -> Self {
        let url = format!(
            "{}/{tenant_id}/oauth2/v2.0/token",
            authority_host.trim_end_matches('/')
        );
        Self {
            transport,
            url,
            clock: Clock::default(),
        }
    }

    /// `expires_in` seconds from now, or an unknown expiry when that is out of range.
    fn expires_on(&self, expires_in: Option<i64>) -> Option<DateTime<Utc>> {
        let seconds = expires_in?;
        let expires_on = Duration::try_seconds(seconds).and_then(|d| self.clock.now().checked_add_signed(d));
        if expires_on.is_none() {
            tracing::warn!(expires_in = seconds, "ignoring out of range token lifetime");
        }
        expires_on
    }

    async fn request(&self, params: &[(&str, &str)]) -> Result<AccessToken, AzureError> {
        let form = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        let req = Request::post(self.url.as_str())
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .body(Body::from(form))
            .map_err(AzureError::BuildRequest)?;
        let res = self.transport.send(req).await.map_err(AzureError::Request)?;
        let status = res.status();
        if !status.is_success() {
            let (error, description) = match serde_json::from_slice::<ErrorResponse>(res.body()) {
                Ok(e) => (e.error, e.error_description),
                Err(_) => (
                    "unknown".to_owned(),
                    String::from_utf8_lossy(res.body()).trim().to_owned(),
                ),
            };
            return Err(AzureError::Rejected {
                status,
                error,
                description,
            });
        }
        let token: TokenResponse = serde_json::from_slice(res.body()).map_err(AzureError::ParseResponse)?;
        Ok(AccessToken {
            token: SecretString::from(token.access_token),
            expires_on: self.expires_on(token.expires_in),
        })
    }
}

/// OAuth2 client credentials grant with a client secret.
pub struct ClientSecretCredential {
    endpoint: TokenEndpoint,
    client_id: String,
    client_secret: SecretString,
}

impl fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("endpoint", &self.endpoint.url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ClientSecretCredential {
    /// Authenticate `client_id` in `tenant_id` against `authority_host`.
    pub fn new(
        transport: Transport,
        authority_host: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            endpoint: TokenEndpoint::new(transport, authority_host, tenant_id),
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// Compute token expiry with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.endpoint.clock = clock;
        self
    }

    async fn fetch(&self, scopes: &[String]) -> Result<AccessToken, AzureError> {
        let scope = scopes.join(" ");
        self.endpoint
            .request(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("scope", scope.as_str()),
            ])
            .await
    }
}

impl TokenCredential for ClientSecretCredential {
    fn get_token<'a>(&'a self, scopes: &'a [String]) -> BoxFuture<'a, Result<AccessToken, BoxError>> {
        async move { self.fetch(scopes).await.map_err(BoxError::from) }.boxed()
    }

    fn close(&self) {
        self.endpoint.transport.close();
    }
}

/// OAuth2 client credentials grant asserting a federated token, as projected by AKS
/// workload identity.
///
/// The token file is read again for every request since the kubelet rotates it.
#[derive(Debug)]
pub struct WorkloadIdentityCredential {
    endpoint: TokenEndpoint,
    client_id: String,
    token_file: PathBuf,
}

impl WorkloadIdentityCredential {
    /// Authenticate `client_id` in `tenant_id` with the token in `token_file`.
    pub fn new(
        transport: Transport,
        authority_host: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        token_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            endpoint: TokenEndpoint::new(transport, authority_host, tenant_id),
            client_id: client_id.into(),
            token_file: token_file.into(),
        }
    }

    /// Compute token expiry with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.endpoint.clock = clock;
        self
    }

    async fn fetch(&self, scopes: &[String]) -> Result<AccessToken, AzureError> {
        let assertion = tokio::fs::read_to_string(&self.token_file)
            .await
            .map_err(|source| AzureError::ReadAssertion {
                path: self.token_file.clone(),
                source,
            })?;
        let scope = scopes.join(" ");
        self.endpoint
            .request(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_assertion_type", JWT_BEARER_ASSERTION),
                ("client_assertion", assertion.trim()),
                ("scope", scope.as_str()),
            ])
            .await
    }
}

impl TokenCredential for WorkloadIdentityCredential {
    fn get_token<'a>(&'a self, scopes: &'a [String]) -> BoxFuture<'a, Result<AccessToken, BoxError>> {
        async move { self.fetch(scopes).await.map_err(BoxError::from) }.boxed()
    }

    fn close(&self) {
        self.endpoint.transport.close();
    }
}

/// Configuration of the built-in Azure credentials.
///
/// Unset values fall back to the `AZURE_*` environment variables. A client secret takes
/// precedence over a federated token file.
#[derive(Clone, Default)]
pub struct AzureConfig {
    /// Directory (tenant) id
    pub tenant_id: Option<String>,
    /// Application (client) id
    pub client_id: Option<String>,
    /// Client secret
    pub client_secret: Option<SecretString>,
    /// Federated token file for workload identity
    pub federated_token_file: Option<PathBuf>,
    /// Authority host, `https://login.microsoftonline.com` when unset
    pub authority_host: Option<String>,
}

impl fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("federated_token_file", &self.federated_token_file)
            .field("authority_host", &self.authority_host)
            .finish()
    }
}

enum Grant {
    ClientSecret(SecretString),
    WorkloadIdentity(PathBuf),
}

impl Grant {
    fn name(&self) -> &'static str {
        match self {
            Self::ClientSecret(_) => "client secret",
            Self::WorkloadIdentity(_) => "workload identity",
        }
    }
}

struct ResolvedAzure {
    tenant_id: String,
    client_id: String,
    authority_host: String,
    grant: Grant,
}

impl ResolvedAzure {
    fn into_credential(self, transport: Transport) -> Arc<dyn TokenCredential> {
        match self.grant {
            Grant::ClientSecret(secret) => Arc::new(ClientSecretCredential::new(
                transport,
                &self.authority_host,
                &self.tenant_id,
                self.client_id,
                secret,
            )),
            Grant::WorkloadIdentity(file) => Arc::new(WorkloadIdentityCredential::new(
                transport,
                &self.authority_host,
                &self.tenant_id,
                self.client_id,
                file,
            )),
        }
    }
}

impl AzureConfig {
    fn resolve(self, env: &Environment) -> Result<ResolvedAzure, ConfigError> {
        let tenant_id = env.require(self.tenant_id.as_deref(), "tenant_id", AZURE_TENANT_ID)?;
        let client_id = env.require(self.client_id.as_deref(), "client_id", AZURE_CLIENT_ID)?;
        let authority_host = env
            .resolve(self.authority_host.as_deref(), &[AZURE_AUTHORITY_HOST])
            .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_owned());
        let client_secret = self
            .client_secret
            .filter(|s| !s.expose_secret().is_empty())
            .or_else(|| env.get(AZURE_CLIENT_SECRET).map(|s| SecretString::from(s.to_owned())));
        let federated_token_file = self
            .federated_token_file
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(|| env.get(AZURE_FEDERATED_TOKEN_FILE).map(PathBuf::from));
        let grant = match (client_secret, federated_token_file) {
            (Some(secret), _) => Grant::ClientSecret(secret),
            (None, Some(file)) => Grant::WorkloadIdentity(file),
            (None, None) => {
                return Err(ConfigError::MissingField {
                    field: "client_secret",
                    env: AZURE_CLIENT_SECRET,
                })
            }
        };
        Ok(ResolvedAzure {
            tenant_id,
            client_id,
            authority_host,
            grant,
        })
    }
}

/// Bearer tokens from an Azure [`TokenCredential`].
#[derive(Debug)]
pub struct AzureAuthProvider {
    credential: Arc<dyn TokenCredential>,
    scopes: Vec<String>,
    cache: TokenCache,
    closed: CloseFlag,
}

impl AzureAuthProvider {
    /// Wrap `credential`, requesting the AKS scope.
    pub fn new(credential: impl TokenCredential + 'static) -> Self {
        Self::from_shared(Arc::new(credential))
    }

    /// A provider with a built-in credential chosen from the process environment.
    #[cfg(feature = "rustls-tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls-tls")))]
    pub fn try_default() -> crate::Result<Self> {
        Self::try_from_config(AzureConfig::default(), &Environment::from_process())
    }

    /// A provider with a built-in credential chosen from `config`, falling back to `env`.
    #[cfg(feature = "rustls-tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls-tls")))]
    pub fn try_from_config(config: AzureConfig, env: &Environment) -> crate::Result<Self> {
        let resolved = config.resolve(env).map_err(crate::Error::Configuration)?;
        tracing::debug!(grant = resolved.grant.name(), tenant = %resolved.tenant_id, "configured Azure authentication");
        let credential = resolved.into_credential(Transport::https()?);
        Ok(Self::from_shared(credential))
    }

    fn from_shared(credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            credential,
            scopes: vec![AKS_SCOPE.to_owned()],
            cache: TokenCache::new(Duration::seconds(TOKEN_SKEW_SECONDS)),
            closed: CloseFlag::default(),
        }
    }

    /// Request `scopes` instead of the AKS scope.
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Expire tokens with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.cache = self.cache.with_clock(clock);
        self
    }

    /// The requested scopes.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub(crate) async fn token(&self) -> Result<SecretString, Error> {
        self.cache.get_or_refresh(|| self.fetch()).await
    }

    pub(crate) fn needs_refresh(&self) -> bool {
        self.cache.needs_refresh()
    }

    pub(crate) async fn refresh(&self) -> Result<(), Error> {
        self.cache.refresh_with(|| self.fetch()).await.map(|_| ())
    }

    pub(crate) fn close(&self) {
        if self.closed.close() {
            self.credential.close();
            self.cache.clear();
            tracing::debug!("closed Azure authentication provider");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    async fn fetch(&self) -> Result<CachedToken, Error> {
        let token = self
            .credential
            .get_token(&self.scopes)
            .await
            .map_err(Error::AzureToken)?;
        tracing::debug!(expires_on = ?token.expires_on, "refreshed Azure token");
        non_empty(CachedToken::from(token))
    }
}
