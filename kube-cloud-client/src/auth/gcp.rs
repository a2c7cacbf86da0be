//! Google OAuth2 tokens for GKE clusters.
//!
//! A [`GoogleCredential`] is scoped once, on first use, and the resulting
//! [`ScopedCredential`] is kept for the lifetime of the provider.
use std::{fmt, sync::Arc};

use chrono::Duration;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use secrecy::SecretString;
use tower::BoxError;

use super::{non_empty, AccessToken, CachedToken, Clock, CloseFlag, Error, TokenCache, TOKEN_SKEW_SECONDS};

/// `GOOGLE_APPLICATION_CREDENTIALS`
pub const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Scopes requested when none are configured.
pub const DEFAULT_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
];

/// A base Google credential that must be scoped before use.
pub trait GoogleCredential: Send + Sync + fmt::Debug {
    /// Derive a credential limited to `scopes`.
    fn create_scoped(&self, scopes: &[String]) -> Result<Arc<dyn ScopedCredential>, BoxError>;
}

/// A Google credential bound to a set of scopes.
pub trait ScopedCredential: Send + Sync + fmt::Debug {
    /// Fetch an access token, refreshing it if the credential decides to.
    fn access_token(&self) -> BoxFuture<'_, Result<AccessToken, BoxError>>;

    /// Release network resources. Repeated calls are no-ops.
    fn close(&self) {}
}

/// Bearer tokens from a [`GoogleCredential`].
#[derive(Debug)]
pub struct GcpAuthProvider {
    base: Arc<dyn GoogleCredential>,
    scopes: Vec<String>,
    scoped: Mutex<Option<Arc<dyn ScopedCredential>>>,
    cache: TokenCache,
    closed: CloseFlag,
}

impl GcpAuthProvider {
    /// Wrap `base`, requesting [`DEFAULT_SCOPES`].
    pub fn new(base: impl GoogleCredential + 'static) -> Self {
        Self {
            base: Arc::new(base),
            scopes: DEFAULT_SCOPES.iter().map(|s| (*s).to_owned()).collect(),
            scoped: Mutex::new(None),
            cache: TokenCache::new(Duration::seconds(TOKEN_SKEW_SECONDS)),
            closed: CloseFlag::default(),
        }
    }

    /// A provider for the service account in `GOOGLE_APPLICATION_CREDENTIALS`.
    #[cfg(all(feature = "gcp", feature = "rustls-tls"))]
    #[cfg_attr(docsrs, doc(cfg(all(feature = "gcp", feature = "rustls-tls"))))]
    pub fn try_default() -> crate::Result<Self> {
        let env = crate::config::Environment::from_process();
        let transport = crate::client::Transport::https()?;
        let base = ServiceAccountCredential::from_env(&env, transport).map_err(crate::Error::Configuration)?;
        Ok(Self::new(base))
    }

    /// Request `scopes` instead of [`DEFAULT_SCOPES`].
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
            if let Some(scoped) = self.scoped.lock().take() {
                scoped.close();
            }
            self.cache.clear();
            tracing::debug!("closed GCP authentication provider");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    fn scoped(&self) -> Result<Arc<dyn ScopedCredential>, Error> {
        let mut scoped = self.scoped.lock();
        if let Some(s) = scoped.as_ref() {
            return Ok(s.clone());
        }
        let s = self.base.create_scoped(&self.scopes).map_err(Error::GcpToken)?;
        tracing::trace!(scopes = ?self.scopes, "scoped GCP credential");
        *scoped = Some(s.clone());
        Ok(s)
    }

    async fn fetch(&self) -> Result<CachedToken, Error> {
        let scoped = self.scoped()?;
        let token = scoped.access_token().await.map_err(Error::GcpToken)?;
        tracing::debug!(expires_on = ?token.expires_on, "refreshed GCP token");
        non_empty(CachedToken::from(token))
    }
}

#[cfg(feature = "gcp")]
#[cfg_attr(docsrs, doc(cfg(feature = "gcp")))]
pub use service_account::ServiceAccountCredential;

#[cfg(feature = "gcp")]
mod service_account {
    use std::{fmt, path::Path, sync::Arc};

    use chrono::{DateTime, Utc};
    use futures::future::{BoxFuture, FutureExt};
    use http::Request;
    use secrecy::SecretString;
    use tame_oauth::{
        gcp::{ServiceAccountInfo, ServiceAccountProvider, TokenOrRequest, TokenProvider},
        Token,
    };
    use tower::BoxError;

    use super::{GoogleCredential, ScopedCredential, GOOGLE_APPLICATION_CREDENTIALS};
    use crate::{
        auth::AccessToken,
        client::{Body, Transport},
        config::Environment,
        error::ConfigError,
    };

    /// A service account key file, exchanged for tokens with tame-oauth.
    #[derive(Clone)]
    pub struct ServiceAccountCredential {
        provider: Arc<ServiceAccountProvider>,
        transport: Transport,
    }

    impl fmt::Debug for ServiceAccountCredential {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ServiceAccountCredential")
                .field("client_email", &self.provider.get_account_info().client_email)
                .field("transport", &self.transport)
                .finish()
        }
    }

    impl ServiceAccountCredential {
        /// Parse a service account key.
        pub fn from_json(json: String, transport: Transport) -> Result<Self, ConfigError> {
            let info = ServiceAccountInfo::deserialize(json).map_err(|e| ConfigError::InvalidCredentials(e.into()))?;
            let provider =
                ServiceAccountProvider::new(info).map_err(|e| ConfigError::InvalidCredentials(e.into()))?;
            Ok(Self {
                provider: Arc::new(provider),
                transport,
            })
        }

        /// Read a service account key file.
        pub fn from_file(path: impl AsRef<Path>, transport: Transport) -> Result<Self, ConfigError> {
            let path = path.as_ref();
            let json = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
                path: path.to_owned(),
                source,
            })?;
            Self::from_json(json, transport)
        }

        /// Read the key file named by `GOOGLE_APPLICATION_CREDENTIALS`.
        pub fn from_env(env: &Environment, transport: Transport) -> Result<Self, ConfigError> {
            let path = env.get(GOOGLE_APPLICATION_CREDENTIALS).ok_or(ConfigError::MissingField {
                field: "credentials_file",
                env: GOOGLE_APPLICATION_CREDENTIALS,
            })?;
            Self::from_file(path, transport)
        }
    }

    impl GoogleCredential for ServiceAccountCredential {
        fn create_scoped(&self, scopes: &[String]) -> Result<Arc<dyn ScopedCredential>, BoxError> {
            Ok(Arc::new(Scoped {
                credential: self.clone(),
                scopes: scopes.to_vec(),
            }))
        }
    }

    #[derive(Debug)]
    struct Scoped {
        credential: ServiceAccountCredential,
        scopes: Vec<String>,
    }

    impl Scoped {
        async fn token(&self) -> Result<Token, BoxError> {
            let provider = &self.credential.provider;
            match provider.get_token(&self.scopes)? {
                TokenOrRequest::Token(token) => Ok(token),
                TokenOrRequest::Request {
                    request, scope_hash, ..
                } => {
                    let (parts, body) = request.into_parts();
                    let res = self
                        .credential
                        .transport
                        .send(Request::from_parts(parts, Body::from(body)))
                        .await?;
                    // Convert response body to `Vec<u8>` for parsing.
                    let (parts, body) = res.into_parts();
                    let response = http::Response::from_parts(parts, body.to_vec());
                    Ok(provider.parse_token_response(scope_hash, response)?)
                }
            }
        }
    }

    impl ScopedCredential for Scoped {
        fn access_token(&self) -> BoxFuture<'_, Result<AccessToken, BoxError>> {
            async move {
                let token = self.token().await?;
                Ok(AccessToken {
                    token: SecretString::from(token.access_token),
                    expires_on: token.expires_in_timestamp.map(DateTime::<Utc>::from),
                })
            }
            .boxed()
        }

        fn close(&self) {
            self.credential.transport.close();
        }
    }

    #[cfg(test)]
    mod tests {
        use tower_test::mock;

        use super::*;

        fn transport() -> Transport {
            Transport::new(mock::pair::<Request<Body>, http::Response<Body>>().0)
        }

        #[test]
        fn rejects_malformed_key() {
            let err = ServiceAccountCredential::from_json("{}".into(), transport()).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidCredentials(_)));
        }

        #[test]
        fn requires_credentials_file() {
            let err = ServiceAccountCredential::from_env(&Environment::default(), transport()).unwrap_err();
            assert!(matches!(err, ConfigError::MissingField {
                env: GOOGLE_APPLICATION_CREDENTIALS,
                ..
            }));
            let env = Environment::default().with(GOOGLE_APPLICATION_CREDENTIALS, "/nonexistent/key.json");
            let err = ServiceAccountCredential::from_env(&env, transport()).unwrap_err();
            assert!(matches!(err, ConfigError::ReadFile { .. }));
        }
    }
}
