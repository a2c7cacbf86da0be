use std::{path::PathBuf, sync::Arc};

use chrono::Duration;
use secrecy::SecretString;

use super::{
    sts::{WebIdentityExchange, WebIdentityRequest},
    token::{self, ClusterIdBinding},
    Credentials,
};
use crate::{
    auth::{non_empty, Cached, CachedToken, Clock, CloseFlag, Error, TokenCache, TOKEN_SKEW_SECONDS},
    config::{Environment, AWS_ROLE_ARN, AWS_ROLE_SESSION_NAME, AWS_WEB_IDENTITY_TOKEN_FILE},
    error::ConfigError,
};

const DEFAULT_SESSION_NAME: &str = "kube-cloud-client-session";
const DEFAULT_DURATION_SECONDS: u32 = 3600;
const SESSION_SKEW_MINUTES: i64 = 5;

#[derive(thiserror::Error, Debug)]
/// Possible errors reading the projected web identity token
pub enum WebIdentityTokenError {
    /// The token file could not be read
    #[error("failed to read web identity token file '{path:?}': {source}")]
    Read {
        /// The token file
        path: PathBuf,
        /// The cause
        #[source]
        source: std::io::Error,
    },

    /// The token file is empty
    #[error("web identity token file '{0:?}' is empty")]
    Empty(PathBuf),
}

/// Configuration of an [`OidcAuthProvider`].
#[derive(Clone, Debug, Default)]
pub struct OidcConfig {
    /// Name of the EKS cluster, bound into every token
    pub cluster_name: String,
    /// Role to assume; falls back to `AWS_ROLE_ARN`
    pub role_arn: Option<String>,
    /// Projected service account token; falls back to `AWS_WEB_IDENTITY_TOKEN_FILE`
    pub web_identity_token_file: Option<PathBuf>,
    /// Session name; falls back to `AWS_ROLE_SESSION_NAME`, then a fixed default
    pub session_name: Option<String>,
    /// Signing region; falls back to `AWS_REGION`, `AWS_DEFAULT_REGION`, then `us-east-1`
    pub region: Option<String>,
    /// Requested session lifetime, 900 to 43200 seconds; one hour when unset
    pub duration_seconds: Option<u32>,
    /// How the cluster name is bound into the signature
    pub cluster_id_binding: ClusterIdBinding,
}

impl OidcConfig {
    /// Configuration for `cluster_name` with every other value resolved later.
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Self::default()
        }
    }

    /// Set the role to assume.
    #[must_use]
    pub fn with_role_arn(mut self, role_arn: impl Into<String>) -> Self {
        self.role_arn = Some(role_arn.into());
        self
    }

    /// Set the token file.
    #[must_use]
    pub fn with_web_identity_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.web_identity_token_file = Some(path.into());
        self
    }

    /// Set the session name.
    #[must_use]
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    /// Set the signing region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the requested session lifetime.
    #[must_use]
    pub fn with_duration_seconds(mut self, seconds: u32) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    /// Set the cluster name binding.
    #[must_use]
    pub fn with_cluster_id_binding(mut self, binding: ClusterIdBinding) -> Self {
        self.cluster_id_binding = binding;
        self
    }

    fn resolve(self, env: &Environment) -> Result<Resolved, ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::MissingValue("cluster_name"));
        }
        let role_arn = env.require(self.role_arn.as_deref(), "role_arn", AWS_ROLE_ARN)?;
        let token_file = match self.web_identity_token_file {
            Some(path) if !path.as_os_str().is_empty() => path,
            _ => env
                .get(AWS_WEB_IDENTITY_TOKEN_FILE)
                .map(PathBuf::from)
                .ok_or(ConfigError::MissingField {
                    field: "web_identity_token_file",
                    env: AWS_WEB_IDENTITY_TOKEN_FILE,
                })?,
        };
        let session_name = env
            .resolve(self.session_name.as_deref(), &[AWS_ROLE_SESSION_NAME])
            .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_owned());
        let duration_seconds = self.duration_seconds.unwrap_or(DEFAULT_DURATION_SECONDS);
        if !(900..=43200).contains(&duration_seconds) {
            return Err(ConfigError::InvalidValue {
                field: "duration_seconds",
                reason: format!("{duration_seconds} is outside 900..=43200"),
            });
        }
        Ok(Resolved {
            cluster_name: self.cluster_name,
            role_arn,
            token_file,
            session_name,
            region: env.aws_region(self.region.as_deref()),
            duration_seconds,
            binding: self.cluster_id_binding,
        })
    }
}

#[derive(Debug)]
struct Resolved {
    cluster_name: String,
    role_arn: String,
    token_file: PathBuf,
    session_name: String,
    region: String,
    duration_seconds: u32,
    binding: ClusterIdBinding,
}

/// Mints EKS bearer tokens from IAM Roles for Service Accounts.
///
/// Session credentials and bearer tokens are cached separately: session credentials are
/// exchanged again five minutes before they expire, bearer tokens one minute before.
#[derive(Debug)]
pub struct OidcAuthProvider {
    config: Resolved,
    exchange: Arc<dyn WebIdentityExchange>,
    session: TokenCache<Credentials>,
    cache: TokenCache,
    closed: CloseFlag,
}

impl OidcAuthProvider {
    /// Create a provider talking to the regional STS endpoint, resolving fallbacks from
    /// the process environment.
    #[cfg(feature = "rustls-tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls-tls")))]
    pub fn try_new(config: OidcConfig) -> crate::Result<Self> {
        Self::try_from_env(config, &Environment::from_process())
    }

    /// Create a provider talking to the regional STS endpoint, resolving fallbacks from `env`.
    #[cfg(feature = "rustls-tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls-tls")))]
    pub fn try_from_env(config: OidcConfig, env: &Environment) -> crate::Result<Self> {
        let config = config.resolve(env).map_err(crate::Error::Configuration)?;
        let sts = super::sts::StsClient::https(config.region.as_str())?;
        Ok(Self::from_resolved(config, Arc::new(sts)))
    }

    /// Create a provider exchanging tokens through `exchange`.
    pub fn with_exchange(
        config: OidcConfig,
        env: &Environment,
        exchange: impl WebIdentityExchange + 'static,
    ) -> Result<Self, ConfigError> {
        Ok(Self::from_resolved(config.resolve(env)?, Arc::new(exchange)))
    }

    fn from_resolved(config: Resolved, exchange: Arc<dyn WebIdentityExchange>) -> Self {
        tracing::debug!(
            cluster = %config.cluster_name,
            role_arn = %config.role_arn,
            region = %config.region,
            "configured OIDC authentication"
        );
        Self {
            config,
            exchange,
            session: TokenCache::new(Duration::minutes(SESSION_SKEW_MINUTES)),
            cache: TokenCache::new(Duration::seconds(TOKEN_SKEW_SECONDS)),
            closed: CloseFlag::default(),
        }
    }

    /// Use `clock` for both caches and for signing.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.session = self.session.with_clock(clock.clone());
        self.cache = self.cache.with_clock(clock);
        self
    }

    /// The role assumed.
    pub fn role_arn(&self) -> &str {
        &self.config.role_arn
    }

    /// The resolved session name.
    pub fn session_name(&self) -> &str {
        &self.config.session_name
    }

    /// The resolved signing region.
    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// Whether the session credentials must be exchanged again before the next mint.
    pub fn session_needs_refresh(&self) -> bool {
        self.session.needs_refresh()
    }

    pub(crate) async fn token(&self) -> Result<SecretString, Error> {
        self.cache.get_or_refresh(|| self.mint()).await
    }

    pub(crate) fn needs_refresh(&self) -> bool {
        self.cache.needs_refresh()
    }

    pub(crate) async fn refresh(&self) -> Result<(), Error> {
        self.cache.refresh_with(|| self.mint()).await.map(|_| ())
    }

    pub(crate) fn close(&self) {
        if self.closed.close() {
            self.exchange.close();
            self.session.clear();
            self.cache.clear();
            tracing::debug!("closed OIDC authentication provider");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    async fn mint(&self) -> Result<CachedToken, Error> {
        let credentials = self.session.get_or_refresh(|| self.assume_role()).await?;
        let token = token::generate(
            &credentials,
            &self.config.cluster_name,
            &self.config.region,
            self.config.binding,
            self.cache.clock().now(),
        )
        .map_err(|e| Error::OidcToken(e.into()))?;
        tracing::debug!(expires_at = ?token.expires_at, "generated OIDC token");
        non_empty(token)
    }

    async fn assume_role(&self) -> Result<Cached<Credentials>, Error> {
        let web_identity_token = self
            .read_token_file()
            .await
            .map_err(|e| Error::AssumeRoleWithWebIdentity(e.into()))?;
        let credentials = self
            .exchange
            .assume_role_with_web_identity(WebIdentityRequest {
                role_arn: &self.config.role_arn,
                session_name: &self.config.session_name,
                web_identity_token: &web_identity_token,
                duration_seconds: self.config.duration_seconds,
            })
            .await
            .map_err(Error::AssumeRoleWithWebIdentity)?;
        tracing::debug!(expires_at = ?credentials.expires_at, "assumed role with web identity");
        let expires_at = credentials.expires_at;
        Ok(Cached::new(credentials, expires_at))
    }

    async fn read_token_file(&self) -> Result<String, WebIdentityTokenError> {
        let path = &self.config.token_file;
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| WebIdentityTokenError::Read {
                path: path.clone(),
                source,
            })?;
        let token = contents.trim();
        if token.is_empty() {
            return Err(WebIdentityTokenError::Empty(path.clone()));
        }
        Ok(token.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use chrono::{TimeZone, Utc};
    use futures::future::{BoxFuture, FutureExt};
    use parking_lot::Mutex;
    use secrecy::ExposeSecret;
    use tower::BoxError;

    use super::*;
    use crate::auth::{
        aws::token::{tests::decode, TOKEN_PREFIX},
        AuthProvider,
    };

    const ROLE: &str = "arn:aws:iam::123456789012:role/TestRole";

    #[derive(Debug)]
    struct MockSts {
        clock: Clock,
        calls: AtomicUsize,
        closes: AtomicUsize,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MockSts {
        fn new(clock: Clock) -> Arc<Self> {
            Arc::new(Self {
                clock,
                calls: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                fail: false,
            })
        }
    }

    impl WebIdentityExchange for Arc<MockSts> {
        fn assume_role_with_web_identity<'a>(
            &'a self,
            request: WebIdentityRequest<'a>,
        ) -> BoxFuture<'a, Result<Credentials, BoxError>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().push(format!(
                "{} {} {} {}",
                request.role_arn, request.session_name, request.web_identity_token, request.duration_seconds
            ));
            let result = if self.fail {
                Err("InvalidIdentityToken".into())
            } else {
                Ok(Credentials::new(format!("ASIA{n}"), "session-secret")
                    .with_session_token(format!("session-token-{n}"))
                    .with_expiry(self.clock.now() + Duration::seconds(3600)))
            };
            futures::future::ready(result).boxed()
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn token_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn clock() -> Clock {
        Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn construction_requires_role_and_token_file() {
        let err = OidcAuthProvider::with_exchange(
            OidcConfig::new("my-cluster"),
            &Environment::default(),
            MockSts::new(clock()),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "role_arn", env: "AWS_ROLE_ARN" }));

        let err = OidcAuthProvider::with_exchange(
            OidcConfig::new("my-cluster").with_role_arn(ROLE),
            &Environment::default(),
            MockSts::new(clock()),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField {
            field: "web_identity_token_file",
            ..
        }));

        let err = OidcAuthProvider::with_exchange(
            OidcConfig::new("my-cluster")
                .with_role_arn(ROLE)
                .with_web_identity_token_file("/token")
                .with_duration_seconds(60),
            &Environment::default(),
            MockSts::new(clock()),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "duration_seconds", .. }));
    }

    #[test]
    fn falls_back_to_environment() {
        let env = Environment::default()
            .with(AWS_ROLE_ARN, ROLE)
            .with(AWS_WEB_IDENTITY_TOKEN_FILE, "/var/run/secrets/eks.amazonaws.com/serviceaccount/token")
            .with(AWS_ROLE_SESSION_NAME, "from-env")
            .with("AWS_REGION", "eu-west-1");
        let p = OidcAuthProvider::with_exchange(OidcConfig::new("c"), &env, MockSts::new(clock())).unwrap();
        assert_eq!(p.role_arn(), ROLE);
        assert_eq!(p.session_name(), "from-env");
        assert_eq!(p.region(), "eu-west-1");

        let config = OidcConfig::new("c").with_role_arn("arn:aws:iam::1:role/Explicit");
        let p = OidcAuthProvider::with_exchange(config, &env, MockSts::new(clock())).unwrap();
        assert_eq!(p.role_arn(), "arn:aws:iam::1:role/Explicit");

        let env = env.with(AWS_ROLE_SESSION_NAME, "");
        let p = OidcAuthProvider::with_exchange(OidcConfig::new("c"), &env, MockSts::new(clock())).unwrap();
        assert_eq!(p.session_name(), "kube-cloud-client-session");
    }

    #[tokio::test]
    async fn exchanges_once_then_mints_from_cached_session() {
        let clock = clock();
        let file = token_file("test-token-content\n");
        let sts = MockSts::new(clock.clone());
        let config = OidcConfig::new("my-cluster")
            .with_role_arn(ROLE)
            .with_web_identity_token_file(file.path());
        let p = OidcAuthProvider::with_exchange(config, &Environment::default(), sts.clone())
            .unwrap()
            .with_clock(clock.clone());

        let token = p.token().await.unwrap();
        assert!(token.expose_secret().starts_with(TOKEN_PREFIX));
        let url = decode(token.expose_secret());
        assert!(url.contains("X-Amz-Security-Token=session-token-1"));
        assert!(url.contains("X-Amz-Credential=ASIA1%2F20240301%2Fus-east-1%2Fsts%2Faws4_request"));
        assert_eq!(p.token().await.unwrap().expose_secret(), token.expose_secret());
        assert_eq!(sts.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sts.seen.lock()[0],
            format!("{ROLE} kube-cloud-client-session test-token-content 3600")
        );

        // bearer token stale, session still valid
        clock.advance(Duration::minutes(15));
        assert!(p.needs_refresh());
        assert!(!p.session_needs_refresh());
        let second = p.token().await.unwrap();
        assert_ne!(second.expose_secret(), token.expose_secret());
        assert_eq!(sts.calls.load(Ordering::SeqCst), 1);

        // within five minutes of the session expiry
        clock.advance(Duration::minutes(41));
        assert!(p.session_needs_refresh());
        p.refresh().await.unwrap();
        assert_eq!(sts.calls.load(Ordering::SeqCst), 2);
        let third = p.token().await.unwrap();
        assert!(decode(third.expose_secret()).contains("session-token-2"));
    }

    #[tokio::test]
    async fn stage_failures_are_distinguished() {
        let clock = clock();
        let missing = std::env::temp_dir().join("kube-cloud-client-missing-token");
        let config = OidcConfig::new("my-cluster")
            .with_role_arn(ROLE)
            .with_web_identity_token_file(&missing);
        let sts = MockSts::new(clock.clone());
        let p = OidcAuthProvider::with_exchange(config, &Environment::default(), sts.clone()).unwrap();
        let err = p.token().await.unwrap_err();
        assert!(matches!(err, Error::AssumeRoleWithWebIdentity(_)));
        let msg = err.to_string();
        assert!(msg.starts_with("Failed to assume role with web identity"));
        assert!(msg.contains("kube-cloud-client-missing-token"));
        let source = std::error::Error::source(&err).expect("wrapped cause");
        assert!(matches!(
            source.downcast_ref::<WebIdentityTokenError>(),
            Some(WebIdentityTokenError::Read { path, .. }) if *path == missing
        ));
        assert_eq!(sts.calls.load(Ordering::SeqCst), 0);

        let file = token_file("  \n");
        let config = OidcConfig::new("my-cluster")
            .with_role_arn(ROLE)
            .with_web_identity_token_file(file.path());
        let p = OidcAuthProvider::with_exchange(config, &Environment::default(), sts.clone()).unwrap();
        let err = p.token().await.unwrap_err();
        assert!(err.to_string().contains("is empty"));
        let source = std::error::Error::source(&err).expect("wrapped cause");
        assert!(matches!(
            source.downcast_ref::<WebIdentityTokenError>(),
            Some(WebIdentityTokenError::Empty(_))
        ));

        let file = token_file("test-token-content");
        let config = OidcConfig::new("my-cluster")
            .with_role_arn(ROLE)
            .with_web_identity_token_file(file.path());
        let failing = Arc::new(MockSts {
            clock: clock.clone(),
            calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let p = OidcAuthProvider::with_exchange(config, &Environment::default(), failing).unwrap();
        let err = p.token().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to assume role with web identity: InvalidIdentityToken"
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let file = token_file("test-token-content");
        let sts = MockSts::new(clock());
        let config = OidcConfig::new("my-cluster")
            .with_role_arn(ROLE)
            .with_web_identity_token_file(file.path());
        let auth = AuthProvider::from(
            OidcAuthProvider::with_exchange(config, &Environment::default(), sts.clone()).unwrap(),
        );
        auth.token().await.unwrap();
        auth.close();
        auth.close();
        assert!(auth.is_closed());
        assert_eq!(sts.closes.load(Ordering::SeqCst), 1);
    }
}
