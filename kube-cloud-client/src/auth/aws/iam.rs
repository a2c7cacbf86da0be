use std::sync::Arc;

use chrono::Duration;
use secrecy::SecretString;

use super::{
    credentials::{DefaultCredentialsChain, ProvideCredentials},
    token::{self, ClusterIdBinding},
};
use crate::{
    auth::{non_empty, CachedToken, Clock, CloseFlag, Error, TokenCache, TOKEN_SKEW_SECONDS},
    config::Environment,
    error::ConfigError,
};

/// Configuration of an [`IamAuthProvider`].
#[derive(Clone, Debug)]
pub struct IamConfig {
    /// Name of the EKS cluster, bound into every token
    pub cluster_name: String,
    /// Signing region; falls back to `AWS_REGION`, `AWS_DEFAULT_REGION`, then `us-east-1`
    pub region: Option<String>,
    /// How the cluster name is bound into the signature
    pub cluster_id_binding: ClusterIdBinding,
    /// Source of signing credentials; the default chain when unset
    pub credentials: Option<Arc<dyn ProvideCredentials>>,
}

impl IamConfig {
    /// Configuration for `cluster_name` with every other value resolved later.
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            region: None,
            cluster_id_binding: ClusterIdBinding::default(),
            credentials: None,
        }
    }

    /// Set the signing region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the credentials source.
    #[must_use]
    pub fn with_credentials(mut self, credentials: impl ProvideCredentials + 'static) -> Self {
        self.credentials = Some(Arc::new(credentials));
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
        let region = env.aws_region(self.region.as_deref());
        let credentials = match self.credentials {
            Some(c) => c,
            None => Arc::new(DefaultCredentialsChain::from_env(env)),
        };
        Ok(Resolved {
            cluster_name: self.cluster_name,
            region,
            binding: self.cluster_id_binding,
            credentials,
        })
    }
}

#[derive(Debug)]
struct Resolved {
    cluster_name: String,
    region: String,
    binding: ClusterIdBinding,
    credentials: Arc<dyn ProvideCredentials>,
}

/// Mints EKS bearer tokens from AWS credentials.
#[derive(Debug)]
pub struct IamAuthProvider {
    config: Resolved,
    cache: TokenCache,
    closed: CloseFlag,
}

impl IamAuthProvider {
    /// Create a provider, resolving fallbacks from the process environment.
    pub fn new(config: IamConfig) -> Result<Self, ConfigError> {
        Self::from_env(config, &Environment::from_process())
    }

    /// Create a provider, resolving fallbacks from `env`.
    pub fn from_env(config: IamConfig, env: &Environment) -> Result<Self, ConfigError> {
        let config = config.resolve(env)?;
        tracing::debug!(cluster = %config.cluster_name, region = %config.region, "configured IAM authentication");
        Ok(Self {
            config,
            cache: TokenCache::new(Duration::seconds(TOKEN_SKEW_SECONDS)),
            closed: CloseFlag::default(),
        })
    }

    /// Sign and expire tokens with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.cache = self.cache.with_clock(clock);
        self
    }

    /// The resolved signing region.
    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// The cluster name bound into tokens.
    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    pub(crate) async fn token(&self) -> Result<SecretString, Error> {
        self.cache.get_or_refresh(|| self.generate()).await
    }

    pub(crate) fn needs_refresh(&self) -> bool {
        self.cache.needs_refresh()
    }

    pub(crate) async fn refresh(&self) -> Result<(), Error> {
        self.cache.refresh_with(|| self.generate()).await.map(|_| ())
    }

    pub(crate) fn close(&self) {
        if self.closed.close() {
            self.config.credentials.close();
            self.cache.clear();
            tracing::debug!("closed IAM authentication provider");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    async fn generate(&self) -> Result<CachedToken, Error> {
        let credentials = self
            .config
            .credentials
            .provide_credentials()
            .await
            .map_err(|e| Error::IamToken(e.into()))?;
        let token = token::generate(
            &credentials,
            &self.config.cluster_name,
            &self.config.region,
            self.config.binding,
            self.cache.clock().now(),
        )
        .map_err(|e| Error::IamToken(e.into()))?;
        tracing::debug!(expires_at = ?token.expires_at, "generated IAM token");
        non_empty(token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Utc};
    use futures::future::{BoxFuture, FutureExt};
    use secrecy::ExposeSecret;

    use super::*;
    use crate::{
        auth::{
            aws::{
                credentials::CredentialsError,
                token::{tests::decode, TOKEN_PREFIX},
                Credentials,
            },
            AuthProvider,
        },
        config::{AWS_DEFAULT_REGION, AWS_REGION},
    };

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
        closes: AtomicUsize,
        fail: bool,
    }

    impl ProvideCredentials for Counting {
        fn provide_credentials(&self) -> BoxFuture<'_, Result<Credentials, CredentialsError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail {
                Err(CredentialsError::NotFound("the test".into()))
            } else {
                Ok(Credentials::new("AKIDEXAMPLE", "secret"))
            };
            futures::future::ready(result).boxed()
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn provider(source: Arc<Counting>) -> IamAuthProvider {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let config = IamConfig::new("my-cluster").with_credentials(source);
        IamAuthProvider::from_env(config, &Environment::default())
            .unwrap()
            .with_clock(clock)
    }

    #[test]
    fn region_fallback_chain() {
        let env = Environment::default().with(AWS_DEFAULT_REGION, "eu-west-1");
        let p = IamAuthProvider::from_env(IamConfig::new("c"), &env).unwrap();
        assert_eq!(p.region(), "eu-west-1");
        let env = env.with(AWS_REGION, "eu-north-1");
        let p = IamAuthProvider::from_env(IamConfig::new("c"), &env).unwrap();
        assert_eq!(p.region(), "eu-north-1");
        let p = IamAuthProvider::from_env(IamConfig::new("c").with_region("ap-south-1"), &env).unwrap();
        assert_eq!(p.region(), "ap-south-1");
        let p = IamAuthProvider::from_env(IamConfig::new("c"), &Environment::default()).unwrap();
        assert_eq!(p.region(), "us-east-1");
    }

    #[test]
    fn cluster_name_is_required() {
        let err = IamAuthProvider::from_env(IamConfig::new(""), &Environment::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue("cluster_name")));
    }

    #[tokio::test]
    async fn token_decodes_to_caller_identity_url() {
        let p = provider(Arc::new(Counting::default()));
        let token = p.token().await.unwrap();
        let url = decode(token.expose_secret());
        assert!(token.expose_secret().starts_with(TOKEN_PREFIX));
        assert!(url.starts_with("https://sts.us-east-1.amazonaws.com/?"));
        assert!(url.contains("Action=GetCallerIdentity"));
        assert!(url.contains("x-k8s-aws-id=my-cluster"));
        assert!(url.contains("X-Amz-Expires=900"));
    }

    #[tokio::test]
    async fn authenticator_binding_signs_cluster_header() {
        let config = IamConfig::new("my-cluster")
            .with_credentials(Arc::new(Counting::default()))
            .with_cluster_id_binding(ClusterIdBinding::SignedHeader);
        let p = IamAuthProvider::from_env(config, &Environment::default()).unwrap();
        let url = decode(p.token().await.unwrap().expose_secret());
        assert!(url.contains("X-Amz-SignedHeaders=host%3Bx-k8s-aws-id"));
        assert!(!url.contains("x-k8s-aws-id=my-cluster"));
    }

    #[tokio::test]
    async fn reuses_cached_token_until_skew() {
        let source = Arc::new(Counting::default());
        let p = provider(source.clone());
        assert!(p.needs_refresh());
        let first = p.token().await.unwrap();
        for _ in 0..5 {
            assert_eq!(p.token().await.unwrap().expose_secret(), first.expose_secret());
        }
        assert!(!p.needs_refresh());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // 14 minute lifetime, refreshed a minute early
        p.cache.clock().advance(Duration::minutes(13));
        assert!(p.needs_refresh());
        let second = p.token().await.unwrap();
        assert_ne!(second.expose_secret(), first.expose_secret());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        p.refresh().await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wraps_credential_failures() {
        let p = provider(Arc::new(Counting {
            fail: true,
            ..Default::default()
        }));
        let err = p.token().await.unwrap_err();
        assert!(matches!(err, Error::IamToken(_)));
        assert_eq!(
            err.to_string(),
            "Failed to generate IAM authentication token: no AWS credentials found in the test"
        );
        let source = std::error::Error::source(&err).expect("wrapped cause");
        assert!(matches!(
            source.downcast_ref::<CredentialsError>(),
            Some(CredentialsError::NotFound(from)) if from == "the test"
        ));
        assert!(p.needs_refresh());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let source = Arc::new(Counting::default());
        let auth = AuthProvider::from(provider(source.clone()));
        auth.close();
        auth.close();
        assert!(auth.is_closed());
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }
}
