//! Cloud identity authentication providers.
//!
//! Every provider follows the same contract: [`token`](AuthProvider::token) returns a cached
//! bearer token and refreshes it first when it is missing or about to expire,
//! [`refresh`](AuthProvider::refresh) regenerates it unconditionally and
//! [`close`](AuthProvider::close) releases any network handle the provider holds.
use chrono::{DateTime, Utc};
use http::{header::InvalidHeaderValue, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tower::BoxError;

pub mod aws;
pub mod azure;
mod cache;
pub mod gcp;

pub use cache::{Cached, CachedToken, Clock, TokenCache};

use aws::{IamAuthProvider, OidcAuthProvider};
use azure::AzureAuthProvider;
use gcp::GcpAuthProvider;

/// Skew used for bearer tokens of every provider.
pub(crate) const TOKEN_SKEW_SECONDS: i64 = 60;

#[derive(Error, Debug)]
/// Client auth errors
///
/// Each variant names the stage that failed and carries the original cause.
pub enum Error {
    /// Signing or credential resolution failed while minting an IAM token
    #[error("Failed to generate IAM authentication token: {0}")]
    IamToken(#[source] BoxError),

    /// Signing failed while minting a token from web identity session credentials
    #[error("Failed to generate OIDC authentication token: {0}")]
    OidcToken(#[source] BoxError),

    /// Reading the web identity token or exchanging it with STS failed
    #[error("Failed to assume role with web identity: {0}")]
    AssumeRoleWithWebIdentity(#[source] BoxError),

    /// The Azure credential failed to produce a token
    #[error("Failed to refresh Azure authentication token: {0}")]
    AzureToken(#[source] BoxError),

    /// The Google credential failed to produce a token
    #[error("Failed to refresh GCP authentication token: {0}")]
    GcpToken(#[source] BoxError),

    /// A refresh succeeded but produced an empty token
    #[error("authentication provider produced an empty token")]
    EmptyToken,

    /// Invalid bearer token
    #[error("invalid bearer token: {0}")]
    InvalidBearerToken(#[source] InvalidHeaderValue),
}

/// An OAuth2 style access token with an optional expiry.
#[derive(Clone, Debug)]
pub struct AccessToken {
    /// The bearer token
    pub token: SecretString,
    /// When the token expires, if known
    pub expires_on: Option<DateTime<Utc>>,
}

impl From<AccessToken> for CachedToken {
    fn from(t: AccessToken) -> Self {
        Cached::new(t.token, t.expires_on)
    }
}

/// The closed set of supported authentication providers.
#[derive(Debug)]
pub enum AuthProvider {
    /// Tokens minted from AWS credentials
    Iam(IamAuthProvider),
    /// Tokens minted from AWS web identity session credentials
    Oidc(OidcAuthProvider),
    /// Azure AD tokens
    Azure(AzureAuthProvider),
    /// Google OAuth2 tokens
    Gcp(GcpAuthProvider),
}

impl AuthProvider {
    /// The current bearer token, refreshed first if needed.
    pub async fn token(&self) -> Result<SecretString, Error> {
        match self {
            Self::Iam(p) => p.token().await,
            Self::Oidc(p) => p.token().await,
            Self::Azure(p) => p.token().await,
            Self::Gcp(p) => p.token().await,
        }
    }

    /// The authorization scheme, always `Bearer`.
    pub fn auth_type(&self) -> &'static str {
        "Bearer"
    }

    /// `Bearer <token>` as a sensitive header value.
    pub async fn auth_header(&self) -> Result<HeaderValue, Error> {
        let token = self.token().await?;
        let mut value = HeaderValue::try_from(format!("{} {}", self.auth_type(), token.expose_secret()))
            .map_err(Error::InvalidBearerToken)?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Whether the next [`token`](Self::token) call would refresh.
    pub fn needs_refresh(&self) -> bool {
        match self {
            Self::Iam(p) => p.needs_refresh(),
            Self::Oidc(p) => p.needs_refresh(),
            Self::Azure(p) => p.needs_refresh(),
            Self::Gcp(p) => p.needs_refresh(),
        }
    }

    /// Regenerate the token, ignoring the cache.
    pub async fn refresh(&self) -> Result<(), Error> {
        match self {
            Self::Iam(p) => p.refresh().await,
            Self::Oidc(p) => p.refresh().await,
            Self::Azure(p) => p.refresh().await,
            Self::Gcp(p) => p.refresh().await,
        }
    }

    /// Release held network resources. Repeated calls are no-ops.
    pub fn close(&self) {
        match self {
            Self::Iam(p) => p.close(),
            Self::Oidc(p) => p.close(),
            Self::Azure(p) => p.close(),
            Self::Gcp(p) => p.close(),
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Iam(p) => p.is_closed(),
            Self::Oidc(p) => p.is_closed(),
            Self::Azure(p) => p.is_closed(),
            Self::Gcp(p) => p.is_closed(),
        }
    }
}

impl From<IamAuthProvider> for AuthProvider {
    fn from(p: IamAuthProvider) -> Self {
        Self::Iam(p)
    }
}

impl From<OidcAuthProvider> for AuthProvider {
    fn from(p: OidcAuthProvider) -> Self {
        Self::Oidc(p)
    }
}

impl From<AzureAuthProvider> for AuthProvider {
    fn from(p: AzureAuthProvider) -> Self {
        Self::Azure(p)
    }
}

impl From<GcpAuthProvider> for AuthProvider {
    fn from(p: GcpAuthProvider) -> Self {
        Self::Gcp(p)
    }
}

/// Reject an empty token before it reaches a cache, so the next call refreshes again.
pub(crate) fn non_empty(token: CachedToken) -> Result<CachedToken, Error> {
    if token.value.expose_secret().is_empty() {
        return Err(Error::EmptyToken);
    }
    Ok(token)
}

/// Marks a provider closed, returning `true` only for the first call.
#[derive(Debug, Default)]
pub(crate) struct CloseFlag(std::sync::atomic::AtomicBool);

impl CloseFlag {
    pub(crate) fn close(&self) -> bool {
        !self.0.swap(true, std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use chrono::Duration;
    use futures::future::BoxFuture;
    use http::header::AUTHORIZATION;

    use super::{azure::TokenCredential, *};

    #[derive(Debug, Default)]
    struct Fixed {
        token: &'static str,
        calls: AtomicUsize,
    }

    impl TokenCredential for Arc<Fixed> {
        fn get_token<'a>(&'a self, _scopes: &'a [String]) -> BoxFuture<'a, Result<AccessToken, BoxError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Ok(AccessToken {
                    token: SecretString::from(self.token.to_owned()),
                    expires_on: Some(Utc::now() + Duration::hours(1)),
                })
            })
        }
    }

    #[tokio::test]
    async fn auth_header_is_sensitive_bearer() {
        let cred = Arc::new(Fixed {
            token: "abc",
            ..Default::default()
        });
        let auth = AuthProvider::from(AzureAuthProvider::new(cred.clone()));
        assert_eq!(auth.auth_type(), "Bearer");
        let header = auth.auth_header().await.unwrap();
        assert_eq!(header, "Bearer abc");
        assert!(header.is_sensitive());

        let req = http::Request::builder()
            .header(AUTHORIZATION, header)
            .body(())
            .unwrap();
        assert!(!format!("{req:?}").contains("abc"));
        assert_eq!(cred.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_token_is_rejected() {
        let auth = AuthProvider::from(AzureAuthProvider::new(Arc::new(Fixed::default())));
        assert!(matches!(auth.token().await, Err(Error::EmptyToken)));
    }

    #[derive(Debug, Default)]
    struct EmptyThenValid {
        calls: AtomicUsize,
    }

    impl TokenCredential for Arc<EmptyThenValid> {
        fn get_token<'a>(&'a self, _scopes: &'a [String]) -> BoxFuture<'a, Result<AccessToken, BoxError>> {
            let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
            Box::pin(async move {
                Ok(AccessToken {
                    token: SecretString::from(if first { "" } else { "good" }.to_owned()),
                    expires_on: Some(Utc::now() + Duration::hours(1)),
                })
            })
        }
    }

    #[tokio::test]
    async fn empty_token_is_not_cached() {
        let cred = Arc::new(EmptyThenValid::default());
        let auth = AuthProvider::from(AzureAuthProvider::new(cred.clone()));
        assert!(matches!(auth.token().await, Err(Error::EmptyToken)));
        assert!(auth.needs_refresh());

        assert_eq!(auth.token().await.unwrap().expose_secret(), "good");
        assert!(!auth.needs_refresh());
        assert_eq!(cred.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_token_is_rejected() {
        let cred = Arc::new(Fixed {
            token: "\n",
            ..Default::default()
        });
        let auth = AuthProvider::from(AzureAuthProvider::new(cred));
        assert!(matches!(auth.auth_header().await, Err(Error::InvalidBearerToken(_))));
    }

    #[test]
    fn close_flag_fires_once() {
        let flag = CloseFlag::default();
        assert!(!flag.is_closed());
        assert!(flag.close());
        assert!(!flag.close());
        assert!(flag.is_closed());
    }
}
