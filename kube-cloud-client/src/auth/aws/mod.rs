//! AWS identity: credentials, SigV4 presigning, STS and the two EKS token providers.
//!
//! Both providers mint the same bearer token, `k8s-aws-v1.` followed by the base64url
//! encoding of a presigned `sts:GetCallerIdentity` URL. They differ in where the signing
//! credentials come from: [`IamAuthProvider`] uses a [`ProvideCredentials`] source directly,
//! [`OidcAuthProvider`] first exchanges a projected service account token for session
//! credentials through `AssumeRoleWithWebIdentity`.
use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::SecretString;

pub mod credentials;
mod iam;
mod oidc;
pub mod sigv4;
pub mod sts;
mod token;

pub use credentials::{
    AssumeRoleCredentials, CredentialsError, DefaultCredentialsChain, EnvironmentCredentials,
    ProfileCredentials, ProvideCredentials,
};
pub use iam::{IamAuthProvider, IamConfig};
pub use oidc::{OidcAuthProvider, OidcConfig, WebIdentityTokenError};
pub use sigv4::{PayloadHash, RequestSigner, SigningError, UnsignedRequest};
pub use sts::{StsClient, StsError, WebIdentityExchange, WebIdentityRequest};
pub use token::{sts_host, ClusterIdBinding, TOKEN_PREFIX};

/// A set of AWS signing credentials.
///
/// Temporary credentials carry a session token and an expiry.
#[derive(Clone)]
pub struct Credentials {
    /// `AWS_ACCESS_KEY_ID`
    pub access_key_id: String,
    /// `AWS_SECRET_ACCESS_KEY`
    pub secret_access_key: SecretString,
    /// `AWS_SESSION_TOKEN`, present for temporary credentials
    pub session_token: Option<SecretString>,
    /// When temporary credentials stop being valid
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Long-term credentials without session token or expiry.
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: SecretString::from(secret_access_key.into()),
            session_token: None,
            expires_at: None,
        }
    }

    /// Attach a session token.
    #[must_use]
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(SecretString::from(token.into()));
        self
    }

    /// Attach an expiry.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
