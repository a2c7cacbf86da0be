//! Sources of AWS signing credentials.
use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use futures::future::{self, BoxFuture, FutureExt};
use thiserror::Error;

use super::{sts::StsClient, Credentials};
use crate::{
    auth::{Cached, Clock, TokenCache},
    config::Environment,
};

/// `AWS_ACCESS_KEY_ID`
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// `AWS_SECRET_ACCESS_KEY`
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// `AWS_SESSION_TOKEN`
pub const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
/// `AWS_PROFILE`
pub const AWS_PROFILE: &str = "AWS_PROFILE";
/// `AWS_SHARED_CREDENTIALS_FILE`
pub const AWS_SHARED_CREDENTIALS_FILE: &str = "AWS_SHARED_CREDENTIALS_FILE";

const DEFAULT_PROFILE: &str = "default";
const ASSUME_ROLE_SKEW_MINUTES: i64 = 5;

#[derive(Error, Debug)]
/// Possible errors when resolving AWS credentials
pub enum CredentialsError {
    /// The source holds no credentials
    #[error("no AWS credentials found in {0}")]
    NotFound(String),

    /// Failed to read the shared credentials file
    #[error("failed to read AWS shared credentials file '{path:?}': {source}")]
    ReadFile {
        /// The file
        path: PathBuf,
        /// The cause
        #[source]
        source: std::io::Error,
    },

    /// A profile lacks a required key
    #[error("profile `{profile}` in '{path:?}' is missing `{key}`")]
    IncompleteProfile {
        /// Profile name
        profile: String,
        /// The file
        path: PathBuf,
        /// The missing key
        key: &'static str,
    },

    /// No home directory to locate `~/.aws/credentials`
    #[error("unable to locate the home directory")]
    NoHomeDirectory,

    /// STS refused to hand out role credentials
    #[error("failed to assume role: {0}")]
    AssumeRole(#[source] super::sts::StsError),

    /// Every source of a chain failed
    #[error("no source in the credentials chain produced credentials: {0}")]
    Exhausted(#[source] Box<CredentialsError>),
}

/// A source of AWS credentials.
pub trait ProvideCredentials: Send + Sync + fmt::Debug {
    /// Resolve credentials, possibly over the network.
    fn provide_credentials(&self) -> BoxFuture<'_, Result<Credentials, CredentialsError>>;

    /// Release network resources. Repeated calls are no-ops.
    fn close(&self) {}
}

impl ProvideCredentials for Credentials {
    fn provide_credentials(&self) -> BoxFuture<'_, Result<Credentials, CredentialsError>> {
        future::ready(Ok(self.clone())).boxed()
    }
}

impl<P: ProvideCredentials + ?Sized> ProvideCredentials for Arc<P> {
    fn provide_credentials(&self) -> BoxFuture<'_, Result<Credentials, CredentialsError>> {
        (**self).provide_credentials()
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`.
#[derive(Clone, Debug, Default)]
pub struct EnvironmentCredentials {
    env: Environment,
}

impl EnvironmentCredentials {
    /// Read from an environment snapshot.
    pub fn new(env: Environment) -> Self {
        Self { env }
    }

    fn resolve(&self) -> Result<Credentials, CredentialsError> {
        let (Some(akid), Some(secret)) = (
            self.env.get(AWS_ACCESS_KEY_ID),
            self.env.get(AWS_SECRET_ACCESS_KEY),
        ) else {
            return Err(CredentialsError::NotFound("the environment".into()));
        };
        let creds = Credentials::new(akid, secret);
        Ok(match self.env.get(AWS_SESSION_TOKEN) {
            Some(token) => creds.with_session_token(token),
            None => creds,
        })
    }
}

impl ProvideCredentials for EnvironmentCredentials {
    fn provide_credentials(&self) -> BoxFuture<'_, Result<Credentials, CredentialsError>> {
        future::ready(self.resolve()).boxed()
    }
}

/// Credentials from a profile of the shared credentials file.
#[derive(Clone, Debug)]
pub struct ProfileCredentials {
    path: Option<PathBuf>,
    profile: String,
}

impl ProfileCredentials {
    /// Read `profile` from the file at `path`.
    pub fn new(path: impl Into<PathBuf>, profile: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            profile: profile.into(),
        }
    }

    /// `AWS_SHARED_CREDENTIALS_FILE` or `~/.aws/credentials`, profile `AWS_PROFILE` or `default`.
    pub fn from_env(env: &Environment) -> Self {
        let path = env
            .get(AWS_SHARED_CREDENTIALS_FILE)
            .map(PathBuf::from)
            .or_else(|| home::home_dir().map(|h| h.join(".aws").join("credentials")));
        let profile = env.get(AWS_PROFILE).unwrap_or(DEFAULT_PROFILE).to_owned();
        Self { path, profile }
    }

    /// The profile name.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    async fn load(&self) -> Result<Credentials, CredentialsError> {
        let path = self.path.clone().ok_or(CredentialsError::NoHomeDirectory)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialsError::NotFound(format!("'{}'", path.display())));
            }
            Err(source) => return Err(CredentialsError::ReadFile { path, source }),
        };
        let Some(section) = parse_profile(&contents, &self.profile) else {
            return Err(CredentialsError::NotFound(format!(
                "profile `{}` of '{}'",
                self.profile,
                path.display()
            )));
        };
        let get = |key: &'static str| {
            section
                .get(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| CredentialsError::IncompleteProfile {
                    profile: self.profile.clone(),
                    path: path.clone(),
                    key,
                })
        };
        let creds = Credentials::new(get("aws_access_key_id")?.as_str(), get("aws_secret_access_key")?.as_str());
        Ok(match section.get("aws_session_token").filter(|v| !v.is_empty()) {
            Some(token) => creds.with_session_token(token.as_str()),
            None => creds,
        })
    }
}

impl ProvideCredentials for ProfileCredentials {
    fn provide_credentials(&self) -> BoxFuture<'_, Result<Credentials, CredentialsError>> {
        self.load().boxed()
    }
}

// Keys of one `[profile]` section of an INI file. `[profile name]` headers are accepted too.
fn parse_profile(contents: &str, profile: &str) -> Option<HashMap<String, String>> {
    let mut current: Option<&str> = None;
    let mut found: Option<HashMap<String, String>> = None;
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let header = header.trim();
            let name = header.strip_prefix("profile ").map(str::trim).unwrap_or(header);
            current = Some(name);
            if name == profile {
                found.get_or_insert_with(HashMap::new);
            }
            continue;
        }
        if current != Some(profile) {
            continue;
        }
        if let (Some(section), Some((k, v))) = (found.as_mut(), line.split_once('=')) {
            section.insert(k.trim().to_owned(), v.trim().to_owned());
        }
    }
    found
}

/// Environment credentials, falling back to the shared credentials file.
#[derive(Clone, Debug)]
pub struct DefaultCredentialsChain {
    env: EnvironmentCredentials,
    profile: ProfileCredentials,
}

impl DefaultCredentialsChain {
    /// Build the chain from an environment snapshot.
    pub fn from_env(env: &Environment) -> Self {
        Self {
            env: EnvironmentCredentials::new(env.clone()),
            profile: ProfileCredentials::from_env(env),
        }
    }

    async fn resolve(&self) -> Result<Credentials, CredentialsError> {
        match self.env.resolve() {
            Ok(creds) => return Ok(creds),
            Err(e) => tracing::trace!("{e}, trying shared credentials file"),
        }
        match self.profile.load().await {
            Ok(creds) => {
                tracing::debug!(profile = self.profile.profile(), "loaded credentials from profile");
                Ok(creds)
            }
            Err(e) => Err(CredentialsError::Exhausted(Box::new(e))),
        }
    }
}

impl ProvideCredentials for DefaultCredentialsChain {
    fn provide_credentials(&self) -> BoxFuture<'_, Result<Credentials, CredentialsError>> {
        self.resolve().boxed()
    }
}

/// Role credentials obtained with STS `AssumeRole`, signed by a source of base credentials.
///
/// Role credentials are cached until five minutes before they expire.
#[derive(Debug)]
pub struct AssumeRoleCredentials {
    sts: StsClient,
    source: Arc<dyn ProvideCredentials>,
    role_arn: String,
    session_name: String,
    duration: Duration,
    cache: TokenCache<Credentials>,
}

impl AssumeRoleCredentials {
    /// Assume `role_arn` with credentials from `source`.
    pub fn new(
        sts: StsClient,
        source: impl ProvideCredentials + 'static,
        role_arn: impl Into<String>,
        session_name: impl Into<String>,
    ) -> Self {
        Self {
            sts,
            source: Arc::new(source),
            role_arn: role_arn.into(),
            session_name: session_name.into(),
            duration: Duration::from_secs(3600),
            cache: TokenCache::new(ChronoDuration::minutes(ASSUME_ROLE_SKEW_MINUTES)),
        }
    }

    /// Requested session duration.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sign and expire sessions with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.cache = self.cache.with_clock(clock);
        self
    }

    async fn assume(&self) -> Result<Cached<Credentials>, CredentialsError> {
        let base = self.source.provide_credentials().await?;
        let creds = self
            .sts
            .assume_role(
                &base,
                &self.role_arn,
                &self.session_name,
                self.duration,
                self.cache.clock().now(),
            )
            .await
            .map_err(CredentialsError::AssumeRole)?;
        tracing::debug!(role_arn = %self.role_arn, expires_at = ?creds.expires_at, "assumed role");
        let expires_at = creds.expires_at;
        Ok(Cached::new(creds, expires_at))
    }
}

impl ProvideCredentials for AssumeRoleCredentials {
    fn provide_credentials(&self) -> BoxFuture<'_, Result<Credentials, CredentialsError>> {
        self.cache.get_or_refresh(|| self.assume()).boxed()
    }

    fn close(&self) {
        self.sts.close();
        self.source.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use chrono::{TimeZone, Utc};
    use futures::pin_mut;
    use http::{Request, Response};
    use secrecy::ExposeSecret;
    use tower_test::mock;

    use super::*;
    use crate::client::{Body, Transport};

    const FILE: &str = "\
# comment
[default]
aws_access_key_id = AKIDDEFAULT
aws_secret_access_key = default-secret

[profile ci]
aws_access_key_id=AKIDCI
aws_secret_access_key=ci-secret
aws_session_token=ci-token

[broken]
aws_access_key_id = AKIDBROKEN
";

    fn credentials_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FILE.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn reads_environment() {
        let env: Environment = [
            (AWS_ACCESS_KEY_ID, "AKIDENV"),
            (AWS_SECRET_ACCESS_KEY, "env-secret"),
            (AWS_SESSION_TOKEN, "env-token"),
        ]
        .into_iter()
        .collect();
        let creds = EnvironmentCredentials::new(env).provide_credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "AKIDENV");
        assert_eq!(creds.secret_access_key.expose_secret(), "env-secret");
        assert_eq!(creds.session_token.unwrap().expose_secret(), "env-token");

        let err = EnvironmentCredentials::default().provide_credentials().await.unwrap_err();
        assert!(matches!(err, CredentialsError::NotFound(_)));
    }

    #[tokio::test]
    async fn reads_profiles() {
        let file = credentials_file();
        let creds = ProfileCredentials::new(file.path(), "default")
            .provide_credentials()
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "AKIDDEFAULT");
        assert!(creds.session_token.is_none());

        let creds = ProfileCredentials::new(file.path(), "ci")
            .provide_credentials()
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "AKIDCI");
        assert_eq!(creds.session_token.unwrap().expose_secret(), "ci-token");

        let err = ProfileCredentials::new(file.path(), "broken")
            .provide_credentials()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialsError::IncompleteProfile { key: "aws_secret_access_key", .. }
        ));

        let err = ProfileCredentials::new(file.path(), "missing")
            .provide_credentials()
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::NotFound(_)));
    }

    #[tokio::test]
    async fn chain_prefers_environment() {
        let file = credentials_file();
        let path = file.path().to_string_lossy().into_owned();
        let env = Environment::default()
            .with(AWS_SHARED_CREDENTIALS_FILE, path.clone())
            .with(AWS_PROFILE, "ci");
        let creds = DefaultCredentialsChain::from_env(&env)
            .provide_credentials()
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "AKIDCI");

        let env = env
            .with(AWS_ACCESS_KEY_ID, "AKIDENV")
            .with(AWS_SECRET_ACCESS_KEY, "env-secret");
        let creds = DefaultCredentialsChain::from_env(&env)
            .provide_credentials()
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "AKIDENV");

        let env = Environment::default().with(AWS_SHARED_CREDENTIALS_FILE, format!("{path}.missing"));
        let err = DefaultCredentialsChain::from_env(&env)
            .provide_credentials()
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::Exhausted(_)));
    }

    #[derive(Debug, Default)]
    struct BaseCredentials {
        calls: AtomicUsize,
        closes: AtomicUsize,
    }

    impl ProvideCredentials for BaseCredentials {
        fn provide_credentials(&self) -> BoxFuture<'_, Result<Credentials, CredentialsError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(Credentials::new("AKIDBASE", "base-secret"))).boxed()
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn assume_role_response(access_key_id: &str, expiration: &str) -> Response<Body> {
        Response::new(Body::from(format!(
            r#"<AssumeRoleResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <AssumeRoleResult>
    <Credentials>
      <AccessKeyId>{access_key_id}</AccessKeyId>
      <SecretAccessKey>role-secret</SecretAccessKey>
      <SessionToken>role-session</SessionToken>
      <Expiration>{expiration}</Expiration>
    </Credentials>
  </AssumeRoleResult>
</AssumeRoleResponse>"#
        )))
    }

    #[tokio::test]
    async fn assumed_role_is_reused_until_skew_window() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = Clock::manual(start);
        let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        let sts = StsClient::new(Transport::new(service), "us-east-1");
        let base = Arc::new(BaseCredentials::default());
        let role = AssumeRoleCredentials::new(
            sts.clone(),
            base.clone(),
            "arn:aws:iam::123456789012:role/Deployer",
            "ci",
        )
        .with_duration(Duration::from_secs(3600))
        .with_clock(clock.clone());

        let spawned = tokio::spawn(async move {
            pin_mut!(handle);
            let (req, send) = handle.next_request().await.expect("service not called");
            let uri = req.uri().to_string();
            assert!(uri.contains("Action=AssumeRole&"));
            assert!(uri.contains("X-Amz-Date=20240301T120000Z"));
            send.send_response(assume_role_response("ASIAFIRST", "2024-03-01T13:00:00Z"));

            let (req, send) = handle.next_request().await.expect("service not called");
            assert!(req.uri().to_string().contains("X-Amz-Date=20240301T125600Z"));
            send.send_response(assume_role_response("ASIASECOND", "2024-03-01T13:56:00Z"));
        });

        let creds = role.provide_credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "ASIAFIRST");
        assert_eq!(creds.session_token.as_ref().unwrap().expose_secret(), "role-session");

        // still outside the five minute margin
        clock.advance(ChronoDuration::minutes(54));
        let creds = role.provide_credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "ASIAFIRST");
        assert_eq!(base.calls.load(Ordering::SeqCst), 1);

        clock.advance(ChronoDuration::minutes(2));
        let creds = role.provide_credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "ASIASECOND");
        assert_eq!(base.calls.load(Ordering::SeqCst), 2);
        spawned.await.unwrap();

        role.close();
        assert!(sts.is_closed());
        assert_eq!(base.closes.load(Ordering::SeqCst), 1);
    }
}
