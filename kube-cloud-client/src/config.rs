//! Client configuration and environment fallback resolution.
//!
//! Every provider configuration in this crate follows the same chain:
//! an explicitly set value wins, then an environment variable, then a default
//! (where one exists). Resolution is a pure function of the explicit value and an
//! [`Environment`] snapshot, so it runs once at construction time and can be
//! tested without touching the process environment.
use std::{collections::HashMap, ffi::OsString, path::PathBuf, time::Duration};

use crate::error::ConfigError;

/// `AWS_REGION`
pub const AWS_REGION: &str = "AWS_REGION";
/// `AWS_DEFAULT_REGION`
pub const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
/// `AWS_ROLE_ARN`
pub const AWS_ROLE_ARN: &str = "AWS_ROLE_ARN";
/// `AWS_WEB_IDENTITY_TOKEN_FILE`
pub const AWS_WEB_IDENTITY_TOKEN_FILE: &str = "AWS_WEB_IDENTITY_TOKEN_FILE";
/// `AWS_ROLE_SESSION_NAME`
pub const AWS_ROLE_SESSION_NAME: &str = "AWS_ROLE_SESSION_NAME";

/// Region used when neither configuration nor environment name one.
pub const DEFAULT_AWS_REGION: &str = "us-east-1";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(295);

/// Snapshot of environment variables used for fallback resolution.
///
/// Empty values are treated as unset.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Capture the current process environment.
    ///
    /// Variables whose name or value is not valid unicode are skipped.
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v): (OsString, OsString)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Set a variable, returning the updated snapshot.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Explicit value, else the first of `keys` that is set.
    pub fn resolve(&self, explicit: Option<&str>, keys: &[&str]) -> Option<String> {
        explicit
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .or_else(|| keys.iter().find_map(|k| self.get(k)).map(str::to_owned))
    }

    /// Explicit value, else `key`, else a [`ConfigError::MissingField`] naming both.
    pub fn require(&self, explicit: Option<&str>, field: &'static str, key: &'static str) -> Result<String, ConfigError> {
        self.resolve(explicit, &[key])
            .ok_or(ConfigError::MissingField { field, env: key })
    }

    /// Region chain: explicit, `AWS_REGION`, `AWS_DEFAULT_REGION`, then `us-east-1`.
    pub fn aws_region(&self, explicit: Option<&str>) -> String {
        self.resolve(explicit, &[AWS_REGION, AWS_DEFAULT_REGION])
            .unwrap_or_else(|| DEFAULT_AWS_REGION.to_owned())
    }
}

impl<K, V> FromIterator<(K, V)> for Environment
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Configuration for the transport underneath a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct Config {
    /// The configured cluster url
    pub cluster_url: http::Uri,
    /// Default namespace used by [`Client::portforward`](crate::Client) helpers
    pub default_namespace: String,
    /// DER-encoded root certificates trusted for the cluster.
    ///
    /// When `None`, the platform's native roots are used.
    pub root_cert: Option<Vec<Vec<u8>>>,
    /// Timeout for establishing a connection. `None` means no timeout.
    pub connect_timeout: Option<Duration>,
    /// Timeout for reading a response. `None` means no timeout.
    pub read_timeout: Option<Duration>,
    /// Timeout for writing a request. `None` means no timeout.
    pub write_timeout: Option<Duration>,
}

impl Config {
    /// Construct a new config where only the `cluster_url` is set by the user
    /// and everything else receives a default value.
    pub fn new(cluster_url: http::Uri) -> Self {
        Self {
            cluster_url,
            default_namespace: String::from("default"),
            root_cert: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            write_timeout: None,
        }
    }

    /// Trust the PEM-encoded certificate authority bundle instead of the native roots.
    pub fn with_root_cert_pem(mut self, pem: &[u8]) -> Result<Self, ConfigError> {
        let ders = certs(pem)?;
        if ders.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "root_cert",
                reason: "no CERTIFICATE block found".into(),
            });
        }
        self.root_cert = Some(ders);
        Ok(self)
    }

    /// Read a PEM-encoded certificate authority bundle from a file.
    pub fn with_root_cert_file(self, path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let pem = std::fs::read(&path).map_err(|source| ConfigError::ReadFile { path, source })?;
        self.with_root_cert_pem(&pem)
    }
}

fn certs(data: &[u8]) -> Result<Vec<Vec<u8>>, ConfigError> {
    let blocks = pem::parse_many(data).map_err(|e| ConfigError::InvalidValue {
        field: "root_cert",
        reason: e.to_string(),
    })?;
    Ok(blocks
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(pem::Pem::into_contents)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_value_wins_over_environment() {
        let env = Environment::from_iter([(AWS_ROLE_ARN, "arn:from-env")]);
        assert_eq!(
            env.resolve(Some("arn:explicit"), &[AWS_ROLE_ARN]).as_deref(),
            Some("arn:explicit")
        );
        assert_eq!(env.resolve(None, &[AWS_ROLE_ARN]).as_deref(), Some("arn:from-env"));
    }

    #[test]
    fn empty_values_count_as_unset() {
        let env = Environment::from_iter([(AWS_ROLE_ARN, "")]);
        assert_eq!(env.resolve(Some(""), &[AWS_ROLE_ARN]), None);
        let err = env.require(None, "role_arn", AWS_ROLE_ARN).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField {
                field: "role_arn",
                env: AWS_ROLE_ARN
            }
        ));
    }

    #[test]
    fn region_chain() {
        let env = Environment::default();
        assert_eq!(env.aws_region(None), "us-east-1");
        let env = env.with(AWS_DEFAULT_REGION, "eu-west-1");
        assert_eq!(env.aws_region(None), "eu-west-1");
        let env = env.with(AWS_REGION, "eu-central-1");
        assert_eq!(env.aws_region(None), "eu-central-1");
        assert_eq!(env.aws_region(Some("ap-south-1")), "ap-south-1");
    }

    #[test]
    fn reads_certificate_blocks() {
        let pem = b"-----BEGIN CERTIFICATE-----\naGVs\nbG8=\n-----END CERTIFICATE-----\n";
        let config = Config::new(http::Uri::from_static("https://localhost:6443"))
            .with_root_cert_pem(pem)
            .unwrap();
        assert_eq!(config.root_cert, Some(vec![b"hello".to_vec()]));

        let err = Config::new(http::Uri::from_static("https://localhost:6443"))
            .with_root_cert_pem(b"nothing here")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "root_cert", .. }));
    }
}
