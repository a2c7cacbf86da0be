//! Error handling in [`kube_cloud_client`][crate]
use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;
use tower::BoxError;

pub use crate::auth::Error as AuthError;

/// Possible errors when working with [`kube_cloud_client`][crate]
#[derive(Error, Debug)]
pub enum Error {
    /// Producing or refreshing the bearer token failed.
    ///
    /// The wrapped [`AuthError`] names the stage that failed.
    #[error("auth error: {0}")]
    Auth(#[source] AuthError),

    /// The transport failed to carry the request.
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[source] BoxError),

    /// The API server rejected the credentials with `401 Unauthorized` or `403 Forbidden`.
    ///
    /// Callers may force a token rotation with [`AuthProvider::refresh`](crate::AuthProvider::refresh)
    /// and retry once.
    #[error("Authentication failed: {status} - {body}")]
    AuthenticationFailed {
        /// Status returned by the API server
        status: StatusCode,
        /// Response body returned by the API server
        body: String,
    },

    /// A required parameter was missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(#[source] ConfigError),

    /// Http based error
    #[error("HttpError: {0}")]
    HttpError(#[source] http::Error),

    /// Failed to construct a URI.
    #[error("InvalidUri: {0}")]
    InvalidUri(#[source] http::uri::InvalidUri),

    /// Common error case when requesting parsing into own structs
    #[error("Error deserializing response: {0}")]
    SerdeError(#[source] serde_json::Error),

    /// UTF-8 Error
    #[error("UTF-8 Error: {0}")]
    FromUtf8(#[source] std::string::FromUtf8Error),

    /// Failed to upgrade to a WebSocket connection.
    #[cfg(feature = "ws")]
    #[cfg_attr(docsrs, doc(cfg(feature = "ws")))]
    #[error("failed to upgrade to a WebSocket connection: {0}")]
    UpgradeConnection(#[source] crate::client::UpgradeConnectionError),

    /// The WebSocket transport of a port-forward session failed.
    #[cfg(feature = "ws")]
    #[cfg_attr(docsrs, doc(cfg(feature = "ws")))]
    #[error("WebSocket error: {0}")]
    WebSocket(#[source] tokio_tungstenite::tungstenite::Error),

    /// The port-forward session is no longer running.
    #[error("port-forward session is closed")]
    PortforwardClosed,
}

impl Error {
    /// HTTP status associated with this error, if the server produced one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::AuthenticationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
// Redundant with the error messages and machine names
#[allow(missing_docs)]
/// Possible errors when resolving configuration
pub enum ConfigError {
    #[error("missing required configuration `{field}`: set it explicitly or through {env}")]
    MissingField { field: &'static str, env: &'static str },

    #[error("missing required configuration `{0}`")]
    MissingValue(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read '{path:?}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse credentials: {0}")]
    InvalidCredentials(#[source] BoxError),

    #[error("failed to set up TLS: {0}")]
    Tls(String),

    #[error("port-forward requires at least one port")]
    NoPorts,

    #[error("port {0} is forwarded more than once")]
    DuplicatePort(u16),

    #[error("cannot forward more than {max} ports over one connection, got {count}")]
    TooManyPorts { max: usize, count: usize },
}
