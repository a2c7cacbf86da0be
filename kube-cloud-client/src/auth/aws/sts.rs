//! A minimal STS query API client.
use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderValue, Request, StatusCode,
};
use secrecy::SecretString;
use thiserror::Error;
use tower::BoxError;

use super::{
    sigv4::{RequestSigner, SigningError, UnsignedRequest},
    token::sts_host,
    Credentials,
};
use crate::client::{Body, Transport};

const STS_VERSION: &str = "2011-06-15";

#[derive(Error, Debug)]
/// Possible errors when calling STS
pub enum StsError {
    /// Failed to build the request
    #[error("failed to build STS request: {0}")]
    BuildRequest(#[source] http::Error),

    /// Failed to presign the request
    #[error("failed to sign STS request: {0}")]
    Signing(#[source] SigningError),

    /// The transport failed
    #[error("STS request failed: {0}")]
    Request(#[source] BoxError),

    /// STS answered with an `ErrorResponse`
    #[error("STS returned {status}: {code}: {message}")]
    Service {
        /// HTTP status
        status: StatusCode,
        /// STS error code, e.g. `InvalidIdentityToken`
        code: String,
        /// Human readable message
        message: String,
    },

    /// The response body is not valid XML
    #[error("failed to parse STS response: {0}")]
    Xml(#[source] roxmltree::Error),

    /// The response is valid XML but lacks the credentials
    #[error("invalid STS response: {0}")]
    InvalidResponse(String),
}

/// Parameters of an `AssumeRoleWithWebIdentity` call.
#[derive(Clone, Copy)]
pub struct WebIdentityRequest<'a> {
    /// The role to assume
    pub role_arn: &'a str,
    /// Identifier of the session, shows up in CloudTrail
    pub session_name: &'a str,
    /// The OIDC token issued by the identity provider
    pub web_identity_token: &'a str,
    /// Requested lifetime of the session
    pub duration_seconds: u32,
}

impl fmt::Debug for WebIdentityRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebIdentityRequest")
            .field("role_arn", &self.role_arn)
            .field("session_name", &self.session_name)
            .field("web_identity_token", &"[REDACTED]")
            .field("duration_seconds", &self.duration_seconds)
            .finish()
    }
}

/// Exchanges a web identity token for session credentials.
pub trait WebIdentityExchange: Send + Sync + fmt::Debug {
    /// Call `AssumeRoleWithWebIdentity`.
    fn assume_role_with_web_identity<'a>(
        &'a self,
        request: WebIdentityRequest<'a>,
    ) -> BoxFuture<'a, Result<Credentials, BoxError>>;

    /// Release network resources. Repeated calls are no-ops.
    fn close(&self) {}
}

/// STS client for one region.
#[derive(Clone, Debug)]
pub struct StsClient {
    transport: Transport,
    region: String,
    host: String,
}

impl StsClient {
    /// A client sending through `transport` to the regional endpoint.
    pub fn new(transport: Transport, region: impl Into<String>) -> Self {
        let region = region.into();
        let host = sts_host(&region);
        Self {
            transport,
            region,
            host,
        }
    }

    /// A client over HTTPS with the platform's native roots.
    #[cfg(feature = "rustls-tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls-tls")))]
    pub fn https(region: impl Into<String>) -> crate::Result<Self> {
        Ok(Self::new(Transport::https()?, region))
    }

    /// The region.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Exchange an OIDC token for role session credentials. The call is unsigned.
    pub async fn assume_role_with_web_identity(
        &self,
        request: WebIdentityRequest<'_>,
    ) -> Result<Credentials, StsError> {
        let duration = request.duration_seconds.to_string();
        let form = form_urlencoded::Serializer::new(String::new())
            .extend_pairs([
                ("Action", "AssumeRoleWithWebIdentity"),
                ("Version", STS_VERSION),
                ("RoleArn", request.role_arn),
                ("RoleSessionName", request.session_name),
                ("WebIdentityToken", request.web_identity_token),
                ("DurationSeconds", duration.as_str()),
            ])
            .finish();
        let req = Request::post(format!("https://{}/", self.host))
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .header(ACCEPT, HeaderValue::from_static("application/xml"))
            .body(Body::from(form))
            .map_err(StsError::BuildRequest)?;
        tracing::debug!(role_arn = request.role_arn, "calling AssumeRoleWithWebIdentity");
        self.send(req).await
    }

    /// Assume `role_arn` with `base` credentials through a presigned `AssumeRole` GET.
    pub async fn assume_role(
        &self,
        base: &Credentials,
        role_arn: &str,
        session_name: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Credentials, StsError> {
        let unsigned = UnsignedRequest::get(self.host.as_str(), "/")
            .with_param("Action", "AssumeRole")
            .with_param("Version", STS_VERSION)
            .with_param("RoleArn", role_arn)
            .with_param("RoleSessionName", session_name)
            .with_param("DurationSeconds", duration.as_secs().to_string());
        let url = RequestSigner::new(self.region.as_str(), "sts")
            .presign(&unsigned, base, now)
            .map_err(StsError::Signing)?;
        let req = Request::get(url)
            .header(ACCEPT, HeaderValue::from_static("application/xml"))
            .body(Body::empty())
            .map_err(StsError::BuildRequest)?;
        tracing::debug!(role_arn, "calling AssumeRole");
        self.send(req).await
    }

    /// Close the transport. Repeated calls are no-ops.
    pub fn close(&self) {
        self.transport.close();
    }

    /// Whether the transport was closed.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    async fn send(&self, req: Request<Body>) -> Result<Credentials, StsError> {
        let res = self.transport.send(req).await.map_err(StsError::Request)?;
        let status = res.status();
        let body = String::from_utf8_lossy(res.body());
        if !status.is_success() {
            return Err(parse_error(status, &body));
        }
        parse_credentials(&body)
    }
}

impl WebIdentityExchange for StsClient {
    fn assume_role_with_web_identity<'a>(
        &'a self,
        request: WebIdentityRequest<'a>,
    ) -> BoxFuture<'a, Result<Credentials, BoxError>> {
        async move {
            StsClient::assume_role_with_web_identity(self, request)
                .await
                .map_err(BoxError::from)
        }
        .boxed()
    }

    fn close(&self) {
        StsClient::close(self)
    }
}

fn parse_credentials(body: &str) -> Result<Credentials, StsError> {
    let doc = roxmltree::Document::parse(body).map_err(StsError::Xml)?;
    let node = doc
        .descendants()
        .find(|n| n.has_tag_name("Credentials"))
        .ok_or_else(|| StsError::InvalidResponse("no Credentials element".into()))?;
    let field = |name: &'static str| {
        node.children()
            .find(|n| n.has_tag_name(name))
            .and_then(|n| n.text())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| StsError::InvalidResponse(format!("missing {name}")))
    };
    let expiration = field("Expiration")?;
    let expires_at = DateTime::parse_from_rfc3339(expiration)
        .map_err(|e| StsError::InvalidResponse(format!("invalid Expiration {expiration:?}: {e}")))?
        .with_timezone(&Utc);
    Ok(Credentials {
        access_key_id: field("AccessKeyId")?.to_owned(),
        secret_access_key: SecretString::from(field("SecretAccessKey")?.to_owned()),
        session_token: Some(SecretString::from(field("SessionToken")?.to_owned())),
        expires_at: Some(expires_at),
    })
}

fn parse_error(status: StatusCode, body: &str) -> StsError {
    let text = |name: &str| {
        roxmltree::Document::parse(body).ok().and_then(|doc| {
            doc.descendants()
                .find(|n| n.has_tag_name(name))
                .and_then(|n| n.text())
                .map(|t| t.trim().to_owned())
        })
    };
    StsError::Service {
        status,
        code: text("Code").unwrap_or_else(|| "Unknown".to_owned()),
        message: text("Message").unwrap_or_else(|| body.trim().to_owned()),
    }
}
