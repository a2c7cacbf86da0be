use http::{self, header, HeaderValue, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::{tungstenite as ws, WebSocketStream};

use super::{Body, Client};
use crate::{
    portforward::{PortForwardHandler, PortForwardSession, Portforwarder},
    Error, Result,
};

/// Stream upgraded by [`Client::connect`].
pub type UpgradedStream = WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>;

/// Channel subprotocols spoken over an upgraded connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamProtocol {
    /// Binary subprotocol v4.
    V4,
    /// Binary subprotocol v5, which adds stream close signals.
    V5,
}

impl StreamProtocol {
    /// The `Sec-WebSocket-Protocol` token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V4 => "v4.channel.k8s.io",
            Self::V5 => "v5.channel.k8s.io",
        }
    }

    /// Whether the protocol can signal the end of a single stream.
    pub fn supports_stream_close(&self) -> bool {
        matches!(self, Self::V5)
    }

    fn offered() -> HeaderValue {
        // Preferred first. Multiple headers does not work, only a single CSV does.
        HeaderValue::from_static("v5.channel.k8s.io, v4.channel.k8s.io")
    }

    fn from_response<B>(res: &http::Response<B>) -> Option<Self> {
        match res.headers().get(header::SEC_WEBSOCKET_PROTOCOL)?.as_bytes() {
            b"v4.channel.k8s.io" => Some(Self::V4),
            b"v5.channel.k8s.io" => Some(Self::V5),
            _ => None,
        }
    }
}

/// Possible errors from upgrading to a WebSocket connection
#[derive(Debug, thiserror::Error)]
pub enum UpgradeConnectionError {
    /// The server did not respond with [`SWITCHING_PROTOCOLS`] status when upgrading the
    /// connection.
    ///
    /// [`SWITCHING_PROTOCOLS`]: http::status::StatusCode::SWITCHING_PROTOCOLS
    #[error("failed to switch protocol: {0}")]
    ProtocolSwitch(StatusCode),

    /// `Upgrade` header was not set to `websocket` (case insensitive)
    #[error("upgrade header was not set to websocket")]
    MissingUpgradeWebSocketHeader,

    /// `Connection` header was not set to `Upgrade` (case insensitive)
    #[error("connection header was not set to Upgrade")]
    MissingConnectionUpgradeHeader,

    /// `Sec-WebSocket-Accept` key mismatched.
    #[error("Sec-WebSocket-Accept key mismatched")]
    SecWebSocketAcceptKeyMismatch,

    /// `Sec-WebSocket-Protocol` mismatched.
    #[error("Sec-WebSocket-Protocol mismatched")]
    SecWebSocketProtocolMismatch,

    /// Failed to get pending HTTP upgrade.
    #[error("failed to get pending HTTP upgrade: {0}")]
    GetPendingUpgrade(#[source] hyper::Error),
}

// Verify upgrade response according to RFC6455, plus the negotiated subprotocol.
pub(crate) fn verify_response<B>(
    res: &http::Response<B>,
    key: &str,
) -> Result<StreamProtocol, UpgradeConnectionError> {
    if res.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(UpgradeConnectionError::ProtocolSwitch(res.status()));
    }

    let header_is = |name: header::HeaderName, expected: &str| {
        res.headers()
            .get(name)
            .and_then(|h| h.to_str().ok())
            .is_some_and(|h| h.eq_ignore_ascii_case(expected))
    };
    if !header_is(header::UPGRADE, "websocket") {
        return Err(UpgradeConnectionError::MissingUpgradeWebSocketHeader);
    }
    if !header_is(header::CONNECTION, "Upgrade") {
        return Err(UpgradeConnectionError::MissingConnectionUpgradeHeader);
    }

    let accept_key = ws::handshake::derive_accept_key(key.as_bytes());
    if !res
        .headers()
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .is_some_and(|h| h == accept_key.as_str())
    {
        return Err(UpgradeConnectionError::SecWebSocketAcceptKeyMismatch);
    }

    StreamProtocol::from_response(res).ok_or(UpgradeConnectionError::SecWebSocketProtocolMismatch)
}

impl Client {
    /// Upgrade an authenticated request to a WebSocket speaking a channel subprotocol.
    pub async fn connect(&self, request: Request<Body>) -> Result<UpgradedStream> {
        let (mut parts, body) = request.into_parts();
        let key = ws::handshake::client::generate_key();
        let headers = &mut parts.headers;
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_str(&key).map_err(|e| Error::HttpError(e.into()))?,
        );
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, StreamProtocol::offered());

        let request = self.authorize(Request::from_parts(parts, body)).await?;
        let res = self
            .transport()
            .call(request)
            .await
            .map_err(Error::HttpRequest)?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = match res.into_body().collect_bytes().await {
                Ok(body) => String::from_utf8_lossy(&body).into_owned(),
                Err(err) => {
                    tracing::warn!(%status, "failed to read rejected upgrade body: {}", err);
                    format!("<unreadable body: {err}>")
                }
            };
            return Err(Error::AuthenticationFailed { status, body });
        }
        let protocol = verify_response(&res, &key).map_err(Error::UpgradeConnection)?;
        tracing::debug!(protocol = protocol.as_str(), "upgraded connection");

        match hyper::upgrade::on(res).await {
            Ok(upgraded) => Ok(WebSocketStream::from_raw_socket(
                TokioIo::new(upgraded),
                ws::protocol::Role::Client,
                None,
            )
            .await),
            Err(e) => Err(Error::UpgradeConnection(
                UpgradeConnectionError::GetPendingUpgrade(e),
            )),
        }
    }

    /// Forward `ports` of a pod, delivering what the pod sends to `handler`.
    pub async fn portforward<H: PortForwardHandler>(
        &self,
        namespace: &str,
        pod: &str,
        ports: &[u16],
        handler: H,
    ) -> Result<Portforwarder> {
        let session = PortForwardSession::new(ports).map_err(Error::Configuration)?;
        let request = portforward_request(namespace, pod, &session)?;
        let stream = self.connect(request).await?;
        Ok(Portforwarder::start(stream, session, handler))
    }
}

fn portforward_request(namespace: &str, pod: &str, session: &PortForwardSession) -> Result<Request<Body>> {
    let path = format!(
        "/api/v1/namespaces/{namespace}/pods/{pod}/portforward?{}",
        session.query()
    );
    Request::get(path).body(Body::empty()).map_err(Error::HttpError)
}
