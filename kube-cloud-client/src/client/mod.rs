//! A REST client for the Kubernetes API that authenticates every request
//!
//! The [`Client`] asks its [`AuthProvider`] for a fresh token before each call, attaches it
//! as `Authorization: Bearer <token>` and turns `401`/`403` responses into
//! [`Error::AuthenticationFailed`]. It never retries; after an authentication failure a
//! caller can force a rotation with [`AuthProvider::refresh`] and try once more.
use std::sync::Arc;

use bytes::Bytes;
use http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderMap, Method, Request, StatusCode,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tower::{util::BoxCloneSyncService, BoxError, Layer, Service, ServiceExt};
use tower_http::map_response_body::MapResponseBodyLayer;

use crate::{auth::AuthProvider, Config, Error, Result};

mod body;
mod builder;
pub mod middleware;
#[cfg(feature = "ws")] mod upgrade;

pub use body::Body;
#[cfg(feature = "ws")]
#[cfg_attr(docsrs, doc(cfg(feature = "ws")))]
pub use upgrade::{StreamProtocol, UpgradeConnectionError, UpgradedStream};

pub(crate) type HttpService = BoxCloneSyncService<Request<Body>, http::Response<Body>, BoxError>;

/// The transport was closed before the request was sent.
#[derive(thiserror::Error, Debug)]
#[error("HTTP transport is closed")]
pub struct TransportClosed;

/// A shared, closable handle to an HTTP [`Service`].
///
/// Clones share the underlying service. [`close`](Self::close) drops it for every clone;
/// requests already dispatched keep running.
#[derive(Clone)]
pub struct Transport {
    service: Arc<RwLock<Option<HttpService>>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    /// Wrap a custom `Service` stack.
    pub fn new<S, B>(service: S) -> Self
    where
        S: Service<Request<Body>, Response = http::Response<B>> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        // Erase the response body and error types to avoid type parameters.
        let service = MapResponseBodyLayer::new(|b: B| Body::wrap_body(b))
            .layer(service)
            .map_err(|e: S::Error| -> BoxError { e.into() });
        Self {
            service: Arc::new(RwLock::new(Some(BoxCloneSyncService::new(service)))),
        }
    }

    /// HTTPS transport trusting the platform's native roots, for calls to absolute URLs.
    #[cfg(feature = "rustls-tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls-tls")))]
    pub fn https() -> Result<Self> {
        builder::https_transport()
    }

    /// Send a request and return the response with its body still streaming.
    pub async fn call(&self, request: Request<Body>) -> Result<http::Response<Body>, BoxError> {
        let mut svc = self.service.read().clone().ok_or(TransportClosed)?;
        svc.ready().await?.call(request).await
    }

    /// Send a request and read the whole response body.
    pub async fn send(&self, request: Request<Body>) -> Result<http::Response<Bytes>, BoxError> {
        let (parts, body) = self.call(request).await?.into_parts();
        let body = body.collect_bytes().await?;
        Ok(http::Response::from_parts(parts, body))
    }

    /// Drop the service. Returns `true` if this call closed it.
    pub fn close(&self) -> bool {
        self.service.write().take().is_some()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.service.read().is_none()
    }
}

/// Content type of a PATCH body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PatchType {
    /// `application/merge-patch+json`
    #[default]
    Merge,
    /// `application/strategic-merge-patch+json`
    Strategic,
    /// `application/json-patch+json`
    Json,
}

impl PatchType {
    /// The content type for this patch.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Merge => "application/merge-patch+json",
            Self::Strategic => "application/strategic-merge-patch+json",
            Self::Json => "application/json-patch+json",
        }
    }
}

const JSON: &str = "application/json";

/// A fully read response from the API server.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Construct a response.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self { status, headers, body }
    }

    /// The status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The raw body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response, returning the raw body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// `2xx`
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// `401 Unauthorized`
    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// `403 Forbidden`
    pub fn is_forbidden(&self) -> bool {
        self.status == StatusCode::FORBIDDEN
    }

    /// `404 Not Found`
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }

    /// The body as UTF-8 text.
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec()).map_err(Error::FromUtf8)
    }

    /// The body deserialized from JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            tracing::warn!("failed to deserialize response body: {}", e);
            Error::SerdeError(e)
        })
    }
}

impl From<http::Response<Bytes>> for Response {
    fn from(res: http::Response<Bytes>) -> Self {
        let (parts, body) = res.into_parts();
        Self::new(parts.status, parts.headers, body)
    }
}

/// Client for connecting with a Kubernetes cluster.
///
/// Clones share the transport and the auth provider.
#[derive(Clone)]
pub struct Client {
    transport: Transport,
    auth: Arc<AuthProvider>,
    default_ns: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("auth", &self.auth)
            .field("default_ns", &self.default_ns)
            .finish()
    }
}

impl Client {
    /// Create a [`Client`] using a custom `Service` stack.
    ///
    /// Request paths are passed to the service as is; include a
    /// [`BaseUriLayer`](middleware::BaseUriLayer) to make them relative to the cluster URL.
    pub fn new<S, B>(service: S, auth: AuthProvider) -> Self
    where
        S: Service<Request<Body>, Response = http::Response<B>> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self::with_transport(Transport::new(service), auth)
    }

    /// Create a [`Client`] sharing an existing [`Transport`].
    pub fn with_transport(transport: Transport, auth: AuthProvider) -> Self {
        Self {
            transport,
            auth: Arc::new(auth),
            default_ns: String::from("default"),
        }
    }

    /// Create a [`Client`] with the default HTTPS stack for the cluster in `config`.
    pub fn try_from_config(config: Config, auth: AuthProvider) -> Result<Self> {
        let default_ns = config.default_namespace.clone();
        let transport = builder::cluster_transport(&config)?;
        Ok(Self::with_transport(transport, auth).with_default_namespace(default_ns))
    }

    /// Set the namespace used when none is given.
    #[must_use]
    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_ns = namespace.into();
        self
    }

    /// The namespace used when none is given.
    pub fn default_namespace(&self) -> &str {
        &self.default_ns
    }

    /// The provider authenticating this client.
    pub fn auth(&self) -> &AuthProvider {
        &self.auth
    }

    /// Release the auth provider's resources and the transport. Repeated calls are no-ops.
    pub fn close(&self) {
        self.auth.close();
        if self.transport.close() {
            tracing::debug!("client closed");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// `GET` a path.
    pub async fn get(&self, path: &str) -> Result<Response> {
        self.execute(self.build(Method::GET, path, Body::empty(), None)?).await
    }

    /// `POST` a JSON body to a path.
    pub async fn post(&self, path: &str, body: impl Into<Body>) -> Result<Response> {
        self.execute(self.build(Method::POST, path, body.into(), Some(JSON))?).await
    }

    /// `PUT` a JSON body to a path.
    pub async fn put(&self, path: &str, body: impl Into<Body>) -> Result<Response> {
        self.execute(self.build(Method::PUT, path, body.into(), Some(JSON))?).await
    }

    /// `PATCH` a path with a JSON merge patch.
    pub async fn patch(&self, path: &str, body: impl Into<Body>) -> Result<Response> {
        self.patch_with(path, body, PatchType::Merge).await
    }

    /// `PATCH` a path with the given patch type.
    pub async fn patch_with(&self, path: &str, body: impl Into<Body>, patch: PatchType) -> Result<Response> {
        let request = self.build(Method::PATCH, path, body.into(), Some(patch.content_type()))?;
        self.execute(request).await
    }

    /// `DELETE` a path.
    pub async fn delete(&self, path: &str) -> Result<Response> {
        self.execute(self.build(Method::DELETE, path, Body::empty(), None)?).await
    }

    fn build(
        &self,
        method: Method,
        path: &str,
        body: Body,
        content_type: Option<&'static str>,
    ) -> Result<Request<Body>> {
        let mut builder = Request::builder().method(method).uri(path).header(ACCEPT, JSON);
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        builder.body(body).map_err(Error::HttpError)
    }

    /// Authenticate and send a request, reading the whole response.
    ///
    /// `401` and `403` responses are returned as [`Error::AuthenticationFailed`]; every
    /// other status, `404` included, is returned as a [`Response`].
    pub async fn execute(&self, request: Request<Body>) -> Result<Response> {
        let request = self.authorize(request).await?;
        let res = self.transport.send(request).await.map_err(Error::HttpRequest)?;
        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = String::from_utf8_lossy(res.body()).into_owned();
            tracing::debug!(%status, "authentication failed");
            return Err(Error::AuthenticationFailed { status, body });
        }
        Ok(Response::from(res))
    }

    /// Attach `Authorization` to a request, refreshing the token first if it is stale.
    pub(crate) async fn authorize(&self, mut request: Request<Body>) -> Result<Request<Body>> {
        if self.auth.needs_refresh() {
            tracing::debug!("refreshing token before request");
            self.auth.refresh().await.map_err(Error::Auth)?;
        }
        let header = self.auth.auth_header().await.map_err(Error::Auth)?;
        request.headers_mut().insert(AUTHORIZATION, header);
        Ok(request)
    }

    #[cfg(feature = "ws")]
    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use chrono::{Duration, Utc};
    use futures::{future::BoxFuture, pin_mut};
    use http::{HeaderValue, Request, Response as HttpResponse};
    use secrecy::SecretString;
    use tower_test::mock;

    use super::*;
    use crate::auth::{
        azure::{AzureAuthProvider, TokenCredential},
        AccessToken,
    };

    #[derive(Debug)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl TokenCredential for Arc<Counting> {
        fn get_token<'a>(&'a self, _scopes: &'a [String]) -> BoxFuture<'a, Result<AccessToken, BoxError>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.fail {
                    return Err("credential unavailable".into());
                }
                Ok(AccessToken {
                    token: SecretString::from(format!("token-{n}")),
                    expires_on: Some(Utc::now() + Duration::hours(1)),
                })
            })
        }
    }

    fn counting(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn client_with(cred: Arc<Counting>) -> (Client, mock::Handle<Request<Body>, HttpResponse<Body>>) {
        let (service, handle) = mock::pair::<Request<Body>, HttpResponse<Body>>();
        let auth = AuthProvider::from(AzureAuthProvider::new(cred));
        (Client::new(service, auth), handle)
    }

    #[tokio::test]
    async fn attaches_bearer_and_method_headers() {
        let cred = counting(false);
        let (client, handle) = client_with(cred.clone());
        let spawned = tokio::spawn(async move {
            pin_mut!(handle);
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), Method::POST);
            assert_eq!(request.uri(), "/api/v1/namespaces/default/configmaps");
            assert_eq!(request.headers().get(AUTHORIZATION).unwrap(), "Bearer token-1");
            assert_eq!(request.headers().get(ACCEPT).unwrap(), "application/json");
            assert_eq!(request.headers().get(CONTENT_TYPE).unwrap(), "application/json");
            let body = request.into_body().collect_bytes().await.unwrap();
            assert_eq!(body, r#"{"a":1}"#);
            send.send_response(
                HttpResponse::builder()
                    .status(201)
                    .body(Body::from(r#"{"created":true}"#))
                    .unwrap(),
            );

            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), Method::PATCH);
            assert_eq!(
                request.headers().get(CONTENT_TYPE).unwrap(),
                "application/strategic-merge-patch+json"
            );
            assert_eq!(request.headers().get(AUTHORIZATION).unwrap(), "Bearer token-1");
            send.send_response(HttpResponse::builder().status(404).body(Body::empty()).unwrap());
        });

        let res = client
            .post("/api/v1/namespaces/default/configmaps", r#"{"a":1}"#)
            .await
            .unwrap();
        assert!(res.is_success());
        assert_eq!(res.status(), StatusCode::CREATED);
        let value: serde_json::Value = res.json().unwrap();
        assert_eq!(value["created"], true);

        let res = client
            .patch_with("/api/v1/namespaces/default/configmaps/x", "{}", PatchType::Strategic)
            .await
            .unwrap();
        assert!(res.is_not_found());
        assert!(!res.is_success());

        spawned.await.unwrap();
        assert_eq!(cred.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn classifies_unauthorized_and_forbidden() {
        let (client, handle) = client_with(counting(false));
        let spawned = tokio::spawn(async move {
            pin_mut!(handle);
            for status in [401, 403] {
                let (_request, send) = handle.next_request().await.expect("service not called");
                send.send_response(
                    HttpResponse::builder()
                        .status(status)
                        .body(Body::from("denied"))
                        .unwrap(),
                );
            }
        });

        let err = client.get("/api/v1/pods").await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(err.to_string(), "Authentication failed: 401 Unauthorized - denied");

        let err = client.delete("/api/v1/namespaces/default/pods/x").await.unwrap_err();
        assert!(matches!(
            err,
            Error::AuthenticationFailed { status, ref body } if status == StatusCode::FORBIDDEN && body == "denied"
        ));
        spawned.await.unwrap();
    }

    #[tokio::test]
    async fn refresh_failure_stops_before_dispatch() {
        let (client, handle) = client_with(counting(true));
        let err = client.get("/api/v1/pods").await.unwrap_err();
        assert!(matches!(err, Error::Auth(crate::auth::Error::AzureToken(_))));
        assert!(err
            .to_string()
            .contains("Failed to refresh Azure authentication token"));
        drop(client);
        pin_mut!(handle);
        assert!(handle.next_request().await.is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_http_request_error() {
        let (client, handle) = client_with(counting(false));
        let spawned = tokio::spawn(async move {
            pin_mut!(handle);
            let (_request, send) = handle.next_request().await.expect("service not called");
            send.send_error("connection reset");
        });
        let err = client.put("/api/v1/namespaces/default/pods/x", "{}").await.unwrap_err();
        assert!(matches!(err, Error::HttpRequest(_)));
        assert!(err.to_string().starts_with("HTTP request failed"));
        spawned.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _handle) = client_with(counting(false));
        let clone = client.clone();
        client.close();
        client.close();
        assert!(clone.is_closed());
        assert!(client.auth().is_closed());

        let err = clone.get("/api/v1/pods").await.unwrap_err();
        match err {
            Error::HttpRequest(source) => assert!(source.is::<TransportClosed>()),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn response_predicates() {
        let res = Response::new(StatusCode::UNAUTHORIZED, HeaderMap::new(), Bytes::from_static(b"no"));
        assert!(res.is_unauthorized());
        assert!(!res.is_forbidden());
        assert_eq!(res.text().unwrap(), "no");
        let res = Response::new(StatusCode::FORBIDDEN, HeaderMap::new(), Bytes::new());
        assert!(res.is_forbidden());
        assert!(matches!(res.json::<serde_json::Value>(), Err(Error::SerdeError(_))));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let res = Response::new(StatusCode::OK, headers, Bytes::from(vec![0xff]));
        assert!(matches!(res.text(), Err(Error::FromUtf8(_))));
        assert_eq!(res.headers()[CONTENT_TYPE], "text/plain");
    }
}
