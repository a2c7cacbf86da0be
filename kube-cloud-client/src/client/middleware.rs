//! Middleware making request paths relative to the cluster URL.
use http::{uri, Request, Uri};
use tower::{Layer, Service};

/// Layer that applies [`BaseUri`] which makes all requests relative to the URI.
///
/// Path in the base URI is preserved. Requests that already carry a scheme and
/// authority are passed through untouched.
#[derive(Debug, Clone)]
pub struct BaseUriLayer {
    base_uri: Uri,
}

impl BaseUriLayer {
    /// Set base URI of requests.
    pub fn new(base_uri: Uri) -> Self {
        Self { base_uri }
    }
}

impl<S> Layer<S> for BaseUriLayer {
    type Service = BaseUri<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BaseUri {
            base_uri: self.base_uri.clone(),
            inner,
        }
    }
}

/// Middleware that sets base URI so that all requests are relative to it.
#[derive(Debug, Clone)]
pub struct BaseUri<S> {
    base_uri: Uri,
    inner: S,
}

impl<S, ReqBody> Service<Request<ReqBody>> for BaseUri<S>
where
    S: Service<Request<ReqBody>>,
{
    type Error = S::Error;
    type Future = S::Future;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let (mut parts, body) = req.into_parts();
        if parts.uri.authority().is_none() {
            match join(&self.base_uri, parts.uri.path_and_query()) {
                Ok(joined) => parts.uri = joined,
                Err(err) => tracing::warn!("failed to join {} onto base URI: {}", parts.uri, err),
            }
        }
        self.inner.call(Request::from_parts(parts, body))
    }
}

// Join base URI and Path+Query, preserving any path in the base.
fn join(base_uri: &Uri, req_pandq: Option<&uri::PathAndQuery>) -> Result<Uri, http::Error> {
    let mut builder = uri::Builder::new();
    if let Some(scheme) = base_uri.scheme() {
        builder = builder.scheme(scheme.as_str());
    }
    if let Some(authority) = base_uri.authority() {
        builder = builder.authority(authority.as_str());
    }
    let base_path = base_uri.path().trim_end_matches('/');
    builder = match req_pandq {
        // `PathAndQuery` always starts with a slash.
        Some(pandq) => builder.path_and_query(format!("{base_path}{pandq}")),
        None if base_path.is_empty() => builder.path_and_query("/"),
        None => builder.path_and_query(base_path),
    };
    builder.build()
}
