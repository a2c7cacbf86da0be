use std::time::Duration;

use http::{header::HeaderMap, Request, Response, Uri};
use hyper::{
    body::Incoming,
    rt::{Read, Write},
};
use hyper_timeout::TimeoutConnector;
use hyper_util::{
    client::legacy::connect::{Connection, HttpConnector},
    rt::TokioExecutor,
};
use tower::{BoxError, Service, ServiceBuilder};
use tower_http::{classify::ServerErrorsFailureClass, trace::TraceLayer};
use tracing::Span;

use super::{body::Body, middleware::BaseUriLayer, Transport};
use crate::{error::ConfigError, Config, Error, Result};

/// Settings shared by the cluster transport and the transports talking to cloud token endpoints.
struct TransportSettings<'a> {
    base_uri: Option<Uri>,
    root_cert: Option<&'a Vec<Vec<u8>>>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

/// Transport for the API server described by `config`.
pub(crate) fn cluster_transport(config: &Config) -> Result<Transport> {
    make_transport(TransportSettings {
        base_uri: Some(config.cluster_url.clone()),
        root_cert: config.root_cert.as_ref(),
        connect_timeout: config.connect_timeout,
        read_timeout: config.read_timeout,
        write_timeout: config.write_timeout,
    })
}

/// Transport for absolute URLs, trusting the native roots.
#[cfg(feature = "rustls-tls")]
pub(crate) fn https_transport() -> Result<Transport> {
    let defaults = Config::new(Uri::from_static("https://localhost"));
    make_transport(TransportSettings {
        base_uri: None,
        root_cert: None,
        connect_timeout: defaults.connect_timeout,
        read_timeout: defaults.read_timeout,
        write_timeout: defaults.write_timeout,
    })
}

fn make_transport(settings: TransportSettings<'_>) -> Result<Transport> {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);

    #[cfg(feature = "rustls-tls")]
    let connector = rustls_https_connector(connector, settings.root_cert)?;
    #[cfg(not(feature = "rustls-tls"))]
    if settings
        .base_uri
        .as_ref()
        .is_some_and(|u| u.scheme() == Some(&http::uri::Scheme::HTTPS))
    {
        // no tls stack situation only works with http scheme
        return Err(Error::Configuration(ConfigError::Tls(
            "an https cluster url requires the rustls-tls feature".into(),
        )));
    }

    Ok(build_stack(connector, settings))
}

fn build_stack<H>(connector: H, settings: TransportSettings<'_>) -> Transport
where
    H: 'static + Clone + Send + Sync + Service<Uri>,
    H::Response: 'static + Connection + Read + Write + Send + Unpin,
    H::Future: 'static + Send,
    H::Error: Into<BoxError>,
{
    let mut connector = TimeoutConnector::new(connector);
    connector.set_connect_timeout(settings.connect_timeout);
    connector.set_read_timeout(settings.read_timeout);
    connector.set_write_timeout(settings.write_timeout);

    let client: hyper_util::client::legacy::Client<_, Body> =
        hyper_util::client::legacy::Builder::new(TokioExecutor::new()).build(connector);

    let service = ServiceBuilder::new()
        .option_layer(settings.base_uri.map(BaseUriLayer::new))
        .layer(
            // Attribute names follow [Semantic Conventions].
            // [Semantic Conventions]: https://github.com/open-telemetry/opentelemetry-specification/blob/main/specification/trace/semantic_conventions/http.md
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<Body>| {
                    tracing::debug_span!(
                        "HTTP",
                         http.method = %req.method(),
                         http.url = %req.uri(),
                         http.status_code = tracing::field::Empty,
                         otel.kind = "client",
                         otel.status_code = tracing::field::Empty,
                    )
                })
                .on_request(|_req: &Request<Body>, _span: &Span| {
                    tracing::debug!("requesting");
                })
                .on_response(|res: &Response<Incoming>, _latency: Duration, span: &Span| {
                    let status = res.status();
                    span.record("http.status_code", status.as_u16());
                    if status.is_client_error() || status.is_server_error() {
                        span.record("otel.status_code", "ERROR");
                    }
                })
                .on_body_chunk(())
                .on_eos(|_: Option<&HeaderMap>, _duration: Duration, _span: &Span| {
                    tracing::debug!("stream closed");
                })
                .on_failure(|ec: ServerErrorsFailureClass, _latency: Duration, span: &Span| {
                    span.record("otel.status_code", "ERROR");
                    match ec {
                        ServerErrorsFailureClass::StatusCode(status) => {
                            span.record("http.status_code", status.as_u16());
                            tracing::error!("failed with status {}", status)
                        }
                        ServerErrorsFailureClass::Error(err) => {
                            tracing::error!("failed with error {}", err)
                        }
                    }
                }),
        )
        .service(client);

    Transport::new(service)
}

#[cfg(feature = "rustls-tls")]
fn rustls_https_connector(
    connector: HttpConnector,
    root_cert: Option<&Vec<Vec<u8>>>,
) -> Result<hyper_rustls::HttpsConnector<HttpConnector>> {
    let builder = hyper_rustls::HttpsConnectorBuilder::new();
    let builder = match root_cert {
        Some(ders) => builder.with_tls_config(rustls_client_config(ders)?),
        None => builder
            .with_native_roots()
            .map_err(|e| Error::Configuration(ConfigError::Tls(e.to_string())))?,
    };
    Ok(builder.https_or_http().enable_http1().wrap_connector(connector))
}

/// Create a `rustls::ClientConfig` trusting only the given DER certificates.
#[cfg(feature = "rustls-tls")]
fn rustls_client_config(ders: &[Vec<u8>]) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for der in ders {
        roots
            .add(rustls::pki_types::CertificateDer::from(der.clone()))
            .map_err(|e| Error::Configuration(ConfigError::Tls(e.to_string())))?;
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
