use std::time::Duration;

use futures_util::future::BoxFuture;
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::ReqResult;
use crate::body::{ReqBody, ResBody};
use crate::error::{BoxError, TransportErrorKind};
use crate::proxy::{ProxyConfig, ProxyConnector};
use crate::tls::{TlsOptions, build_tls_config};
use crate::util::classify_transport_error;

/// A failed exchange, before any response arrived.
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    source: BoxError,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_source(self) -> BoxError {
        self.source
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} transport error: {}", self.kind, self.source)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// The network layer under the retry and interceptor logic. One call is one
/// exchange: no retries, no redirects, no decoding.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: http::Request<ReqBody>,
    ) -> BoxFuture<'_, Result<http::Response<ResBody>, TransportError>>;
}

type HttpsConnector = hyper_rustls::HttpsConnector<ProxyConnector>;

pub(crate) struct HyperTransportConfig {
    pub(crate) proxy: Option<ProxyConfig>,
    pub(crate) tls: TlsOptions,
    pub(crate) connect_timeout: Duration,
    pub(crate) pool_idle_timeout: Duration,
    pub(crate) pool_max_idle_per_host: usize,
}

/// Pooled keep-alive transport: hyper over rustls, HTTP/1.1 and HTTP/2,
/// optionally through an HTTP proxy.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient<HttpsConnector, ReqBody>,
}

impl HyperTransport {
    pub(crate) fn new(config: HyperTransportConfig) -> ReqResult<Self> {
        let connector = ProxyConnector::new(config.proxy, config.connect_timeout);
        let tls_config = build_tls_config(&config.tls)?;
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build(https);
        Ok(Self { client })
    }
}

impl Transport for HyperTransport {
    fn send(
        &self,
        request: http::Request<ReqBody>,
    ) -> BoxFuture<'_, Result<http::Response<ResBody>, TransportError>> {
        Box::pin(async move {
            let response = self.client.request(request).await.map_err(|error| {
                let kind = classify_transport_error(&error);
                debug!(kind = %kind, error = %error, "transport exchange failed");
                TransportError::new(kind, error)
            })?;
            Ok(response.map(|body| body.map_err(BoxError::from).boxed()))
        })
    }
}
