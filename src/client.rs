use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use cookie::Cookie;
use http::header::{HeaderValue, PROXY_AUTHORIZATION};
use http::{Method, Uri};
use tokio::time::{sleep, timeout};
use tracing::{Instrument, debug, info_span, warn};
use url::Url;

use crate::ReqResult;
use crate::cookie::{CookieJar, CookieStore, cookie_header_pairs, parse_set_cookie_headers};
use crate::error::{Error, ErrorClass, TimeoutPhase};
use crate::interceptor::{AfterResponse, BeforeRequest, Interceptor};
use crate::proxy::{ProxyConfig, parse_no_proxy_rules};
use crate::request::{AttemptBody, PreparedRequest, Request};
use crate::response::{BodyLimits, Response};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::tls::TlsOptions;
use crate::transport::{HyperTransport, HyperTransportConfig, Transport};
use crate::util::{
    append_cookie_header, ensure_accept_encoding, is_redirect_status, parse_header_value,
    redact_url_for_logs, redirect_location, redirect_method, same_origin,
    sanitize_headers_for_redirect, url_to_uri,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_MAX_REDIRECTS: usize = 10;
const DEFAULT_CLIENT_NAME: &str = "reqwire";
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    enabled: bool,
    max_redirects: usize,
}

impl RedirectPolicy {
    pub const fn none() -> Self {
        Self {
            enabled: false,
            max_redirects: 0,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            enabled: true,
            max_redirects,
        }
    }

    pub const fn follow() -> Self {
        Self::limited(DEFAULT_MAX_REDIRECTS)
    }

    pub const fn enabled(self) -> bool {
        self.enabled
    }

    pub const fn max_redirects(self) -> usize {
        if self.enabled { self.max_redirects } else { 0 }
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::follow()
    }
}

/// Collects client configuration. Nothing is validated or built until
/// [`ClientBuilder::try_build`], and the built client cannot be reconfigured.
pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    request_timeout: Duration,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    redirect_policy: RedirectPolicy,
    cookie_store: Option<Arc<dyn CookieStore>>,
    proxy_url: Option<String>,
    proxy_authorization: Option<HeaderValue>,
    no_proxy_rules: Vec<String>,
    tls_options: TlsOptions,
    retry_policy: RetryPolicy,
    max_response_body_bytes: usize,
    client_name: String,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            redirect_policy: RedirectPolicy::follow(),
            cookie_store: Some(Arc::new(CookieJar::new())),
            proxy_url: None,
            proxy_authorization: None,
            no_proxy_rules: Vec::new(),
            tls_options: TlsOptions::default(),
            retry_policy: RetryPolicy::disabled(),
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            interceptors: Vec::new(),
        }
    }

    /// Replaces the built-in hyper transport. Proxy and TLS options cannot be
    /// combined with a custom transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Limit for one exchange, from dispatch to response headers, and again
    /// for reading the body.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(MIN_TIMEOUT);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(MIN_TIMEOUT);
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.redirect_policy = redirect_policy;
        self
    }

    pub fn cookie_store(mut self, cookie_store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(cookie_store);
        self
    }

    /// No cookie jar: `Set-Cookie` is ignored and nothing is attached.
    pub fn disable_session(mut self) -> Self {
        self.cookie_store = None;
        self
    }

    pub fn http_proxy(mut self, proxy_uri: Uri) -> Self {
        self.proxy_url = Some(proxy_uri.to_string());
        self
    }

    /// Parsed and validated by `try_build`.
    pub fn proxy_url(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    pub fn proxy_authorization(mut self, mut proxy_authorization: HeaderValue) -> Self {
        proxy_authorization.set_sensitive(true);
        self.proxy_authorization = Some(proxy_authorization);
        self
    }

    pub fn try_proxy_authorization(self, proxy_authorization: &str) -> ReqResult<Self> {
        let value = parse_header_value(PROXY_AUTHORIZATION.as_str(), proxy_authorization)?;
        Ok(self.proxy_authorization(value))
    }

    pub fn no_proxy<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_proxy_rules = rules.into_iter().map(Into::into).collect();
        self
    }

    /// Trusts the certificates in `certificate_pem` in addition to the Web PKI roots.
    pub fn tls_root_ca_pem(mut self, certificate_pem: impl Into<Vec<u8>>) -> Self {
        self.tls_options
            .root_certificates_pem
            .push(certificate_pem.into());
        self
    }

    pub fn tls_client_identity_pem(
        mut self,
        cert_chain_pem: impl Into<Vec<u8>>,
        private_key_pem: impl Into<Vec<u8>>,
    ) -> Self {
        self.tls_options.client_identity_pem = Some((cert_chain_pem.into(), private_key_pem.into()));
        self
    }

    /// Turns off server certificate verification.
    pub fn danger_accept_invalid_certs(mut self, accept_invalid_certs: bool) -> Self {
        self.tls_options.accept_invalid_certs = accept_invalid_certs;
        self
    }

    /// Default for requests that carry no policy of their own.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptor<I>(self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.interceptor_arc(Arc::new(interceptor))
    }

    pub fn before_request<F>(self, hook: F) -> Self
    where
        F: Fn(&mut Request) -> ReqResult<()> + Send + Sync + 'static,
    {
        self.interceptor(BeforeRequest(hook))
    }

    pub fn after_response<F>(self, hook: F) -> Self
    where
        F: Fn(&mut Response) -> ReqResult<()> + Send + Sync + 'static,
    {
        self.interceptor(AfterResponse(hook))
    }

    pub fn try_build(self) -> ReqResult<Client> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => {
                if self.proxy_url.is_some() || self.tls_options.is_customized() {
                    return Err(Error::Config {
                        message: "proxy and TLS options only apply to the built-in transport"
                            .to_owned(),
                    });
                }
                transport
            }
            None => {
                let proxy = match self.proxy_url {
                    Some(proxy_url) => Some(ProxyConfig::parse(
                        &proxy_url,
                        self.proxy_authorization,
                        parse_no_proxy_rules(&self.no_proxy_rules)?,
                    )?),
                    None if self.proxy_authorization.is_some() => {
                        return Err(Error::Config {
                            message: "proxy authorization is set but no proxy is configured"
                                .to_owned(),
                        });
                    }
                    None => None,
                };
                Arc::new(HyperTransport::new(HyperTransportConfig {
                    proxy,
                    tls: self.tls_options,
                    connect_timeout: self.connect_timeout,
                    pool_idle_timeout: self.pool_idle_timeout,
                    pool_max_idle_per_host: self.pool_max_idle_per_host,
                })?)
            }
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                request_timeout: self.request_timeout,
                redirect_policy: self.redirect_policy,
                cookie_store: self.cookie_store,
                retry_policy: self.retry_policy,
                max_response_body_bytes: self.max_response_body_bytes,
                client_name: self.client_name,
                interceptors: self.interceptors,
            }),
        })
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build reqwire client: {error}; use try_build() to handle configuration errors")
        })
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    redirect_policy: RedirectPolicy,
    cookie_store: Option<Arc<dyn CookieStore>>,
    retry_policy: RetryPolicy,
    max_response_body_bytes: usize,
    client_name: String,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

/// A configured client. Cloning is cheap and clones share the transport,
/// the connection pool and the cookie jar.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("client_name", &self.inner.client_name)
            .field("request_timeout", &self.inner.request_timeout)
            .field("redirect_policy", &self.inner.redirect_policy)
            .field("retry_policy", &self.inner.retry_policy)
            .field("session", &self.inner.cookie_store.is_some())
            .field("interceptors", &self.inner.interceptors.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn client_name(&self) -> &str {
        &self.inner.client_name
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.inner.redirect_policy
    }

    /// Runs the request through the before hooks, the redirect and retry
    /// loops and the after hooks.
    ///
    /// Failures before a response exists (hook errors, build errors,
    /// transport errors, cancellation) come back as `Err`. Once a response
    /// exists, after-hook failures are stored on it; see [`Response::error`].
    pub async fn send(&self, mut request: Request) -> ReqResult<Response> {
        for interceptor in &self.inner.interceptors {
            interceptor.before_request(&mut request)?;
        }

        let retry = request
            .retry_policy()
            .cloned()
            .unwrap_or_else(|| self.inner.retry_policy.clone());
        let mut prepared = request.prepare()?;
        ensure_accept_encoding(&mut prepared.headers);

        let mut response = self.send_following_redirects(&mut prepared, &retry).await?;
        for interceptor in &self.inner.interceptors {
            if let Err(error) = interceptor.after_response(&mut response) {
                debug!(error = %error, "after-response hook flagged the response");
                response.set_error(error);
                break;
            }
        }
        Ok(response)
    }

    async fn send_following_redirects(
        &self,
        prepared: &mut PreparedRequest,
        retry: &RetryPolicy,
    ) -> ReqResult<Response> {
        let max_redirects = self.inner.redirect_policy.max_redirects();
        let mut redirect_count = 0_usize;

        loop {
            let response = self.send_with_retry(prepared, retry).await?;
            self.store_response_cookies(&prepared.url, &response);

            let status = response.status();
            if !self.inner.redirect_policy.enabled() || !is_redirect_status(status) {
                return Ok(response);
            }
            let Some(location) = redirect_location(response.headers()) else {
                return Err(Error::MissingRedirectLocation {
                    status: status.as_u16(),
                    method: prepared.method.clone(),
                    uri: prepared.uri_for_logs.clone(),
                });
            };
            if redirect_count >= max_redirects {
                return Err(Error::RedirectLimitExceeded {
                    max_redirects,
                    method: prepared.method.clone(),
                    uri: prepared.uri_for_logs.clone(),
                });
            }
            let next_url = match prepared.url.join(&location) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => url,
                _ => {
                    return Err(Error::InvalidRedirectLocation {
                        location,
                        method: prepared.method.clone(),
                        uri: prepared.uri_for_logs.clone(),
                    });
                }
            };

            let next_method = redirect_method(&prepared.method, status);
            let method_changed_to_get = next_method == Method::GET && prepared.method != Method::GET;
            if method_changed_to_get {
                prepared.drop_body();
            } else if !prepared.is_replayable() {
                return Err(Error::RedirectBodyNotReplayable {
                    method: prepared.method.clone(),
                    uri: prepared.uri_for_logs.clone(),
                });
            }
            sanitize_headers_for_redirect(
                &mut prepared.headers,
                method_changed_to_get,
                same_origin(&prepared.url, &next_url),
            );

            let next_uri = redact_url_for_logs(&next_url);
            debug!(
                status = status.as_u16(),
                from = %prepared.uri_for_logs,
                to = %next_uri,
                "following redirect"
            );
            prepared.method = next_method;
            prepared.url = next_url;
            prepared.uri_for_logs = next_uri;
            redirect_count += 1;
        }
    }

    async fn send_with_retry(
        &self,
        prepared: &mut PreparedRequest,
        retry: &RetryPolicy,
    ) -> ReqResult<Response> {
        let max_attempts = if prepared.is_replayable() {
            retry.configured_max_attempts()
        } else {
            1
        };
        let mut attempt = 1_usize;

        loop {
            let span = info_span!(
                "reqwire.request",
                client = %self.inner.client_name,
                method = %prepared.method,
                uri = %prepared.uri_for_logs,
                attempt = attempt,
                max_attempts = max_attempts
            );
            let result = self.dispatch(prepared).instrument(span.clone()).await;

            if let Some(fired) = prepared.cancellation.check() {
                return Err(fired.into_error(&prepared.method, &prepared.uri_for_logs));
            }
            if let Err(error) = &result
                && matches!(error.class(), ErrorClass::Cancellation | ErrorClass::Build)
            {
                return result;
            }
            if attempt >= max_attempts {
                return result;
            }

            let attempt_index = attempt - 1;
            let decision = match &result {
                Ok(response) => RetryDecision::for_response(
                    attempt_index,
                    max_attempts,
                    &prepared.method,
                    &prepared.uri_for_logs,
                    response.status(),
                    response.headers(),
                ),
                Err(error) => RetryDecision::for_error(
                    attempt_index,
                    max_attempts,
                    &prepared.method,
                    &prepared.uri_for_logs,
                    error,
                ),
            };
            if !retry.should_retry(&decision) {
                return result;
            }

            let delay = retry.delay(&decision);
            span.in_scope(|| match &result {
                Ok(response) => warn!(
                    delay_ms = delay.as_millis() as u64,
                    status = response.status().as_u16(),
                    "retrying request after response"
                ),
                Err(error) => warn!(
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying request after error"
                ),
            });
            drop(result);

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    fired = prepared.cancellation.fired() => {
                        return Err(fired.into_error(&prepared.method, &prepared.uri_for_logs));
                    }
                    _ = sleep(delay) => {}
                }
            }
            attempt += 1;
        }
    }

    async fn dispatch(&self, prepared: &mut PreparedRequest) -> ReqResult<Response> {
        let method = prepared.method.clone();
        let uri_for_logs = prepared.uri_for_logs.clone();
        let Some(AttemptBody { body, upload }) = prepared.attempt_body() else {
            return Err(Error::BodyUnavailable {
                method,
                uri: uri_for_logs,
            });
        };

        let mut headers = prepared.headers.clone();
        if let Some(cookie_store) = &self.inner.cookie_store {
            let cookies = cookie_store.cookies(&prepared.url);
            append_cookie_header(&mut headers, &cookie_header_pairs(&cookies))?;
        }
        let mut builder = http::Request::builder()
            .method(method.clone())
            .uri(url_to_uri(&prepared.url)?);
        if let Some(request_headers) = builder.headers_mut() {
            *request_headers = headers;
        }
        let request = builder
            .body(body)
            .map_err(|source| Error::RequestBuild { source })?;

        debug!("sending request");
        let request_timeout = self.inner.request_timeout;
        let exchange = timeout(request_timeout, self.inner.transport.send(request));
        let outcome = tokio::select! {
            biased;
            fired = prepared.cancellation.fired() => {
                return Err(fired.into_error(&method, &uri_for_logs));
            }
            outcome = exchange => outcome,
        };

        if let Some(failure) = upload.as_ref().and_then(|upload| upload.take_failure()) {
            return Err(failure);
        }
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                return Err(Error::Transport {
                    kind: error.kind(),
                    method,
                    uri: uri_for_logs,
                    source: error.into_source(),
                });
            }
            Err(_) => {
                return Err(Error::Timeout {
                    phase: TimeoutPhase::Transport,
                    timeout_ms: request_timeout.as_millis(),
                    method,
                    uri: uri_for_logs,
                });
            }
        };
        debug!(status = response.status().as_u16(), "received response headers");

        Ok(Response::new(
            response,
            method,
            prepared.url.clone(),
            prepared.cancellation.clone(),
            BodyLimits {
                max_bytes: self.inner.max_response_body_bytes,
                read_timeout: Some(request_timeout),
            },
        ))
    }

    fn store_response_cookies(&self, url: &Url, response: &Response) {
        if let Some(cookie_store) = &self.inner.cookie_store {
            let cookies = parse_set_cookie_headers(response.headers());
            if !cookies.is_empty() {
                cookie_store.set_cookies(url, cookies);
            }
        }
    }

    fn session(&self) -> ReqResult<&Arc<dyn CookieStore>> {
        self.inner.cookie_store.as_ref().ok_or(Error::NoCookieJar)
    }

    /// Stores cookies in the session as if `url` had set them.
    pub fn set_cookies(&self, url: &Url, cookies: Vec<Cookie<'static>>) -> ReqResult<()> {
        self.session()?.set_cookies(url, cookies);
        Ok(())
    }

    /// Session cookies that would be sent to `url`.
    pub fn filter_cookies(&self, url: &Url) -> ReqResult<Vec<Cookie<'static>>> {
        let cookies = self.session()?.cookies(url);
        if cookies.is_empty() {
            return Err(Error::NoCookie { name: None });
        }
        Ok(cookies)
    }

    pub fn filter_cookie(&self, url: &Url, name: &str) -> ReqResult<Cookie<'static>> {
        self.session()?
            .cookies(url)
            .into_iter()
            .find(|cookie| cookie.name() == name)
            .ok_or_else(|| Error::NoCookie {
                name: Some(name.to_owned()),
            })
    }
}

static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
static DEFAULT_CLIENT_INIT: Mutex<()> = Mutex::new(());

/// Installs the process-wide client returned by [`default_client`]. Fails,
/// handing the client back, once a default exists.
pub fn init_default_client(client: Client) -> Result<(), Client> {
    let _guard = DEFAULT_CLIENT_INIT
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    DEFAULT_CLIENT.set(client)
}

/// The process-wide client, built with default settings on first use unless
/// [`init_default_client`] ran earlier. Concurrent first calls build it once.
pub fn default_client() -> ReqResult<&'static Client> {
    if let Some(client) = DEFAULT_CLIENT.get() {
        return Ok(client);
    }
    let _guard = DEFAULT_CLIENT_INIT
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(client) = DEFAULT_CLIENT.get() {
        return Ok(client);
    }
    let client = Client::builder().try_build()?;
    Ok(DEFAULT_CLIENT.get_or_init(|| client))
}
