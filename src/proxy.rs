use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use http::header::HeaderValue;
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use tower_service::Service;
use url::Url;

use crate::ReqResult;
use crate::error::{BoxError, Error};

/// An HTTP proxy with the hosts that bypass it.
#[derive(Clone, Debug)]
pub(crate) struct ProxyConfig {
    uri: Uri,
    authorization: Option<HeaderValue>,
    no_proxy_rules: Vec<NoProxyRule>,
}

/// How a destination is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    Direct,
    /// `CONNECT` tunnel through the proxy, used for https targets.
    Tunnel,
    /// Plain http sent to the proxy in absolute form.
    Forward,
}

impl ProxyConfig {
    /// Only `http://` proxies are supported; the URL must carry a host.
    pub(crate) fn parse(
        proxy_url: &str,
        authorization: Option<HeaderValue>,
        no_proxy_rules: Vec<NoProxyRule>,
    ) -> ReqResult<Self> {
        let invalid = |message: &str| Error::InvalidProxyUrl {
            url: proxy_url.to_owned(),
            message: message.to_owned(),
        };
        let uri: Uri = proxy_url
            .trim()
            .parse()
            .map_err(|_| invalid("not a valid uri"))?;
        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
            Some(_) => return Err(invalid("only http:// proxies are supported")),
            None => return Err(invalid("missing scheme")),
        }
        if uri.host().is_none_or(str::is_empty) {
            return Err(invalid("missing host"));
        }
        Ok(Self {
            uri,
            authorization,
            no_proxy_rules,
        })
    }

    pub(crate) fn route(&self, destination: &Uri) -> Route {
        if bypasses_proxy(&self.no_proxy_rules, destination) {
            return Route::Direct;
        }
        match destination.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => Route::Tunnel,
            _ => Route::Forward,
        }
    }
}

/// One `NO_PROXY` entry: `*`, a domain suffix, or a host with a port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum NoProxyRule {
    Any,
    Domain { host: String, port: Option<u16> },
}

impl NoProxyRule {
    pub(crate) fn parse(text: &str) -> ReqResult<Self> {
        Self::parse_inner(text).ok_or_else(|| Error::InvalidNoProxyRule {
            rule: text.to_owned(),
        })
    }

    fn parse_inner(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed == "*" {
            return Some(Self::Any);
        }

        let (mut host, mut port) = match Url::parse(trimmed) {
            Ok(url) if url.host_str().is_some() => {
                (url.host_str().unwrap_or_default().to_owned(), url.port())
            }
            _ => (trimmed.to_owned(), None),
        };
        host = host.trim_start_matches('.').to_owned();

        if let Some(bracketed) = host.strip_prefix('[') {
            let (inner, rest) = bracketed.split_once(']')?;
            port = match rest {
                "" => port,
                _ => Some(rest.strip_prefix(':')?.parse().ok()?),
            };
            host = inner.to_owned();
        } else if host.matches(':').count() == 1 {
            let (name, raw_port) = host.rsplit_once(':')?;
            port = Some(raw_port.parse().ok()?);
            host = name.to_owned();
        }

        if host.is_empty() {
            return None;
        }
        Some(Self::Domain {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    fn matches(&self, host: &str, port: Option<u16>) -> bool {
        let Self::Domain {
            host: domain,
            port: rule_port,
        } = self
        else {
            return true;
        };
        let host_matches = host == domain
            || host
                .strip_suffix(domain.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'));
        host_matches && rule_port.is_none_or(|rule_port| port == Some(rule_port))
    }
}

pub(crate) fn parse_no_proxy_rules<I, S>(rules: I) -> ReqResult<Vec<NoProxyRule>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    rules
        .into_iter()
        .map(|rule| NoProxyRule::parse(rule.as_ref()))
        .collect()
}

fn default_port(uri: &Uri) -> Option<u16> {
    match uri.scheme_str()? {
        scheme if scheme.eq_ignore_ascii_case("https") => Some(443),
        scheme if scheme.eq_ignore_ascii_case("http") => Some(80),
        _ => None,
    }
}

fn bypasses_proxy(rules: &[NoProxyRule], uri: &Uri) -> bool {
    let Some(host) = uri.host() else {
        return false;
    };
    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    let port = uri.port_u16().or_else(|| default_port(uri));
    rules.iter().any(|rule| rule.matches(&host, port))
}

/// `CONNECT` needs an explicit port in the authority.
fn tunnel_target(destination: Uri) -> Uri {
    if destination.port().is_some() {
        return destination;
    }
    let (Some(port), Some(host)) = (default_port(&destination), destination.host()) else {
        return destination;
    };
    let authority = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let Ok(authority) = authority.parse() else {
        return destination;
    };
    let original = destination.clone();
    let mut parts = destination.into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(original)
}

/// Connection that reports whether it talks to a forwarding proxy, so hyper
/// writes absolute-form request targets.
#[derive(Debug)]
pub(crate) struct ProxyConnection<T> {
    inner: T,
    forwarding: bool,
}

impl<T> HyperRead for ProxyConnection<T>
where
    T: HyperRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T> HyperWrite for ProxyConnection<T>
where
    T: HyperWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }
}

impl<T> Connection for ProxyConnection<T>
where
    T: Connection,
{
    fn connected(&self) -> Connected {
        self.inner.connected().proxy(self.forwarding)
    }
}

#[derive(Clone)]
struct ProxyRuntime {
    config: ProxyConfig,
    tunnel: Tunnel<HttpConnector>,
}

/// TCP connector that routes through an optional HTTP proxy.
#[derive(Clone)]
pub(crate) struct ProxyConnector {
    direct: HttpConnector,
    proxy: Option<ProxyRuntime>,
}

type Connecting = Pin<
    Box<
        dyn Future<
                Output = Result<
                    ProxyConnection<<HttpConnector as Service<Uri>>::Response>,
                    BoxError,
                >,
            > + Send,
    >,
>;

impl ProxyConnector {
    pub(crate) fn new(proxy: Option<ProxyConfig>, connect_timeout: Duration) -> Self {
        let mut direct = HttpConnector::new();
        direct.enforce_http(false);
        direct.set_nodelay(true);
        direct.set_connect_timeout(Some(connect_timeout));
        let proxy = proxy.map(|config| {
            let mut tunnel = Tunnel::new(config.uri.clone(), direct.clone());
            if let Some(authorization) = config.authorization.clone() {
                tunnel = tunnel.with_auth(authorization);
            }
            ProxyRuntime { config, tunnel }
        });
        Self { direct, proxy }
    }
}

fn wrap<F, T, E>(connecting: F, forwarding: bool) -> Connecting
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Into<<HttpConnector as Service<Uri>>::Response>,
    E: Into<BoxError>,
{
    Box::pin(async move {
        connecting
            .await
            .map(|connection| ProxyConnection {
                inner: connection.into(),
                forwarding,
            })
            .map_err(Into::into)
    })
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyConnection<<HttpConnector as Service<Uri>>::Response>;
    type Error = BoxError;
    type Future = Connecting;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let direct = self.direct.poll_ready(cx).map_err(BoxError::from)?;
        let tunnel = match &mut self.proxy {
            Some(proxy) => proxy.tunnel.poll_ready(cx).map_err(BoxError::from)?,
            None => Poll::Ready(()),
        };
        match (direct, tunnel) {
            (Poll::Ready(()), Poll::Ready(())) => Poll::Ready(Ok(())),
            _ => Poll::Pending,
        }
    }

    fn call(&mut self, destination: Uri) -> Self::Future {
        let Some(proxy) = &mut self.proxy else {
            return wrap(self.direct.call(destination), false);
        };
        match proxy.config.route(&destination) {
            Route::Direct => wrap(self.direct.call(destination), false),
            Route::Tunnel => wrap(proxy.tunnel.call(tunnel_target(destination)), false),
            Route::Forward => wrap(self.direct.call(proxy.config.uri.clone()), true),
        }
    }
}

#[cfg(test)]
mod tests {
    use http::Uri;

    use super::{NoProxyRule, ProxyConfig, Route, parse_no_proxy_rules, tunnel_target};
    use crate::error::Error;

    fn uri(text: &str) -> Uri {
        text.parse().expect("valid uri")
    }

    #[test]
    fn parses_no_proxy_rule_shapes() {
        assert_eq!(NoProxyRule::parse("*").expect("any"), NoProxyRule::Any);
        assert_eq!(
            NoProxyRule::parse(".Example.com").expect("domain"),
            NoProxyRule::Domain {
                host: "example.com".to_owned(),
                port: None
            }
        );
        assert_eq!(
            NoProxyRule::parse("internal:8080").expect("host and port"),
            NoProxyRule::Domain {
                host: "internal".to_owned(),
                port: Some(8080)
            }
        );
        assert_eq!(
            NoProxyRule::parse("[::1]:9000").expect("ipv6"),
            NoProxyRule::Domain {
                host: "::1".to_owned(),
                port: Some(9000)
            }
        );
        assert!(matches!(
            NoProxyRule::parse("host:notaport"),
            Err(Error::InvalidNoProxyRule { .. })
        ));
        assert!(NoProxyRule::parse("  ").is_err());
    }

    #[test]
    fn routes_by_scheme_and_bypass_rules() {
        let rules = parse_no_proxy_rules(["example.com", "local:8080"]).expect("rules");
        let proxy = ProxyConfig::parse("http://proxy.internal:3128", None, rules).expect("proxy");

        assert_eq!(proxy.route(&uri("http://api.example.com/x")), Route::Direct);
        assert_eq!(proxy.route(&uri("https://notexample.com/")), Route::Tunnel);
        assert_eq!(proxy.route(&uri("http://local:8080/")), Route::Direct);
        assert_eq!(proxy.route(&uri("http://local:9090/")), Route::Forward);
    }

    #[test]
    fn rejects_non_http_proxy_urls() {
        assert!(matches!(
            ProxyConfig::parse("socks5://proxy:1080", None, Vec::new()),
            Err(Error::InvalidProxyUrl { .. })
        ));
        assert!(ProxyConfig::parse("proxy:1080", None, Vec::new()).is_err());
    }

    #[test]
    fn tunnel_target_gets_default_port() {
        assert_eq!(
            tunnel_target(uri("https://example.com/path")).authority().map(|a| a.as_str()),
            Some("example.com:443")
        );
        assert_eq!(
            tunnel_target(uri("https://example.com:8443/")).authority().map(|a| a.as_str()),
            Some("example.com:8443")
        );
    }
}
