//! Session cookie storage shared by every request of a client.

use std::sync::Mutex;

use cookie::Cookie;
use cookie::time::{Duration as CookieDuration, OffsetDateTime};
use http::HeaderMap;
use http::header::SET_COOKIE;
use tracing::{debug, warn};
use url::Url;

use crate::util::lock_unpoisoned;

/// Storage for cookies received from servers. Implementations must be safe
/// to share between concurrent requests.
pub trait CookieStore: Send + Sync {
    /// Stores cookies that `url` set.
    fn set_cookies(&self, url: &Url, cookies: Vec<Cookie<'static>>);

    /// Cookies that should be sent to `url`.
    fn cookies(&self, url: &Url) -> Vec<Cookie<'static>>;
}

#[derive(Clone, Debug)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    path: String,
    secure: bool,
    expires_at: Option<OffsetDateTime>,
}

impl StoredCookie {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn matches(&self, url: &Url, host: &str, now: OffsetDateTime) -> bool {
        if self.is_expired(now) {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_match(host, &self.domain)
        };
        domain_ok && path_match(url.path(), &self.path)
    }
}

/// In-memory cookie jar with domain, path, secure and expiry matching.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        lock_unpoisoned(&self.cookies)
            .iter()
            .filter(|cookie| !cookie.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.cookies).clear();
    }
}

impl CookieStore for CookieJar {
    fn set_cookies(&self, url: &Url, cookies: Vec<Cookie<'static>>) {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return;
        };
        let now = OffsetDateTime::now_utc();
        let mut stored = lock_unpoisoned(&self.cookies);
        stored.retain(|cookie| !cookie.is_expired(now));

        for cookie in cookies {
            let (domain, host_only) = match cookie
                .domain()
                .map(|domain| domain.trim_start_matches('.').to_ascii_lowercase())
                .filter(|domain| !domain.is_empty())
            {
                Some(domain) if domain_match(&host, &domain) => (domain, false),
                Some(domain) => {
                    debug!(cookie = cookie.name(), domain = %domain, host = %host, "rejecting cookie for foreign domain");
                    continue;
                }
                None => (host.clone(), true),
            };
            let path = match cookie.path() {
                Some(path) if path.starts_with('/') => path.to_owned(),
                _ => default_path(url.path()),
            };
            let expires_at = match cookie.max_age() {
                Some(max_age) if max_age <= CookieDuration::ZERO => Some(now),
                Some(max_age) => Some(now + max_age),
                None => cookie.expires_datetime(),
            };

            let entry = StoredCookie {
                name: cookie.name().to_owned(),
                value: cookie.value().to_owned(),
                domain,
                host_only,
                path,
                secure: cookie.secure().unwrap_or(false),
                expires_at,
            };
            stored.retain(|existing| {
                !(existing.name == entry.name
                    && existing.domain == entry.domain
                    && existing.path == entry.path)
            });
            if !entry.is_expired(now) {
                stored.push(entry);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Vec<Cookie<'static>> {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return Vec::new();
        };
        let now = OffsetDateTime::now_utc();
        let stored = lock_unpoisoned(&self.cookies);
        let mut matched: Vec<&StoredCookie> = stored
            .iter()
            .filter(|cookie| cookie.matches(url, &host, now))
            .collect();
        matched.sort_by(|left, right| right.path.len().cmp(&left.path.len()));
        matched
            .into_iter()
            .map(|cookie| Cookie::new(cookie.name.clone(), cookie.value.clone()))
            .collect()
    }
}

/// Parses every `Set-Cookie` header, skipping malformed ones.
pub(crate) fn parse_set_cookie_headers(headers: &HeaderMap) -> Vec<Cookie<'static>> {
    let mut parsed = Vec::new();
    for value in headers.get_all(SET_COOKIE) {
        match value.to_str() {
            Ok(text) => match Cookie::parse_encoded(text) {
                Ok(cookie) => parsed.push(cookie.into_owned()),
                Err(error) => warn!(header_value = %text, error = %error, "failed to parse Set-Cookie header"),
            },
            Err(_) => warn!(header_value = ?value, "invalid Set-Cookie header (non-UTF8)"),
        }
    }
    parsed
}

/// Renders cookies as a single `Cookie` header value.
pub(crate) fn cookie_header_pairs(cookies: &[Cookie<'static>]) -> String {
    cookies
        .iter()
        .map(|cookie| format!("{}={}", cookie.name(), cookie.value()))
        .collect::<Vec<_>>()
        .join("; ")
}

fn domain_match(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    host.parse::<std::net::IpAddr>().is_err()
        && host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_owned();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => request_path[..index].to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use cookie::Cookie;
    use http::HeaderMap;
    use http::header::{HeaderValue, SET_COOKIE};
    use url::Url;

    use super::{CookieJar, CookieStore, cookie_header_pairs, default_path, parse_set_cookie_headers};

    fn url(text: &str) -> Url {
        Url::parse(text).expect("valid url")
    }

    fn parsed(text: &str) -> Cookie<'static> {
        Cookie::parse(text.to_owned()).expect("valid cookie")
    }

    #[test]
    fn host_only_cookie_stays_on_its_host() {
        let jar = CookieJar::new();
        jar.set_cookies(&url("http://example.com/login"), vec![parsed("sid=1")]);

        assert_eq!(jar.cookies(&url("http://example.com/")).len(), 1);
        assert!(jar.cookies(&url("http://api.example.com/")).is_empty());
    }

    #[test]
    fn domain_cookie_reaches_subdomains_only() {
        let jar = CookieJar::new();
        jar.set_cookies(
            &url("http://www.example.com/"),
            vec![parsed("a=1; Domain=.example.com"), parsed("b=2; Domain=other.org")],
        );

        let sent = jar.cookies(&url("http://api.example.com/x"));
        assert_eq!(cookie_header_pairs(&sent), "a=1");
        assert!(jar.cookies(&url("http://notexample.com/")).is_empty());
        assert_eq!(jar.len(), 1);
    }

    #[test]
    fn path_and_secure_are_honoured() {
        let jar = CookieJar::new();
        jar.set_cookies(
            &url("https://example.com/"),
            vec![parsed("p=1; Path=/api"), parsed("s=2; Secure")],
        );

        assert_eq!(cookie_header_pairs(&jar.cookies(&url("https://example.com/api/v1"))), "p=1; s=2");
        assert!(jar.cookies(&url("https://example.com/apix")).iter().all(|c| c.name() != "p"));
        assert!(jar.cookies(&url("http://example.com/")).is_empty());
    }

    #[test]
    fn max_age_zero_removes_cookie() {
        let jar = CookieJar::new();
        let site = url("http://example.com/");
        jar.set_cookies(&site, vec![parsed("sid=1")]);
        jar.set_cookies(&site, vec![parsed("sid=1; Max-Age=0")]);
        assert!(jar.cookies(&site).is_empty());
    }

    #[test]
    fn newer_cookie_replaces_older_one() {
        let jar = CookieJar::new();
        let site = url("http://example.com/");
        jar.set_cookies(&site, vec![parsed("sid=1")]);
        jar.set_cookies(&site, vec![parsed("sid=2")]);
        assert_eq!(cookie_header_pairs(&jar.cookies(&site)), "sid=2");
    }

    #[test]
    fn default_path_is_directory_of_request_path() {
        assert_eq!(default_path("/a/b/c"), "/a/b");
        assert_eq!(default_path("/a"), "/");
        assert_eq!(default_path(""), "/");
    }

    #[test]
    fn malformed_set_cookie_headers_are_skipped() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("ok=1; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("=novalue"));
        let cookies = parse_set_cookie_headers(&headers);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name(), "ok");
    }
}
