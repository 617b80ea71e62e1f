use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use cookie::Cookie;
use encoding_rs::Encoding;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Version};
use serde::de::DeserializeOwned;
use tokio::time::timeout;
use url::Url;

use crate::ReqResult;
use crate::body::{ReadBodyError, ResBody, read_all_body_limited};
use crate::cancel::Cancellation;
use crate::content_encoding::{
    DecodeContentEncodingError, decode_body_limited, parse_content_codings,
    should_decode_content_encoded_body,
};
use crate::cookie::parse_set_cookie_headers;
use crate::error::{Error, TimeoutPhase};
use crate::util::{redact_url_for_logs, truncate_body};

enum BodyState {
    Pending(ResBody),
    Cached(Bytes),
    Failed,
}

/// Limits applied when the body is read.
#[derive(Clone, Debug)]
pub(crate) struct BodyLimits {
    pub(crate) max_bytes: usize,
    pub(crate) read_timeout: Option<Duration>,
}

/// A received response whose body is read lazily and cached.
///
/// The first decode call (`content`, `text`, `json`, `xml`, `save`) reads the
/// whole body, undoes any `Content-Encoding` and caches the result; every
/// later call decodes the same cached bytes. Decoding ignores the terminal
/// error set by hooks and status assertions; use [`Response::into_result`]
/// to gate on it.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    method: Method,
    url: Url,
    uri: String,
    content_encoding: Option<HeaderValue>,
    body: BodyState,
    error: Option<Error>,
    cancellation: Cancellation,
    limits: BodyLimits,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            BodyState::Pending(_) => "pending".to_owned(),
            BodyState::Cached(bytes) => format!("cached({} bytes)", bytes.len()),
            BodyState::Failed => "failed".to_owned(),
        };
        formatter
            .debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("body", &body)
            .field("error", &self.error)
            .finish()
    }
}

impl Response {
    pub(crate) fn new(
        response: http::Response<ResBody>,
        method: Method,
        url: Url,
        cancellation: Cancellation,
        limits: BodyLimits,
    ) -> Self {
        let (parts, body) = response.into_parts();
        let mut headers = parts.headers;
        let content_encoding =
            if should_decode_content_encoded_body(&method, parts.status, &headers) {
                headers.remove(CONTENT_LENGTH);
                headers.remove(CONTENT_ENCODING)
            } else {
                None
            };

        Self {
            status: parts.status,
            version: parts.version,
            headers,
            uri: redact_url_for_logs(&url),
            method,
            url,
            content_encoding,
            body: BodyState::Pending(body),
            error: None,
            cancellation,
            limits,
        }
    }

    /// A response with an already buffered body, for tests and custom transports.
    pub fn from_parts(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>, url: Url) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            uri: redact_url_for_logs(&url),
            method: Method::GET,
            url,
            content_encoding: None,
            body: BodyState::Cached(body.into()),
            error: None,
            cancellation: Cancellation::default(),
            limits: BodyLimits {
                max_bytes: usize::MAX,
                read_timeout: None,
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The final URL, after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Body length when known: the cached length once read, otherwise the
    /// declared `Content-Length` of an unencoded body.
    pub fn content_length(&self) -> Option<u64> {
        if let BodyState::Cached(bytes) = &self.body {
            return Some(bytes.len() as u64);
        }
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    pub(crate) fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    /// `Err` with the terminal error when a hook or status assertion flagged
    /// the response.
    pub fn into_result(mut self) -> ReqResult<Self> {
        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }

    fn status_error(&self, expected: String) -> Error {
        Error::HttpStatus {
            expected,
            status: self.status.as_u16(),
            method: self.method.clone(),
            uri: self.uri.clone(),
        }
    }

    pub fn check_status(&self, code: u16) -> ReqResult<()> {
        if self.status.as_u16() == code {
            return Ok(());
        }
        Err(self.status_error(code.to_string()))
    }

    pub fn check_status_ok(&self) -> ReqResult<()> {
        self.check_status(StatusCode::OK.as_u16())
    }

    pub fn check_status_2xx(&self) -> ReqResult<()> {
        if self.status.is_success() {
            return Ok(());
        }
        Err(self.status_error("2xx".to_owned()))
    }

    fn keep_first_error(&mut self, result: ReqResult<()>) -> &mut Self {
        if let Err(error) = result
            && self.error.is_none()
        {
            self.error = Some(error);
        }
        self
    }

    /// Records an `HttpStatus` error unless the status is `code`. The body is
    /// left untouched.
    pub fn ensure_status(&mut self, code: u16) -> &mut Self {
        let result = self.check_status(code);
        self.keep_first_error(result)
    }

    pub fn ensure_status_ok(&mut self) -> &mut Self {
        let result = self.check_status_ok();
        self.keep_first_error(result)
    }

    pub fn ensure_status_2xx(&mut self) -> &mut Self {
        let result = self.check_status_2xx();
        self.keep_first_error(result)
    }

    /// All cookies set by this response.
    pub fn cookies(&self) -> ReqResult<Vec<Cookie<'static>>> {
        let cookies = parse_set_cookie_headers(&self.headers);
        if cookies.is_empty() {
            return Err(Error::NoCookie { name: None });
        }
        Ok(cookies)
    }

    pub fn cookie(&self, name: &str) -> ReqResult<Cookie<'static>> {
        parse_set_cookie_headers(&self.headers)
            .into_iter()
            .find(|cookie| cookie.name() == name)
            .ok_or_else(|| Error::NoCookie {
                name: Some(name.to_owned()),
            })
    }

    /// The decoded body, read from the network on the first call only.
    pub async fn content(&mut self) -> ReqResult<Bytes> {
        match std::mem::replace(&mut self.body, BodyState::Failed) {
            BodyState::Cached(bytes) => {
                self.body = BodyState::Cached(bytes.clone());
                Ok(bytes)
            }
            BodyState::Failed => Err(Error::BodyUnavailable {
                method: self.method.clone(),
                uri: self.uri.clone(),
            }),
            BodyState::Pending(body) => {
                let bytes = self.read_body(body).await?;
                self.body = BodyState::Cached(bytes.clone());
                Ok(bytes)
            }
        }
    }

    async fn read_body(&self, body: ResBody) -> ReqResult<Bytes> {
        let max_bytes = self.limits.max_bytes;
        let read = async {
            let reading = read_all_body_limited(body, max_bytes);
            match self.limits.read_timeout {
                Some(limit) => timeout(limit, reading).await.map_err(|_| Error::Timeout {
                    phase: TimeoutPhase::ResponseBody,
                    timeout_ms: limit.as_millis(),
                    method: self.method.clone(),
                    uri: self.uri.clone(),
                }),
                None => Ok(reading.await),
            }
        };

        let raw = tokio::select! {
            biased;
            fired = self.cancellation.fired() => {
                return Err(fired.into_error(&self.method, &self.uri));
            }
            result = read => result?,
        };
        let raw = raw.map_err(|error| match error {
            ReadBodyError::Read(source) => Error::ReadBody {
                method: self.method.clone(),
                uri: self.uri.clone(),
                source,
            },
            ReadBodyError::TooLarge { actual_bytes } => self.too_large(actual_bytes),
        })?;

        let Some(content_encoding) = &self.content_encoding else {
            return Ok(raw);
        };
        parse_content_codings(content_encoding)
            .and_then(|codings| decode_body_limited(raw, &codings, max_bytes))
            .map_err(|error| match error {
                DecodeContentEncodingError::Decode { encoding, message } => {
                    Error::DecodeContentEncoding {
                        encoding,
                        method: self.method.clone(),
                        uri: self.uri.clone(),
                        message,
                    }
                }
                DecodeContentEncodingError::TooLarge { actual_bytes } => {
                    self.too_large(actual_bytes)
                }
            })
    }

    fn too_large(&self, actual_bytes: usize) -> Error {
        Error::ResponseBodyTooLarge {
            limit_bytes: self.limits.max_bytes,
            actual_bytes,
            method: self.method.clone(),
            uri: self.uri.clone(),
        }
    }

    fn charset(&self) -> Option<&'static Encoding> {
        let content_type = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        content_type.split(';').skip(1).find_map(|parameter| {
            let (name, value) = parameter.split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("charset") {
                return None;
            }
            Encoding::for_label(value.trim().trim_matches('"').as_bytes())
        })
    }

    /// Body as text, decoded with the `Content-Type` charset or lossy UTF-8.
    pub async fn text(&mut self) -> ReqResult<String> {
        let bytes = self.content().await?;
        Ok(match self.charset() {
            Some(encoding) => encoding.decode(&bytes).0.into_owned(),
            None => String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    pub async fn text_with_encoding(&mut self, encoding: &'static Encoding) -> ReqResult<String> {
        let bytes = self.content().await?;
        Ok(encoding.decode(&bytes).0.into_owned())
    }

    /// Deserializes the body as JSON. The first decode call performs the
    /// single body read and fills the cache, so a later [`Response::content`]
    /// returns the full bytes without touching the network again.
    pub async fn json<T>(&mut self) -> ReqResult<T>
    where
        T: DeserializeOwned,
    {
        let bytes = self.content().await?;
        serde_json::from_slice(&bytes).map_err(|source| Error::DeserializeJson {
            source,
            body: truncate_body(&bytes),
        })
    }

    /// Same caching contract as [`Response::json`].
    pub async fn xml<T>(&mut self) -> ReqResult<T>
    where
        T: DeserializeOwned,
    {
        let bytes = self.content().await?;
        quick_xml::de::from_reader(bytes.as_ref()).map_err(|source| Error::DeserializeXml {
            source,
            body: truncate_body(&bytes),
        })
    }

    /// Writes the decoded body to `path`.
    pub async fn save(&mut self, path: impl AsRef<Path>) -> ReqResult<()> {
        let bytes = self.content().await?;
        tokio::fs::write(path, &bytes)
            .await
            .map_err(|source| Error::Io {
                op: "write response body",
                source,
            })
    }

    /// Status line and headers with each line prefixed by `< `, followed by
    /// the body when `with_body` is set.
    pub async fn dump(&mut self, with_body: bool) -> ReqResult<String> {
        let mut dump = String::new();
        let _ = writeln!(dump, "< {:?} {}", self.version, self.status);
        for (name, value) in &self.headers {
            let _ = writeln!(dump, "< {name}: {}", String::from_utf8_lossy(value.as_bytes()));
        }
        dump.push_str("<\n");
        if with_body {
            let bytes = self.content().await?;
            for line in String::from_utf8_lossy(&bytes).lines() {
                let _ = writeln!(dump, "< {line}");
            }
        }
        Ok(dump)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::Bytes;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, SET_COOKIE};
    use http::{HeaderMap, Method, StatusCode};
    use http_body_util::{BodyExt, Full};
    use serde::Deserialize;
    use url::Url;

    use super::{BodyLimits, Response};
    use crate::cancel::Cancellation;
    use crate::error::{BoxError, Error, ErrorClass};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
        name: String,
    }

    fn streaming(status: u16, headers: &[(&'static str, &'static str)], body: Vec<u8>) -> Response {
        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = Full::new(Bytes::from(body))
            .map_err(|never| -> BoxError { match never {} })
            .boxed();
        Response::new(
            builder.body(body).expect("valid response"),
            Method::GET,
            Url::parse("http://example.com/items?token=secret").expect("valid url"),
            Cancellation::default(),
            BodyLimits {
                max_bytes: 1024,
                read_timeout: None,
            },
        )
    }

    #[tokio::test]
    async fn content_is_cached_for_later_decodes() {
        let mut response = streaming(200, &[], br#"{"id":7,"name":"seven"}"#.to_vec());
        let first = response.content().await.expect("read body");
        let item: Item = response.json().await.expect("decode cached body");
        let again = response.content().await.expect("cached body");

        assert_eq!(first, again);
        assert_eq!(item, Item { id: 7, name: "seven".to_owned() });
        assert_eq!(response.content_length(), Some(first.len() as u64));
    }

    #[tokio::test]
    async fn gzip_body_is_decoded_and_headers_dropped() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello gzip").expect("write gzip payload");
        let compressed = encoder.finish().expect("finish gzip payload");

        let mut response = streaming(200, &[("content-encoding", "gzip"), ("content-length", "30")], compressed);
        assert!(!response.headers().contains_key(CONTENT_ENCODING));
        assert!(!response.headers().contains_key(CONTENT_LENGTH));
        assert_eq!(response.text().await.expect("decode body"), "hello gzip");
    }

    #[tokio::test]
    async fn decode_failure_keeps_cached_bytes() {
        let mut response = streaming(200, &[], b"<Item><id>1</id><name>one</name></Item>".to_vec());
        let error = response
            .json::<Item>()
            .await
            .expect_err("xml is not json");
        assert_eq!(error.class(), ErrorClass::Decode);

        let item: Item = response.xml().await.expect("xml decodes from cache");
        assert_eq!(item, Item { id: 1, name: "one".to_owned() });
    }

    #[tokio::test]
    async fn charset_from_content_type_is_applied() {
        let mut response = streaming(200, &[("content-type", "text/plain; charset=ISO-8859-1")], vec![0x63, 0x61, 0x66, 0xe9]);
        assert_eq!(response.text().await.expect("decode text"), "café");
    }

    #[tokio::test]
    async fn oversized_body_fails_then_stays_unavailable() {
        let mut response = streaming(200, &[], vec![b'a'; 2048]);
        assert!(matches!(
            response.content().await,
            Err(Error::ResponseBodyTooLarge { actual_bytes, .. }) if actual_bytes > 1024
        ));
        assert!(matches!(response.content().await, Err(Error::BodyUnavailable { .. })));
    }

    #[tokio::test]
    async fn status_assertions_keep_body_readable() {
        let mut response = streaming(500, &[], b"boom".to_vec());
        response.ensure_status_2xx().ensure_status(404);

        match response.error() {
            Some(Error::HttpStatus { expected, status, uri, .. }) => {
                assert_eq!(expected, "2xx");
                assert_eq!(*status, 500);
                assert_eq!(uri, "http://example.com/items");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(response.content().await.expect("body still readable").as_ref(), b"boom");
        assert!(response.into_result().is_err());
    }

    #[test]
    fn cookies_fail_when_absent() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=abc; Path=/"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let url = Url::parse("http://example.com/").expect("valid url");
        let response = Response::from_parts(StatusCode::OK, headers, "", url.clone());

        assert_eq!(response.cookie("sid").expect("cookie present").value(), "abc");
        assert!(matches!(
            response.cookie("missing"),
            Err(Error::NoCookie { name: Some(ref name) }) if name == "missing"
        ));

        let bare = Response::from_parts(StatusCode::OK, HeaderMap::new(), "", url);
        assert!(matches!(bare.cookies(), Err(Error::NoCookie { name: None })));
    }

    #[tokio::test]
    async fn dump_prefixes_lines() {
        let mut response = streaming(200, &[("x-id", "1")], b"line one\nline two".to_vec());
        let dump = response.dump(true).await.expect("dump");
        assert_eq!(dump, "< HTTP/1.1 200 OK\n< x-id: 1\n<\n< line one\n< line two\n");
    }
}
