use std::error::Error as StdError;
use std::fmt::Write as _;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use futures_core::Stream;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, HeaderName, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use http::{HeaderMap, Method};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::ReqResult;
use crate::body::{ReqBody, buffered_req_body, empty_req_body, stream_req_body};
use crate::cancel::Cancellation;
use crate::error::Error;
use crate::multipart::{Multipart, MultipartUpload};
use crate::retry::RetryPolicy;
use crate::util::{
    append_cookie_header, header_map_from_values, parse_header_name, parse_header_value,
    parse_request_url, redact_url_for_logs, replace_headers, shell_quote,
};
use crate::values::{Cookies, Form, Headers, IntoValues, Params, Values};

pub const DEFAULT_USER_AGENT: &str = concat!("reqwire/", env!("CARGO_PKG_VERSION"));

const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";
const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_XML: &str = "application/xml";

pub(crate) enum BodySource {
    Buffered {
        bytes: Bytes,
        content_type: Option<String>,
    },
    Streaming(ReqBody),
    Multipart(Multipart),
}

impl BodySource {
    fn default_content_type(&self) -> Option<String> {
        match self {
            Self::Buffered { content_type, .. } => content_type.clone(),
            Self::Streaming(_) => None,
            Self::Multipart(multipart) => Some(multipart.content_type()),
        }
    }
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered {
                bytes,
                content_type,
            } => formatter
                .debug_struct("Buffered")
                .field("len", &bytes.len())
                .field("content_type", content_type)
                .finish(),
            Self::Streaming(_) => formatter.write_str("Streaming"),
            Self::Multipart(multipart) => formatter.debug_tuple("Multipart").field(multipart).finish(),
        }
    }
}

/// An outbound request assembled from builder calls and materialized only
/// when it is sent.
///
/// Every setter touches one concern. Values set here always beat defaults
/// applied later by client hooks, and headers set explicitly beat the
/// content type implied by a body setter.
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    host: Option<String>,
    headers: HeaderMap,
    query: Params,
    form: Form,
    cookies: Cookies,
    body: Option<BodySource>,
    cancellation: Option<CancellationToken>,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
}

impl Request {
    pub fn new(method: Method, url: &str) -> ReqResult<Self> {
        Ok(Self {
            method,
            url: parse_request_url(url)?,
            host: None,
            headers: HeaderMap::new(),
            query: Params::new(),
            form: Form::new(),
            cookies: Cookies::new(),
            body: None,
            cancellation: None,
            timeout: None,
            retry: None,
        })
    }

    pub fn get(url: &str) -> ReqResult<Self> {
        Self::new(Method::GET, url)
    }

    pub fn head(url: &str) -> ReqResult<Self> {
        Self::new(Method::HEAD, url)
    }

    pub fn post(url: &str) -> ReqResult<Self> {
        Self::new(Method::POST, url)
    }

    pub fn put(url: &str) -> ReqResult<Self> {
        Self::new(Method::PUT, url)
    }

    pub fn patch(url: &str) -> ReqResult<Self> {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: &str) -> ReqResult<Self> {
        Self::new(Method::DELETE, url)
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> ReqResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// Sets every header in `headers`, replacing existing values of those names.
    pub fn headers(mut self, headers: Headers) -> ReqResult<Self> {
        let parsed = header_map_from_values(&headers)?;
        replace_headers(&mut self.headers, parsed);
        Ok(self)
    }

    pub fn content_type(self, content_type: &str) -> ReqResult<Self> {
        self.try_header(CONTENT_TYPE.as_str(), content_type)
    }

    pub fn user_agent(self, user_agent: &str) -> ReqResult<Self> {
        self.try_header(USER_AGENT.as_str(), user_agent)
    }

    pub fn referer(self, referer: &str) -> ReqResult<Self> {
        self.try_header(REFERER.as_str(), referer)
    }

    pub fn origin(self, origin: &str) -> ReqResult<Self> {
        self.try_header(ORIGIN.as_str(), origin)
    }

    pub fn query(mut self, params: Params) -> Self {
        self.query.update(&params);
        self
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl IntoValues) -> Self {
        self.query.add(name, value);
        self
    }

    pub fn query_serde<T>(mut self, params: &T) -> ReqResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::SerializeQuery { source })?;
        self.query.update(&Values::from_query(&encoded));
        Ok(self)
    }

    /// Raw bytes; no content type is implied.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(BodySource::Buffered {
            bytes: body.into(),
            content_type: None,
        });
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = Some(BodySource::Buffered {
            bytes: Bytes::from(text.into()),
            content_type: Some(CONTENT_TYPE_TEXT.to_owned()),
        });
        self
    }

    /// A streamed body can be sent once. Requests carrying one are never
    /// retried or redirected.
    pub fn body_stream<S, E>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.body = Some(BodySource::Streaming(stream_req_body(stream)));
        self
    }

    pub fn body_reader<R>(self, reader: R) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        self.body_stream(ReaderStream::new(reader))
    }

    /// Form fields are merged into the request form; a non-empty form becomes
    /// the body when the request is sent.
    pub fn form(mut self, form: Form) -> Self {
        self.form.update(&form);
        self
    }

    pub fn form_serde<T>(mut self, payload: &T) -> ReqResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload)
            .map_err(|source| Error::SerializeForm { source })?;
        self.form.update(&Values::from_query(&encoded));
        Ok(self)
    }

    pub fn json<T>(self, payload: &T) -> ReqResult<Self>
    where
        T: Serialize + ?Sized,
    {
        self.json_with(payload, false)
    }

    /// With `escape_html`, `<`, `>` and `&` are written as `\u003c`,
    /// `\u003e` and `\u0026`.
    pub fn json_with<T>(mut self, payload: &T, escape_html: bool) -> ReqResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let mut encoded =
            serde_json::to_string(payload).map_err(|source| Error::SerializeJson { source })?;
        if escape_html {
            encoded = encoded
                .replace('<', "\\u003c")
                .replace('>', "\\u003e")
                .replace('&', "\\u0026");
        }
        self.body = Some(BodySource::Buffered {
            bytes: Bytes::from(encoded),
            content_type: Some(CONTENT_TYPE_JSON.to_owned()),
        });
        Ok(self)
    }

    pub fn xml<T>(mut self, payload: &T) -> ReqResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = quick_xml::se::to_string(payload).map_err(|error| Error::SerializeXml {
            message: error.to_string(),
        })?;
        self.body = Some(BodySource::Buffered {
            bytes: Bytes::from(encoded),
            content_type: Some(CONTENT_TYPE_XML.to_owned()),
        });
        Ok(self)
    }

    pub fn multipart(mut self, multipart: Multipart) -> Self {
        self.body = Some(BodySource::Multipart(multipart));
        self
    }

    pub fn cookies(mut self, cookies: Cookies) -> Self {
        self.cookies.update(&cookies);
        self
    }

    pub fn basic_auth(self, username: &str, password: &str) -> ReqResult<Self> {
        let token = BASE64_STANDARD.encode(format!("{username}:{password}"));
        self.authorization(&format!("Basic {token}"))
    }

    pub fn bearer_token(self, token: &str) -> ReqResult<Self> {
        self.authorization(&format!("Bearer {token}"))
    }

    fn authorization(self, credentials: &str) -> ReqResult<Self> {
        let mut value = parse_header_value(AUTHORIZATION.as_str(), credentials)?;
        value.set_sensitive(true);
        Ok(self.header(AUTHORIZATION, value))
    }

    /// Cancelling the token aborts the dispatch, any backoff wait, body reads
    /// and the multipart producer of this request.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Deadline for the whole exchange, retries and body reads included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Replaces the client's retry policy for this request.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers_ref(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn query_params(&self) -> &Params {
        &self.query
    }

    pub fn query_params_mut(&mut self) -> &mut Params {
        &mut self.query
    }

    pub fn form_values(&self) -> &Form {
        &self.form
    }

    pub fn form_mut(&mut self) -> &mut Form {
        &mut self.form
    }

    pub fn cookie_values(&self) -> &Cookies {
        &self.cookies
    }

    pub fn cookies_mut(&mut self) -> &mut Cookies {
        &mut self.cookies
    }

    pub fn host_override(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = Some(host.into());
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some() || !self.form.is_empty()
    }

    /// The content type the configured body implies, if any.
    pub fn body_content_type(&self) -> Option<String> {
        if !self.form.is_empty() {
            return Some(CONTENT_TYPE_FORM.to_owned());
        }
        self.body.as_ref().and_then(BodySource::default_content_type)
    }

    /// Whether the body can be sent again with identical bytes.
    pub fn is_replayable(&self) -> bool {
        !self.form.is_empty() || !matches!(self.body, Some(BodySource::Streaming(_) | BodySource::Multipart(_)))
    }

    pub(crate) fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    fn materialized_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.query.is_empty() {
            let mut merged = self.query.clone();
            merged.merge(&Values::from_query(url.query().unwrap_or_default()));
            url.set_query(Some(&merged.encode(true)));
        }
        url
    }

    fn materialized_headers(&self) -> ReqResult<HeaderMap> {
        let mut headers = self.headers.clone();
        if !headers.contains_key(CONTENT_TYPE)
            && let Some(content_type) = self.body_content_type()
        {
            headers.insert(
                CONTENT_TYPE,
                parse_header_value(CONTENT_TYPE.as_str(), &content_type)?,
            );
        }
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        }
        append_cookie_header(&mut headers, &self.cookies.header_value())?;
        if let Some(host) = &self.host {
            headers.insert(HOST, parse_header_value(HOST.as_str(), host)?);
        }
        Ok(headers)
    }

    fn buffered_preview(&self) -> Option<Bytes> {
        if !self.form.is_empty() {
            return Some(Bytes::from(self.form.encode(true)));
        }
        match &self.body {
            Some(BodySource::Buffered { bytes, .. }) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Fixes the wire form: merged and sorted query, form body, content type,
    /// default user agent, cookie header and host override.
    pub(crate) fn prepare(self) -> ReqResult<PreparedRequest> {
        let url = self.materialized_url();
        let headers = self.materialized_headers()?;
        let body = if !self.form.is_empty() {
            PreparedBody::Buffered(Bytes::from(self.form.encode(true)))
        } else {
            match self.body {
                None => PreparedBody::Empty,
                Some(BodySource::Buffered { bytes, .. }) => PreparedBody::Buffered(bytes),
                Some(BodySource::Streaming(body)) => PreparedBody::Streaming(Some(body)),
                Some(BodySource::Multipart(multipart)) => PreparedBody::Multipart(Some(multipart)),
            }
        };

        Ok(PreparedRequest {
            uri_for_logs: redact_url_for_logs(&url),
            method: self.method,
            url,
            headers,
            body,
            cancellation: Cancellation::start(self.cancellation, self.timeout),
            retry: self.retry,
        })
    }

    /// Renders the request roughly as it goes on the wire, one line per
    /// header, each prefixed with `> `. Streamed bodies are not read.
    pub fn dump(&self, with_body: bool) -> ReqResult<String> {
        let url = self.materialized_url();
        let headers = self.materialized_headers()?;
        let mut target = url.path().to_owned();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        let mut dump = String::new();
        let _ = writeln!(dump, "> {} {} HTTP/1.1", self.method, target);
        if !headers.contains_key(HOST)
            && let Some(host) = url.host_str()
        {
            match url.port() {
                Some(port) => {
                    let _ = writeln!(dump, "> Host: {host}:{port}");
                }
                None => {
                    let _ = writeln!(dump, "> Host: {host}");
                }
            }
        }
        for (name, value) in &headers {
            let value = if value.is_sensitive() {
                "<redacted>".into()
            } else {
                String::from_utf8_lossy(value.as_bytes())
            };
            let _ = writeln!(dump, "> {name}: {value}");
        }
        dump.push_str(">\n");

        if with_body {
            match self.buffered_preview() {
                Some(bytes) if !bytes.is_empty() => {
                    for line in String::from_utf8_lossy(&bytes).lines() {
                        let _ = writeln!(dump, "> {line}");
                    }
                }
                Some(_) => {}
                None if self.body.is_some() => {
                    dump.push_str("> <streamed body omitted>\n");
                }
                None => {}
            }
        }
        Ok(dump)
    }

    /// An equivalent `curl` command line. Streamed bodies are left out.
    pub fn to_curl(&self) -> ReqResult<String> {
        let url = self.materialized_url();
        let headers = self.materialized_headers()?;
        let mut command = format!("curl -X {} {}", self.method, shell_quote(url.as_str()));
        for (name, value) in &headers {
            let header = format!("{name}: {}", String::from_utf8_lossy(value.as_bytes()));
            let _ = write!(command, " -H {}", shell_quote(&header));
        }
        if let Some(bytes) = self.buffered_preview()
            && !bytes.is_empty()
        {
            let _ = write!(
                command,
                " --data-raw {}",
                shell_quote(&String::from_utf8_lossy(&bytes))
            );
        }
        if matches!(self.body, Some(BodySource::Multipart(_))) {
            command.push_str(" # multipart body omitted");
        }
        Ok(command)
    }
}

pub(crate) enum PreparedBody {
    Empty,
    Buffered(Bytes),
    Streaming(Option<ReqBody>),
    Multipart(Option<Multipart>),
}

pub(crate) struct PreparedRequest {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) uri_for_logs: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: PreparedBody,
    pub(crate) cancellation: Cancellation,
    pub(crate) retry: Option<RetryPolicy>,
}

/// Body handed to one dispatch, plus the producer feeding it when multipart.
pub(crate) struct AttemptBody {
    pub(crate) body: ReqBody,
    pub(crate) upload: Option<MultipartUpload>,
}

impl PreparedRequest {
    pub(crate) fn is_replayable(&self) -> bool {
        matches!(self.body, PreparedBody::Empty | PreparedBody::Buffered(_))
    }

    /// Produces the body for the next dispatch. `None` once a single-use body
    /// has been handed out.
    pub(crate) fn attempt_body(&mut self) -> Option<AttemptBody> {
        match &mut self.body {
            PreparedBody::Empty => Some(AttemptBody {
                body: empty_req_body(),
                upload: None,
            }),
            PreparedBody::Buffered(bytes) => Some(AttemptBody {
                body: buffered_req_body(bytes.clone()),
                upload: None,
            }),
            PreparedBody::Streaming(body) => body.take().map(|body| AttemptBody { body, upload: None }),
            PreparedBody::Multipart(multipart) => {
                let mut upload = multipart.take()?.start(self.cancellation.clone());
                let body = upload.take_body()?;
                Some(AttemptBody {
                    body,
                    upload: Some(upload),
                })
            }
        }
    }

    /// Switches to a bodiless request for a redirect that changes the method to GET.
    pub(crate) fn drop_body(&mut self) {
        self.body = PreparedBody::Empty;
    }
}

#[cfg(test)]
mod tests {
    use http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, HOST, USER_AGENT};
    use serde::Serialize;

    use super::{DEFAULT_USER_AGENT, PreparedBody, Request};
    use crate::error::Error;
    use crate::multipart::{Multipart, Part};
    use crate::values::{Cookies, Form, Params};

    #[derive(Serialize)]
    struct Payload {
        msg: &'static str,
    }

    #[test]
    fn rejects_unparsable_and_non_http_urls() {
        assert!(matches!(Request::get("::nope"), Err(Error::InvalidUrl { .. })));
        assert!(matches!(Request::get("ftp://example.com/a"), Err(Error::InvalidUrl { .. })));
    }

    #[test]
    fn url_query_is_kept_as_default_and_sorted() {
        let prepared = Request::get("http://example.com/get?b=url&z=1")
            .expect("valid url")
            .query(Params::from([("b", "req"), ("a", "x y")]))
            .prepare()
            .expect("prepare request");
        assert_eq!(prepared.url.query(), Some("a=x+y&b=req&z=1"));
    }

    #[test]
    fn url_without_extra_query_is_left_untouched() {
        let prepared = Request::get("http://example.com/get?z=1&a=2")
            .expect("valid url")
            .prepare()
            .expect("prepare request");
        assert_eq!(prepared.url.query(), Some("z=1&a=2"));
    }

    #[test]
    fn explicit_content_type_beats_body_default() {
        let request = Request::post("http://example.com/")
            .expect("valid url")
            .content_type("application/vnd.custom+json")
            .expect("content type")
            .json(&Payload { msg: "hi" })
            .expect("json body");
        let prepared = request.prepare().expect("prepare request");
        assert_eq!(prepared.headers[CONTENT_TYPE], "application/vnd.custom+json");
        assert!(matches!(prepared.body, PreparedBody::Buffered(ref bytes) if bytes.as_ref() == br#"{"msg":"hi"}"#));
    }

    #[test]
    fn form_supersedes_raw_body() {
        let prepared = Request::post("http://example.com/")
            .expect("valid url")
            .body("raw")
            .form(Form::from([("k", "v"), ("a", "1")]))
            .prepare()
            .expect("prepare request");
        assert_eq!(prepared.headers[CONTENT_TYPE], "application/x-www-form-urlencoded");
        assert!(matches!(prepared.body, PreparedBody::Buffered(ref bytes) if bytes.as_ref() == b"a=1&k=v"));
    }

    #[test]
    fn later_body_setter_replaces_earlier_one() {
        let prepared = Request::post("http://example.com/")
            .expect("valid url")
            .json(&Payload { msg: "first" })
            .expect("json body")
            .text("second")
            .prepare()
            .expect("prepare request");
        assert_eq!(prepared.headers[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert!(matches!(prepared.body, PreparedBody::Buffered(ref bytes) if bytes.as_ref() == b"second"));
    }

    #[test]
    fn json_with_escapes_html_characters() {
        let prepared = Request::post("http://example.com/")
            .expect("valid url")
            .json_with(&Payload { msg: "<a&b>" }, true)
            .expect("json body")
            .prepare()
            .expect("prepare request");
        assert!(matches!(
            prepared.body,
            PreparedBody::Buffered(ref bytes) if bytes.as_ref() == br#"{"msg":"\u003ca\u0026b\u003e"}"#
        ));
    }

    #[test]
    fn defaults_user_agent_and_appends_cookies() {
        let prepared = Request::get("http://example.com/")
            .expect("valid url")
            .try_header("cookie", "existing=1")
            .expect("cookie header")
            .cookies(Cookies::from([("b", "2"), ("a", "1")]))
            .host("virtual.example")
            .prepare()
            .expect("prepare request");
        assert_eq!(prepared.headers[USER_AGENT], DEFAULT_USER_AGENT);
        assert_eq!(prepared.headers[COOKIE], "existing=1; a=1; b=2");
        assert_eq!(prepared.headers[HOST], "virtual.example");
    }

    #[test]
    fn basic_auth_is_base64_and_sensitive() {
        let request = Request::get("http://example.com/")
            .expect("valid url")
            .basic_auth("user", "pass")
            .expect("basic auth");
        let value = &request.headers_ref()[AUTHORIZATION];
        assert_eq!(value, "Basic dXNlcjpwYXNz");
        assert!(value.is_sensitive());
        assert!(request.dump(false).expect("dump").contains("authorization: <redacted>"));
    }

    #[test]
    fn streamed_and_multipart_bodies_are_not_replayable() {
        let stream = futures_util::stream::iter([Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"x"))]);
        let streaming = Request::post("http://example.com/")
            .expect("valid url")
            .body_stream(stream);
        assert!(!streaming.is_replayable());

        let multipart = Multipart::new()
            .file("f", Part::bytes("a.txt", "a"))
            .expect("file part");
        let upload = Request::post("http://example.com/")
            .expect("valid url")
            .multipart(multipart);
        assert!(!upload.is_replayable());
        assert!(
            upload
                .body_content_type()
                .is_some_and(|value| value.starts_with("multipart/form-data; boundary="))
        );

        assert!(Request::post("http://example.com/").expect("valid url").body("x").is_replayable());
    }

    #[test]
    fn dump_and_curl_render_wire_form() {
        let request = Request::post("http://example.com:8080/submit")
            .expect("valid url")
            .query_pair("q", "1")
            .text("hello");
        let dump = request.dump(true).expect("dump");
        assert!(dump.starts_with("> POST /submit?q=1 HTTP/1.1\n> Host: example.com:8080\n"));
        assert!(dump.ends_with(">\n> hello\n"));

        let curl = request.to_curl().expect("curl");
        assert!(curl.starts_with("curl -X POST 'http://example.com:8080/submit?q=1'"));
        assert!(curl.ends_with("--data-raw 'hello'"));
    }
}
