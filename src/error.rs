use http::Method;
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Transport,
    ResponseBody,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Transport => "transport",
            Self::ResponseBody => "response_body",
        };
        formatter.write_str(text)
    }
}

/// Coarse failure taxonomy used by retry triggers and callers that only care
/// about where a failure came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorClass {
    /// Request construction failed before anything reached the network.
    Build,
    /// Client or TLS configuration was rejected.
    Config,
    /// Connection, TLS, DNS, timeout or protocol failure while exchanging.
    Transport,
    /// The caller's cancellation token or deadline fired.
    Cancellation,
    /// The response body could not be read or decoded into the requested shape.
    Decode,
    /// A status assertion failed.
    Status,
    /// A before-request or after-response hook rejected the exchange.
    Interceptor,
}

impl ErrorClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Config => "config",
            Self::Transport => "transport",
            Self::Cancellation => "cancellation",
            Self::Decode => "decode",
            Self::Status => "status",
            Self::Interceptor => "interceptor",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUrl,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    SerializeXml,
    SerializeForm,
    SerializeQuery,
    RequestBuild,
    MultipartDuplicateField,
    MultipartProducer,
    Transport,
    Timeout,
    Cancelled,
    DeadlineExceeded,
    ReadBody,
    ResponseBodyTooLarge,
    BodyUnavailable,
    DecodeContentEncoding,
    DeserializeJson,
    DeserializeXml,
    Io,
    HttpStatus,
    NoCookie,
    NoCookieJar,
    Hook,
    Config,
    InvalidProxyUrl,
    InvalidNoProxyRule,
    TlsBackendInit,
    TlsConfig,
    MissingRedirectLocation,
    InvalidRedirectLocation,
    RedirectLimitExceeded,
    RedirectBodyNotReplayable,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::SerializeXml => "serialize_xml",
            Self::SerializeForm => "serialize_form",
            Self::SerializeQuery => "serialize_query",
            Self::RequestBuild => "request_build",
            Self::MultipartDuplicateField => "multipart_duplicate_field",
            Self::MultipartProducer => "multipart_producer",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::BodyUnavailable => "body_unavailable",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::DeserializeJson => "deserialize_json",
            Self::DeserializeXml => "deserialize_xml",
            Self::Io => "io",
            Self::HttpStatus => "http_status",
            Self::NoCookie => "no_cookie",
            Self::NoCookieJar => "no_cookie_jar",
            Self::Hook => "hook",
            Self::Config => "config",
            Self::InvalidProxyUrl => "invalid_proxy_url",
            Self::InvalidNoProxyRule => "invalid_no_proxy_rule",
            Self::TlsBackendInit => "tls_backend_init",
            Self::TlsConfig => "tls_config",
            Self::MissingRedirectLocation => "missing_redirect_location",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::RedirectBodyNotReplayable => "redirect_body_not_replayable",
        }
    }

    pub const fn class(self) -> ErrorClass {
        match self {
            Self::InvalidUrl
            | Self::InvalidHeaderName
            | Self::InvalidHeaderValue
            | Self::SerializeJson
            | Self::SerializeXml
            | Self::SerializeForm
            | Self::SerializeQuery
            | Self::RequestBuild
            | Self::MultipartDuplicateField
            | Self::MultipartProducer => ErrorClass::Build,
            Self::Transport
            | Self::Timeout
            | Self::ReadBody
            | Self::MissingRedirectLocation
            | Self::InvalidRedirectLocation
            | Self::RedirectLimitExceeded
            | Self::RedirectBodyNotReplayable => ErrorClass::Transport,
            Self::Cancelled | Self::DeadlineExceeded => ErrorClass::Cancellation,
            Self::ResponseBodyTooLarge
            | Self::BodyUnavailable
            | Self::DecodeContentEncoding
            | Self::DeserializeJson
            | Self::DeserializeXml
            | Self::Io
            | Self::NoCookie => ErrorClass::Decode,
            Self::HttpStatus => ErrorClass::Status,
            Self::Hook => ErrorClass::Interceptor,
            Self::NoCookieJar
            | Self::Config
            | Self::InvalidProxyUrl
            | Self::InvalidNoProxyRule
            | Self::TlsBackendInit
            | Self::TlsConfig => ErrorClass::Config,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request url: {url}")]
    InvalidUrl { url: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request xml: {message}")]
    SerializeXml { message: String },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("multipart field {field} already carries a file")]
    MultipartDuplicateField { field: String },
    #[error("multipart producer failed on {field}=@{file_name}: {source}")]
    MultipartProducer {
        field: String,
        file_name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out in {phase} after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http request cancelled for {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("http request deadline exceeded after {timeout_ms}ms for {method} {uri}")]
    DeadlineExceeded {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("failed to read response body for {method} {uri}: {source}")]
    ReadBody {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("response body is unavailable after a failed read for {method} {uri}")]
    BodyUnavailable { method: Method, uri: String },
    #[error("failed to decode response content-encoding {encoding} for {method} {uri}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    DeserializeJson {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("failed to decode response xml: {source}; body={body}")]
    DeserializeXml {
        #[source]
        source: quick_xml::DeError,
        body: String,
    },
    #[error("io error while {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("http status {expected} expected but got {status} for {method} {uri}")]
    HttpStatus {
        expected: String,
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("no cookie named {}", .name.as_deref().unwrap_or("*"))]
    NoCookie { name: Option<String> },
    #[error("cookie jar is disabled for this client")]
    NoCookieJar,
    #[error("hook {name} rejected the exchange: {source}")]
    Hook {
        name: String,
        #[source]
        source: BoxError,
    },
    #[error("invalid client configuration: {message}")]
    Config { message: String },
    #[error("invalid proxy url {url}: {message}")]
    InvalidProxyUrl { url: String, message: String },
    #[error("invalid no_proxy rule: {rule}")]
    InvalidNoProxyRule { rule: String },
    #[error("failed to initialize tls backend: {message}")]
    TlsBackendInit { message: String },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error("redirect response {status} missing location header for {method} {uri}")]
    MissingRedirectLocation {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("cannot follow redirect for non-replayable request body: {method} {uri}")]
    RedirectBodyNotReplayable { method: Method, uri: String },
}

impl Error {
    /// Wraps a hook failure so it carries the hook's name.
    pub fn hook(
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Hook {
            name: name.into(),
            source: source.into(),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeXml { .. } => ErrorCode::SerializeXml,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::MultipartDuplicateField { .. } => ErrorCode::MultipartDuplicateField,
            Self::MultipartProducer { .. } => ErrorCode::MultipartProducer,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::BodyUnavailable { .. } => ErrorCode::BodyUnavailable,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::DeserializeJson { .. } => ErrorCode::DeserializeJson,
            Self::DeserializeXml { .. } => ErrorCode::DeserializeXml,
            Self::Io { .. } => ErrorCode::Io,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::NoCookie { .. } => ErrorCode::NoCookie,
            Self::NoCookieJar => ErrorCode::NoCookieJar,
            Self::Hook { .. } => ErrorCode::Hook,
            Self::Config { .. } => ErrorCode::Config,
            Self::InvalidProxyUrl { .. } => ErrorCode::InvalidProxyUrl,
            Self::InvalidNoProxyRule { .. } => ErrorCode::InvalidNoProxyRule,
            Self::TlsBackendInit { .. } => ErrorCode::TlsBackendInit,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
            Self::MissingRedirectLocation { .. } => ErrorCode::MissingRedirectLocation,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
            Self::RedirectBodyNotReplayable { .. } => ErrorCode::RedirectBodyNotReplayable,
        }
    }

    pub const fn class(&self) -> ErrorClass {
        self.code().class()
    }

    pub fn transport_error_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.class() == ErrorClass::Cancellation
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
