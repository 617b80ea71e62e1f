//! `reqwire` is an async HTTP client execution engine: composable request
//! building, retries with cancellable backoff, before/after interceptors and
//! a response whose body is read once and decoded many times.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqwire::hooks;
//! use reqwire::prelude::{Client, Request, RetryPolicy, StatusTrigger};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Song {
//!     id: u64,
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .client_name("music-sdk")
//!         .request_timeout(Duration::from_secs(10))
//!         .retry_policy(RetryPolicy::standard().trigger(StatusTrigger::default()))
//!         .interceptor(hooks::default_user_agent("music-sdk/1.0")?)
//!         .try_build()?;
//!
//!     let mut response = client
//!         .send(Request::get("https://api.example.com/song")?.query_pair("id", 42))
//!         .await?;
//!     response.ensure_status_2xx();
//!     let song: Song = response.json().await?;
//!     println!("{} {}", song.id, song.name);
//!     Ok(())
//! }
//! ```
//!
//! # Behaviour Notes
//!
//! - Buffered bodies (bytes, text, form, JSON, XML) are replayed on every
//!   retry; streamed and multipart bodies are sent once and never retried.
//! - Cancellation and the request deadline win over any in-flight result,
//!   including a backoff wait.
//! - `gzip`, `br`, `deflate` and `zstd` response bodies are decoded
//!   transparently.

mod body;
mod cancel;
mod client;
mod content_encoding;
mod cookie;
mod error;
mod interceptor;
mod multipart;
mod proxy;
mod request;
mod response;
mod retry;
mod tls;
mod transport;
mod util;
mod values;

pub use crate::body::{ReqBody, ResBody};
pub use crate::client::{
    Client, ClientBuilder, RedirectPolicy, default_client, init_default_client,
};
pub use crate::cookie::{CookieJar, CookieStore};
pub use crate::error::{Error, ErrorClass, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::interceptor::{AfterResponse, BeforeRequest, Interceptor, hooks};
pub use crate::multipart::{Multipart, Part};
pub use crate::request::{DEFAULT_USER_AGENT, Request};
pub use crate::response::Response;
pub use crate::retry::{
    Backoff, ExponentialBackoff, RetryAfterBackoff, RetryDecision, RetryPolicy, RetryTrigger,
    StatusTrigger, TransportErrorTrigger, exponential_backoff,
};
pub use crate::transport::{Transport, TransportError};
pub use crate::values::{Cookies, Form, Headers, IntoValues, Params, ToValue, Values};

pub use ::cookie::Cookie;
pub use tokio_util::sync::CancellationToken;

pub type ReqResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        CancellationToken, Client, ClientBuilder, Cookies, Error, ErrorClass, ErrorCode, Form,
        Headers, Interceptor, Multipart, Params, Part, RedirectPolicy, ReqResult, Request,
        Response, RetryDecision, RetryPolicy, StatusTrigger, TimeoutPhase, TransportErrorKind,
    };
}
