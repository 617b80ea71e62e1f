use std::time::Duration;

use http::Method;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Which cancellation source fired first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fired {
    Cancelled,
    DeadlineExceeded(Duration),
}

impl Fired {
    pub(crate) fn into_error(self, method: &Method, uri: &str) -> Error {
        match self {
            Self::Cancelled => Error::Cancelled {
                method: method.clone(),
                uri: uri.to_owned(),
            },
            Self::DeadlineExceeded(timeout) => Error::DeadlineExceeded {
                timeout_ms: timeout.as_millis(),
                method: method.clone(),
                uri: uri.to_owned(),
            },
        }
    }
}

/// Caller-supplied token plus an optional deadline, shared by every await
/// point of one request: transport dispatch, backoff waits, body reads and the
/// multipart producer.
#[derive(Clone, Debug, Default)]
pub(crate) struct Cancellation {
    token: Option<CancellationToken>,
    deadline: Option<(Instant, Duration)>,
}

impl Cancellation {
    /// The deadline starts counting when the request is sent.
    pub(crate) fn start(token: Option<CancellationToken>, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.map(|timeout| (Instant::now() + timeout, timeout)),
        }
    }

    pub(crate) fn check(&self) -> Option<Fired> {
        if self
            .token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Some(Fired::Cancelled);
        }
        match self.deadline {
            Some((at, timeout)) if Instant::now() >= at => Some(Fired::DeadlineExceeded(timeout)),
            _ => None,
        }
    }

    /// Resolves once either source fires; pending forever when neither is set.
    pub(crate) async fn fired(&self) -> Fired {
        match (&self.token, self.deadline) {
            (Some(token), Some((at, timeout))) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Fired::Cancelled,
                    _ = sleep_until(at) => Fired::DeadlineExceeded(timeout),
                }
            }
            (Some(token), None) => {
                token.cancelled().await;
                Fired::Cancelled
            }
            (None, Some((at, timeout))) => {
                sleep_until(at).await;
                Fired::DeadlineExceeded(timeout)
            }
            (None, None) => std::future::pending().await,
        }
    }
}
