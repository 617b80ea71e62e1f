use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::{HeaderMap, Method, StatusCode};
use rand::RngExt;

use crate::error::{Error, ErrorClass, ErrorCode, TimeoutPhase, TransportErrorKind};
use crate::util::parse_retry_after;

const DEFAULT_MIN_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);
const STANDARD_MAX_ATTEMPTS: usize = 3;

/// Outcome of one attempt, as seen by triggers and backoff functions.
///
/// `status` and `headers` are present when a response arrived; the error
/// fields are present when the attempt failed before a response.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    /// Zero-based index of the attempt that just finished. The first retry
    /// waits for `backoff(.., 0, ..)`.
    pub attempt: usize,
    pub max_attempts: usize,
    pub method: Method,
    pub uri: String,
    pub status: Option<StatusCode>,
    pub headers: Option<HeaderMap>,
    pub error_code: Option<ErrorCode>,
    pub error_class: Option<ErrorClass>,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub timeout_phase: Option<TimeoutPhase>,
}

impl RetryDecision {
    pub(crate) fn for_response(
        attempt: usize,
        max_attempts: usize,
        method: &Method,
        uri: &str,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            method: method.clone(),
            uri: uri.to_owned(),
            status: Some(status),
            headers: Some(headers.clone()),
            error_code: None,
            error_class: None,
            transport_error_kind: None,
            timeout_phase: None,
        }
    }

    pub(crate) fn for_error(
        attempt: usize,
        max_attempts: usize,
        method: &Method,
        uri: &str,
        error: &Error,
    ) -> Self {
        let timeout_phase = match error {
            Error::Timeout { phase, .. } => Some(*phase),
            _ => None,
        };
        Self {
            attempt,
            max_attempts,
            method: method.clone(),
            uri: uri.to_owned(),
            status: None,
            headers: None,
            error_code: Some(error.code()),
            error_class: Some(error.class()),
            transport_error_kind: error.transport_error_kind(),
            timeout_phase,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }
}

/// Computes the wait before the next attempt.
pub trait Backoff: Send + Sync {
    fn delay(
        &self,
        min_wait: Duration,
        max_wait: Duration,
        attempt: usize,
        decision: &RetryDecision,
    ) -> Duration;
}

impl<F> Backoff for F
where
    F: Fn(Duration, Duration, usize, &RetryDecision) -> Duration + Send + Sync,
{
    fn delay(
        &self,
        min_wait: Duration,
        max_wait: Duration,
        attempt: usize,
        decision: &RetryDecision,
    ) -> Duration {
        self(min_wait, max_wait, attempt, decision)
    }
}

/// Decides whether an attempt should be retried.
pub trait RetryTrigger: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

impl<F> RetryTrigger for F
where
    F: Fn(&RetryDecision) -> bool + Send + Sync,
{
    fn should_retry(&self, decision: &RetryDecision) -> bool {
        self(decision)
    }
}

/// `min(max, min * 2^attempt)`, optionally halved plus a uniform random
/// amount in `[0, half)`. Never below `min_wait`.
pub fn exponential_backoff(
    min_wait: Duration,
    max_wait: Duration,
    attempt: usize,
    jitter: bool,
) -> Duration {
    let min_ms = min_wait.as_millis();
    let max_ms = max_wait.as_millis().max(min_ms);
    let exponent = attempt.min(63) as u32;
    let base_ms = min_ms
        .saturating_mul(1_u128 << exponent)
        .min(max_ms)
        .min(u64::MAX as u128) as u64;

    let delay_ms = if jitter {
        let half = base_ms / 2;
        if half == 0 {
            base_ms
        } else {
            let mut rng = rand::rng();
            half + rng.random_range(0..half)
        }
    } else {
        base_ms
    };

    Duration::from_millis(delay_ms).max(min_wait).min(max_wait.max(min_wait))
}

#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    jitter: bool,
}

impl ExponentialBackoff {
    pub const fn new(jitter: bool) -> Self {
        Self { jitter }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(
        &self,
        min_wait: Duration,
        max_wait: Duration,
        attempt: usize,
        _decision: &RetryDecision,
    ) -> Duration {
        exponential_backoff(min_wait, max_wait, attempt, self.jitter)
    }
}

/// Waits for the server's `Retry-After` when one is sent, capped at the
/// maximum wait; otherwise defers to `fallback`.
pub struct RetryAfterBackoff {
    fallback: Arc<dyn Backoff>,
}

impl RetryAfterBackoff {
    pub fn new(fallback: impl Backoff + 'static) -> Self {
        Self {
            fallback: Arc::new(fallback),
        }
    }
}

impl Default for RetryAfterBackoff {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl Backoff for RetryAfterBackoff {
    fn delay(
        &self,
        min_wait: Duration,
        max_wait: Duration,
        attempt: usize,
        decision: &RetryDecision,
    ) -> Duration {
        let retry_after = decision
            .headers
            .as_ref()
            .and_then(|headers| parse_retry_after(headers, SystemTime::now()));
        match retry_after {
            Some(delay) => delay.min(max_wait),
            None => self.fallback.delay(min_wait, max_wait, attempt, decision),
        }
    }
}

/// Retries failed exchanges (connection, TLS, DNS, timeout) and nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransportErrorTrigger;

impl RetryTrigger for TransportErrorTrigger {
    fn should_retry(&self, decision: &RetryDecision) -> bool {
        decision.error_class == Some(ErrorClass::Transport)
    }
}

/// Retries the listed statuses as well as transport failures.
#[derive(Clone, Debug)]
pub struct StatusTrigger {
    statuses: BTreeSet<u16>,
}

impl StatusTrigger {
    pub fn new(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
        }
    }
}

impl Default for StatusTrigger {
    fn default() -> Self {
        Self::new([429, 500, 502, 503, 504])
    }
}

impl RetryTrigger for StatusTrigger {
    fn should_retry(&self, decision: &RetryDecision) -> bool {
        match decision.status {
            Some(status) => self.statuses.contains(&status.as_u16()),
            None => TransportErrorTrigger.should_retry(decision),
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    min_wait: Duration,
    max_wait: Duration,
    backoff: Arc<dyn Backoff>,
    trigger: Arc<dyn RetryTrigger>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("min_wait", &self.min_wait)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// A single attempt; trigger and backoff are never consulted.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            min_wait: DEFAULT_MIN_WAIT,
            max_wait: DEFAULT_MAX_WAIT,
            backoff: Arc::new(ExponentialBackoff::default()),
            trigger: Arc::new(TransportErrorTrigger),
        }
    }

    pub fn standard() -> Self {
        Self::disabled().max_attempts(STANDARD_MAX_ATTEMPTS)
    }

    /// Zero and one both mean a single attempt.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn min_wait(mut self, min_wait: Duration) -> Self {
        self.min_wait = min_wait;
        if self.max_wait < self.min_wait {
            self.max_wait = self.min_wait;
        }
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait.max(self.min_wait);
        self
    }

    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn trigger(mut self, trigger: impl RetryTrigger + 'static) -> Self {
        self.trigger = Arc::new(trigger);
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 1
    }

    pub(crate) fn should_retry(&self, decision: &RetryDecision) -> bool {
        self.trigger.should_retry(decision)
    }

    pub(crate) fn delay(&self, decision: &RetryDecision) -> Duration {
        self.backoff
            .delay(self.min_wait, self.max_wait, decision.attempt, decision)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::header::RETRY_AFTER;
    use http::{HeaderMap, HeaderValue, Method, StatusCode};

    use super::{
        Backoff, ExponentialBackoff, RetryAfterBackoff, RetryDecision, RetryPolicy, RetryTrigger,
        StatusTrigger, TransportErrorTrigger, exponential_backoff,
    };
    use crate::error::{Error, TimeoutPhase};

    fn response_decision(status: u16, headers: HeaderMap) -> RetryDecision {
        RetryDecision::for_response(
            0,
            3,
            &Method::GET,
            "https://api.example.com/items",
            StatusCode::from_u16(status).expect("valid status"),
            &headers,
        )
    }

    fn timeout_decision() -> RetryDecision {
        let error = Error::Timeout {
            phase: TimeoutPhase::Transport,
            timeout_ms: 10,
            method: Method::GET,
            uri: "https://api.example.com/items".to_owned(),
        };
        RetryDecision::for_error(0, 3, &Method::GET, "https://api.example.com/items", &error)
    }

    #[test]
    fn jittered_backoff_stays_within_half_and_full_window() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        for _ in 0..256 {
            let first = exponential_backoff(min, max, 0, true);
            assert!(first >= min && first <= Duration::from_secs(1), "{first:?}");

            let third = exponential_backoff(min, max, 2, true);
            assert!(third >= Duration::from_secs(2) && third < Duration::from_secs(4), "{third:?}");

            let capped = exponential_backoff(min, max, 20, true);
            assert!(capped >= Duration::from_secs(15) && capped <= max, "{capped:?}");
        }
    }

    #[test]
    fn plain_backoff_doubles_until_the_cap() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        let delays: Vec<_> = (0..5)
            .map(|attempt| exponential_backoff(min, max, attempt, false))
            .collect();
        assert_eq!(
            delays,
            [100, 200, 400, 500, 500].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn zero_minimum_wait_never_panics() {
        assert_eq!(
            exponential_backoff(Duration::ZERO, Duration::ZERO, 3, true),
            Duration::ZERO
        );
    }

    #[test]
    fn max_attempts_is_clamped_to_single_attempt() {
        assert_eq!(RetryPolicy::disabled().max_attempts(0).configured_max_attempts(), 1);
        assert!(!RetryPolicy::standard().max_attempts(1).is_enabled());
        assert_eq!(RetryPolicy::standard().configured_max_attempts(), 3);
    }

    #[test]
    fn max_wait_never_drops_below_min_wait() {
        let policy = RetryPolicy::standard()
            .min_wait(Duration::from_secs(5))
            .max_wait(Duration::from_secs(1));
        let delay = policy.delay(&timeout_decision());
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn default_trigger_retries_transport_failures_only() {
        assert!(TransportErrorTrigger.should_retry(&timeout_decision()));
        assert!(!TransportErrorTrigger.should_retry(&response_decision(503, HeaderMap::new())));
    }

    #[test]
    fn status_trigger_retries_listed_statuses() {
        let trigger = StatusTrigger::default();
        assert!(trigger.should_retry(&response_decision(503, HeaderMap::new())));
        assert!(!trigger.should_retry(&response_decision(404, HeaderMap::new())));
        assert!(trigger.should_retry(&timeout_decision()));
    }

    #[test]
    fn retry_after_header_overrides_backoff() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let backoff = RetryAfterBackoff::new(ExponentialBackoff::new(false));
        let min = Duration::from_millis(100);
        let max = Duration::from_secs(5);

        let decision = response_decision(429, headers);
        assert_eq!(backoff.delay(min, max, 0, &decision), max);

        let without_header = response_decision(429, HeaderMap::new());
        assert_eq!(backoff.delay(min, max, 1, &without_header), Duration::from_millis(200));
    }

    #[test]
    fn closures_work_as_trigger_and_backoff() {
        let policy = RetryPolicy::standard()
            .trigger(|decision: &RetryDecision| decision.status == Some(StatusCode::CONFLICT))
            .backoff(|_min: Duration, _max: Duration, attempt: usize, _: &RetryDecision| {
                Duration::from_millis(attempt as u64 * 10)
            });
        let mut decision = response_decision(409, HeaderMap::new());
        decision.attempt = 2;
        assert!(policy.should_retry(&decision));
        assert_eq!(policy.delay(&decision), Duration::from_millis(20));
    }
}
