//! Retry with exponential backoff, jitter and error classification.
//!
//! An error is retried when its transport code is in the policy's set, or (if
//! it carries an HTTP-like status) the status is 5xx/429, or (otherwise) its
//! message looks like a timeout / connection / network failure. Everything else
//! propagates after the first attempt.

use std::{fmt, future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result, UpstreamError};

const DEFAULT_CODES: &[&str] = &["ECONNRESET", "ETIMEDOUT", "ENOTFOUND", "ECONNREFUSED"];
const MESSAGE_HINTS: &[&str] = &["timeout", "connection", "network", "econnreset", "etimedout"];

/// Anything that can be classified for retry purposes.
pub trait Classify: fmt::Display {
    /// Machine-readable transport code (e.g. `ECONNRESET`).
    fn code(&self) -> Option<&str> {
        None
    }

    /// HTTP-like status, if the failure came with one.
    fn status(&self) -> Option<u16> {
        None
    }
}

impl Classify for UpstreamError {
    fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    fn status(&self) -> Option<u16> {
        self.status
    }
}

impl Classify for std::io::Error {
    fn code(&self) -> Option<&str> {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::ConnectionReset => Some("ECONNRESET"),
            ErrorKind::TimedOut => Some("ETIMEDOUT"),
            ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
            _ => None,
        }
    }
}

impl Classify for Error {
    fn code(&self) -> Option<&str> {
        match self {
            Error::Upstream(e) => e.code(),
            Error::Io(e) => e.code(),
            _ => None,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Error::Upstream(e) => e.status(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay used as symmetric jitter, in `[0, 1]`.
    pub jitter: f64,
    pub retryable_codes: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            retryable_codes: codes(DEFAULT_CODES),
        }
    }
}

impl RetryPolicy {
    /// Plain HTTP calls.
    pub fn http() -> Self {
        let mut codes = codes(DEFAULT_CODES);
        codes.push("ECONNABORTED".to_string());
        Self {
            base_delay: Duration::from_millis(2000),
            retryable_codes: codes,
            ..Self::default()
        }
    }

    /// Generation / inference upstream: slow, expensive, few attempts.
    pub fn llm() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(3000),
            retryable_codes: codes(&["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED"]),
            ..Self::default()
        }
    }

    /// Document storage search/read.
    pub fn drive() -> Self {
        Self::default()
    }

    /// Low-latency cache-like store: more attempts, short delays.
    pub fn cache() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            retryable_codes: codes(&["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED"]),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        if self.max_delay < d {
            self.max_delay = d;
        }
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::Config("retry max_attempts must be >= 1".to_string()));
        }
        if self.base_delay.is_zero() {
            return Err(Error::Config("retry base_delay must be > 0".to_string()));
        }
        if self.max_delay < self.base_delay {
            return Err(Error::Config(
                "retry max_delay must be >= base_delay".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "retry backoff_multiplier must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config("retry jitter must be in [0, 1]".to_string()));
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered delay; `sample` is a uniform draw from `[0, 1)`.
    pub fn delay_for(&self, attempt: u32, sample: f64) -> Duration {
        let exp = self.base_delay_for(attempt).as_secs_f64();
        let jittered = exp + exp * self.jitter * (sample - 0.5);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub fn is_retryable<E: Classify + ?Sized>(&self, err: &E) -> bool {
        if let Some(code) = err.code() {
            if self.retryable_codes.iter().any(|c| c == code) {
                return true;
            }
        }

        if let Some(status) = err.status() {
            return status >= 500 || status == 429;
        }

        let message = err.to_string().to_lowercase();
        MESSAGE_HINTS.iter().any(|hint| message.contains(hint))
    }
}

fn codes(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Presets selected per upstream class.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPresets {
    pub http: RetryPolicy,
    pub llm: RetryPolicy,
    pub drive: RetryPolicy,
    pub cache: RetryPolicy,
}

impl Default for RetryPresets {
    fn default() -> Self {
        Self {
            http: RetryPolicy::http(),
            llm: RetryPolicy::llm(),
            drive: RetryPolicy::drive(),
            cache: RetryPolicy::cache(),
        }
    }
}

impl RetryPresets {
    pub fn validate(&self) -> Result<()> {
        self.http.validate()?;
        self.llm.validate()?;
        self.drive.validate()?;
        self.cache.validate()
    }
}

/// Why a retried operation ultimately failed. The last underlying error is kept verbatim.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// The error was not worth retrying.
    NonRetryable { attempts: u32, last: E },
    /// The caller cancelled between attempts.
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::NonRetryable { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn last(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::NonRetryable { last, .. } => {
                Some(last)
            }
            RetryError::Cancelled { last, .. } => last.as_ref(),
        }
    }

    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::NonRetryable { last, .. } => {
                Some(last)
            }
            RetryError::Cancelled { last, .. } => last,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "{last} (gave up after {attempts} attempts)")
            }
            RetryError::NonRetryable { last, .. } => write!(f, "{last}"),
            RetryError::Cancelled {
                attempts,
                last: Some(last),
            } => write!(f, "cancelled after {attempts} attempts: {last}"),
            RetryError::Cancelled { attempts, last: None } => {
                write!(f, "cancelled after {attempts} attempts")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl From<RetryError<Error>> for Error {
    fn from(e: RetryError<Error>) -> Self {
        match e {
            RetryError::Exhausted { last, .. } | RetryError::NonRetryable { last, .. } => last,
            RetryError::Cancelled { attempts, .. } => {
                Error::External(format!("operation cancelled after {attempts} attempts"))
            }
        }
    }
}

impl From<RetryError<UpstreamError>> for Error {
    fn from(e: RetryError<UpstreamError>) -> Self {
        match e {
            RetryError::Exhausted { last, .. } | RetryError::NonRetryable { last, .. } => {
                Error::Upstream(last)
            }
            RetryError::Cancelled { attempts, .. } => {
                Error::External(format!("operation cancelled after {attempts} attempts"))
            }
        }
    }
}

/// Run `operation` until it succeeds, fails non-retryably, or runs out of attempts.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Classify,
{
    run(policy, None, operation).await
}

/// Like [`with_retry`], but stops before the next attempt once `cancel` fires.
pub async fn with_retry_cancellable<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Classify,
{
    run(policy, Some(cancel), operation).await
}

async fn run<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Classify,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last: Option<E> = None;

    for attempt in 1..=max_attempts {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(RetryError::Cancelled {
                attempts: attempt - 1,
                last,
            });
        }

        debug!(attempt, max_attempts, "attempt");
        let err = match operation().await {
            Ok(v) => {
                if attempt > 1 {
                    info!(attempt, "operation succeeded after retry");
                }
                return Ok(v);
            }
            Err(e) => e,
        };

        warn!(attempt, error = %err, "attempt failed");

        if !policy.is_retryable(&err) {
            error!(attempt, error = %err, "non-retryable error, giving up");
            return Err(RetryError::NonRetryable {
                attempts: attempt,
                last: err,
            });
        }
        if attempt == max_attempts {
            error!(attempt, error = %err, "retry attempts exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.delay_for(attempt, rand::random::<f64>());
        info!(delay_ms = delay.as_millis() as u64, "waiting before next attempt");
        last = Some(err);

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(RetryError::Cancelled { attempts: attempt, last });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }

    // max_attempts >= 1, so the loop always returns.
    Err(RetryError::Cancelled {
        attempts: max_attempts,
        last,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(4)
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(0.0)
    }

    #[test]
    fn classification_rules() {
        let p = RetryPolicy::default();
        assert!(p.is_retryable(&UpstreamError::new("boom").with_code("ECONNRESET")));
        assert!(p.is_retryable(&UpstreamError::new("bad gateway").with_status(502)));
        assert!(p.is_retryable(&UpstreamError::new("slow down").with_status(429)));
        assert!(!p.is_retryable(&UpstreamError::new("nope").with_status(404)));
        // Status decides even if the message looks transient.
        assert!(!p.is_retryable(&UpstreamError::new("timeout").with_status(400)));
        assert!(p.is_retryable(&UpstreamError::new("Network unreachable")));
        assert!(p.is_retryable(&UpstreamError::new("request TIMEOUT")));
        assert!(!p.is_retryable(&UpstreamError::new("invalid api key")));
        assert!(!p.is_retryable(&UpstreamError::new("bad").with_code("EACCES")));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(p.is_retryable(&io));
        assert!(p.is_retryable(&Error::Io(io)));
        assert!(!p.is_retryable(&Error::Config("x".into())));
    }

    #[test]
    fn llm_preset_does_not_retry_dns_failures_by_code() {
        let e = UpstreamError::new("lookup failed").with_code("ENOTFOUND");
        assert!(!RetryPolicy::llm().is_retryable(&e));
        assert!(RetryPolicy::drive().is_retryable(&e));
    }

    #[test]
    fn presets_differ_in_tuning() {
        let llm = RetryPolicy::llm();
        let cache = RetryPolicy::cache();
        assert!(llm.max_attempts < cache.max_attempts);
        assert!(llm.base_delay > cache.base_delay);
        RetryPresets::default().validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_policies() {
        assert!(RetryPolicy::default().with_max_attempts(0).validate().is_err());
        assert!(RetryPolicy::default().with_jitter(1.5).validate().is_err());
        let mut p = RetryPolicy::default();
        p.backoff_multiplier = 0.5;
        assert!(p.validate().is_err());
        let mut p = RetryPolicy::default();
        p.max_delay = Duration::from_millis(10);
        assert!(p.validate().is_err());
    }

    #[test]
    fn base_delay_is_monotonic_and_capped() {
        let p = RetryPolicy::default();
        let delays: Vec<_> = (1..=10).map(|a| p.base_delay_for(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays[9], Duration::from_secs(30));
    }

    #[test]
    fn jitter_is_symmetric_and_bounded() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1, 0.5), Duration::from_secs(1));
        assert!((p.delay_for(1, 0.0).as_secs_f64() - 0.95).abs() < 1e-6);
        assert!(p.delay_for(1, 0.999_999) <= Duration::from_millis(1050));
        assert_eq!(p.with_jitter(1.0).delay_for(1, 0.0), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_retryable_failures() {
        let calls = AtomicU32::new(0);
        let k = 2;

        let out = with_retry(&fast(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= k {
                    Err(UpstreamError::new("connection reset").with_code("ECONNRESET"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, k + 1);
        assert_eq!(calls.load(Ordering::SeqCst), k + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_is_called_once() {
        let calls = AtomicU32::new(0);

        let err = with_retry(&fast(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(UpstreamError::new("forbidden").with_status(403)) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::NonRetryable { attempts: 1, .. }));
        assert_eq!(err.last().and_then(|e| e.status), Some(403));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts_and_keeps_last_error() {
        let calls = AtomicU32::new(0);

        let err = with_retry(&fast(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err::<(), _>(UpstreamError::new(format!("timeout #{n}"))) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts(), 4);
        assert_eq!(err.into_last().unwrap().message, "timeout #4");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_between_attempts() {
        let start = Instant::now();
        let _ = with_retry(&fast(), || async {
            Err::<(), _>(UpstreamError::new("network down"))
        })
        .await;

        // 100 + 200 + 400 ms between four attempts, no delay after the last one.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(800), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_attempts() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let err = with_retry_cancellable(&fast(), &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            async { Err::<(), _>(UpstreamError::new("connection lost")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Cancelled { attempts: 1, last: Some(_) }));
    }

    #[tokio::test]
    async fn retry_error_converts_into_core_error() {
        let err = with_retry(&fast(), || async {
            Err::<(), _>(UpstreamError::new("denied").with_status(401))
        })
        .await
        .unwrap_err();

        let core: Error = err.into();
        assert!(matches!(core, Error::Upstream(UpstreamError { status: Some(401), .. })));
    }
}
