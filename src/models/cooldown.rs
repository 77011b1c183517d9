use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;

use crate::app::config::{BackoffConfig, CooldownConfig};
use crate::error::Error;

static STATUS_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([45]\d{2})\b").expect("status code pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    RateLimited,
    ServerError,
    Forbidden,
    ValidationError,
    /// The caller's own per-attempt timeout fired before the backend answered.
    Cancelled,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::ServerError => "server_error",
            ErrorClass::Forbidden => "forbidden",
            ErrorClass::ValidationError => "validation_error",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Malformed requests are the caller's fault: never retried, never cooled down.
    pub fn is_retryable(&self) -> bool {
        *self != ErrorClass::ValidationError
    }
}

/// Classify an error once, at the point where it was first observed.
pub fn classify(error: &Error) -> ErrorClass {
    match error {
        Error::Validation(_)
        | Error::MissingCredential(_)
        | Error::EndpointNotFound { .. }
        | Error::Closed(_) => return ErrorClass::ValidationError,
        Error::Timeout(_) => return ErrorClass::Transient,
        Error::Cancelled(_) => return ErrorClass::Cancelled,
        Error::MalformedResponse(_) | Error::Json(_) => return ErrorClass::ServerError,
        Error::Http(e) if e.is_timeout() || e.is_connect() => return ErrorClass::Transient,
        Error::Upstream { status, message } => return classify_status(*status, message),
        _ => {}
    }

    if let Some(status) = error.status_code() {
        return classify_status(status, &error.to_string());
    }
    classify_message(&error.to_string())
}

pub fn classify_status(status: u16, message: &str) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited,
        401 | 403 => ErrorClass::Forbidden,
        408 => ErrorClass::Transient,
        400 | 413 | 422 => match classify_message(message) {
            // Some backends report region blocks and exhausted quotas as 400.
            class @ (ErrorClass::Forbidden | ErrorClass::RateLimited) => class,
            _ => ErrorClass::ValidationError,
        },
        500..=599 => ErrorClass::ServerError,
        _ => ErrorClass::Unknown,
    }
}

/// Heuristic fallback for errors that carry no structured status.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if ["rate limit", "rate_limit", "too many requests", "quota", "resource_exhausted"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return ErrorClass::RateLimited;
    }
    if [
        "forbidden",
        "unauthorized",
        "permission denied",
        "location is not supported",
        "not available in your region",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
    {
        return ErrorClass::Forbidden;
    }
    if ["timeout", "timed out", "connection", "network", "dns"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return ErrorClass::Transient;
    }
    if let Some(code) = STATUS_CODE
        .captures(&lower)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
    {
        return match classify_status(code, "") {
            ErrorClass::ValidationError => ErrorClass::Unknown,
            class => class,
        };
    }
    ErrorClass::Unknown
}

#[derive(Debug, Clone, PartialEq)]
pub struct CooldownPolicy {
    pub rate_limited: Duration,
    pub forbidden: Duration,
    pub server_error: Duration,
    pub transient: Duration,
    pub unknown: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            rate_limited: Duration::from_secs(600),
            forbidden: Duration::from_secs(1800),
            server_error: Duration::from_secs(300),
            transient: Duration::from_secs(600),
            unknown: Duration::from_secs(180),
        }
    }
}

impl From<&CooldownConfig> for CooldownPolicy {
    fn from(config: &CooldownConfig) -> Self {
        Self {
            rate_limited: Duration::from_secs(config.rate_limited_secs),
            forbidden: Duration::from_secs(config.forbidden_secs),
            server_error: Duration::from_secs(config.server_error_secs),
            transient: Duration::from_secs(config.transient_secs),
            unknown: Duration::from_secs(config.unknown_secs),
        }
    }
}

impl CooldownPolicy {
    /// `None` means the class must not trigger a cooldown.
    pub fn duration_for(&self, class: ErrorClass) -> Option<Duration> {
        match class {
            ErrorClass::RateLimited => Some(self.rate_limited),
            ErrorClass::Forbidden => Some(self.forbidden),
            ErrorClass::ServerError => Some(self.server_error),
            ErrorClass::Transient => Some(self.transient),
            ErrorClass::Unknown => Some(self.unknown),
            ErrorClass::ValidationError | ErrorClass::Cancelled => None,
        }
    }

    /// A model's configured hint replaces the table value.
    pub fn duration_with_hint(&self, class: ErrorClass, hint: Option<Duration>) -> Option<Duration> {
        self.duration_for(class).map(|d| hint.unwrap_or(d))
    }
}

/// Exponential backoff between attempts on the same model:
/// `factor * base^n`, capped at `max_delay`, optionally jittered downwards.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: u64,
    pub factor_ms: u64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: 2,
            factor_ms: 250,
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base: config.base,
            factor_ms: config.factor_ms,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

impl BackoffPolicy {
    /// Delays to sleep between `retries + 1` attempts.
    pub fn delays(&self, retries: u32) -> impl Iterator<Item = Duration> {
        let jitter = self.jitter;
        let max_delay = self.max_delay;
        ExponentialBackoff::from_millis(self.base.max(1))
            .factor(self.factor_ms)
            .max_delay(max_delay)
            .map(move |delay| if jitter { jittered(delay) } else { delay.min(max_delay) })
            .take(retries as usize)
    }
}

fn jittered(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    delay.mul_f64(rng.gen_range(0.5..1.0))
}

/// Everything an adapter needs to decide how long to wait and how long to cool down.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResiliencePolicy {
    pub cooldown: CooldownPolicy,
    pub backoff: BackoffPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify(&Error::upstream(429, "slow down")), ErrorClass::RateLimited);
        assert_eq!(classify(&Error::upstream(403, "nope")), ErrorClass::Forbidden);
        assert_eq!(classify(&Error::upstream(503, "unavailable")), ErrorClass::ServerError);
        assert_eq!(classify(&Error::upstream(422, "bad field")), ErrorClass::ValidationError);
        assert_eq!(classify(&Error::upstream(404, "no such model")), ErrorClass::Unknown);
    }

    #[test]
    fn test_region_block_reported_as_bad_request() {
        let error = Error::upstream(400, "User location is not supported for the API use.");
        assert_eq!(classify(&error), ErrorClass::Forbidden);
    }

    #[test]
    fn test_local_errors_are_validation() {
        assert_eq!(classify(&Error::validation("missing prompt")), ErrorClass::ValidationError);
        assert_eq!(classify(&Error::MissingCredential("groq".into())), ErrorClass::ValidationError);
        assert_eq!(classify(&Error::Timeout(Duration::from_secs(1))), ErrorClass::Transient);
        assert_eq!(classify(&Error::malformed("no choices")), ErrorClass::ServerError);
    }

    #[test]
    fn test_message_heuristics() {
        assert_eq!(classify(&Error::unknown("Quota exceeded for project")), ErrorClass::RateLimited);
        assert_eq!(classify(&Error::unknown("connection reset by peer")), ErrorClass::Transient);
        assert_eq!(classify(&Error::unknown("backend said 502 bad gateway")), ErrorClass::ServerError);
        assert_eq!(classify(&Error::unknown("something odd")), ErrorClass::Unknown);
    }

    #[test]
    fn test_validation_never_cools_down() {
        let policy = CooldownPolicy::default();
        assert!(policy.duration_for(ErrorClass::ValidationError).is_none());
        assert!(!ErrorClass::ValidationError.is_retryable());
        assert_eq!(policy.duration_for(ErrorClass::Forbidden), Some(Duration::from_secs(1800)));
        assert_eq!(
            policy.duration_with_hint(ErrorClass::RateLimited, Some(Duration::from_secs(5))),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_caller_cancellation_retries_without_cooldown() {
        let class = classify(&Error::Cancelled(Duration::from_millis(1)));
        assert_eq!(class, ErrorClass::Cancelled);
        assert!(class.is_retryable());
        assert!(CooldownPolicy::default()
            .duration_with_hint(class, Some(Duration::from_secs(5)))
            .is_none());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            base: 2,
            factor_ms: 500,
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        let delays: Vec<_> = policy.delays(6).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
    }

    #[test]
    fn test_jitter_stays_below_cap() {
        let policy = BackoffPolicy::default();
        for delay in policy.delays(8) {
            assert!(delay <= policy.max_delay);
        }
        assert_eq!(policy.delays(0).count(), 0);
    }
}
