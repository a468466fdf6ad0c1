//! Remote error classification
//!
//! Remote operations report failures as `RemoteError`, carrying a kind hint
//! the backoff controller and executor act on. `classify_status` derives the
//! kind from an HTTP status and body for platform clients that only see raw
//! responses. Platforms signal quota exhaustion with 403 or 429 plus a
//! reason string in the body; everything else in the 429 family is a plain
//! throttle.

use std::fmt;
use std::time::Duration;

/// Quota exhaustion markers in platform error bodies.
const QUOTA_PATTERNS: &[&str] = &[
    "quotaexceeded",
    "quota exceeded",
    "dailylimitexceeded",
    "uploadlimitexceeded",
    "exceeded your quota",
    "exceeded the number of videos",
];

/// Classification hint for a failed remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Throttled; `retry_after` is the server-specified wait, if any
    RateLimited { retry_after: Option<Duration> },
    /// The platform's quota accounting rejected the call
    QuotaExceeded,
    /// Network failure, timeout or 5xx
    ServerError,
    /// Access token rejected
    Unauthorized,
    /// Anything else (validation errors, 4xx); never retried
    Other,
}

impl ErrorKind {
    /// Label for metrics and logging.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited { .. } => "rate_limited",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Other => "other",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimited { .. } | ErrorKind::ServerError)
    }
}

/// Error returned by a caller-supplied remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited { retry_after }, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Classify a raw HTTP failure.
    pub fn from_response(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let kind = match classify_status(status, body) {
            ErrorKind::RateLimited { .. } => ErrorKind::RateLimited { retry_after },
            other => other,
        };
        Self::new(kind, format!("{status}: {body}"))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Whether an error body carries a quota exhaustion marker.
pub fn is_quota_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    QUOTA_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Classify an upstream error by HTTP status and response body.
///
/// 403/429 with a quota marker are `QuotaExceeded`; other 429s are
/// `RateLimited`; 401 and other 403s are `Unauthorized`; 408 and 5xx are
/// `ServerError`; everything else is `Other`.
pub fn classify_status(status: u16, body: &str) -> ErrorKind {
    match status {
        403 | 429 if is_quota_body(body) => ErrorKind::QuotaExceeded,
        429 => ErrorKind::RateLimited { retry_after: None },
        401 | 403 => ErrorKind::Unauthorized,
        408 | 500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::Other,
    }
}

/// Parse a `Retry-After` header carrying delta-seconds.
///
/// HTTP-date values are not supported and yield `None`, leaving the computed
/// backoff in charge.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
