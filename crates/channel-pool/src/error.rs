//! Error types for channel pool operations
//!
//! Only `RateLimited` and `TransientServerError` are retried by the executor;
//! every other variant reaches the caller on first occurrence.

use std::time::Duration;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Refresh token missing or rejected, or the refreshed pair could not be
    /// persisted. Needs operator action.
    #[error("credential error on channel {channel_id}: {message}")]
    Credential { channel_id: String, message: String },

    /// Local admission failed before any remote call was made.
    #[error("insufficient quota on channel {channel_id}: cost {cost}, remaining {remaining}")]
    InsufficientQuota {
        channel_id: String,
        cost: u64,
        remaining: u64,
    },

    #[error("channel {channel_id} suspended, retry in {}ms", .retry_in.as_millis())]
    ChannelSuspended {
        channel_id: String,
        retry_in: Duration,
    },

    #[error("rate limited on channel {channel_id}: {message}")]
    RateLimited {
        channel_id: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// The platform's own quota accounting rejected the call.
    #[error("remote quota exceeded on channel {channel_id}: {message}")]
    QuotaExceededRemote { channel_id: String, message: String },

    #[error("transient server error on channel {channel_id}: {message}")]
    TransientServerError { channel_id: String, message: String },

    /// The platform rejected the access token.
    #[error("unauthorized on channel {channel_id}: {message}")]
    Unauthorized { channel_id: String, message: String },

    /// Unclassified remote failure.
    #[error("remote operation failed on channel {channel_id}: {message}")]
    Remote { channel_id: String, message: String },

    /// Selection found no channel satisfying eligibility; try later.
    #[error("no eligible channel for cost {cost}: {summary}")]
    NoEligibleChannel { cost: u64, summary: String },

    #[error("channel {0} is inactive")]
    Inactive(String),

    #[error("channel not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

impl Error {
    /// Expected steady-state conditions under load that callers should
    /// answer with "try again later" instead of a hard failure.
    pub fn is_retry_later(&self) -> bool {
        matches!(
            self,
            Error::NoEligibleChannel { .. } | Error::ChannelSuspended { .. }
        )
    }

    /// Whether the executor retries this error automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::TransientServerError { .. }
        )
    }
}

impl From<channel_store::Error> for Error {
    fn from(e: channel_store::Error) -> Self {
        match e {
            channel_store::Error::NotFound(id) => Error::NotFound(id),
            other => Error::Storage(other.to_string()),
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_later_covers_selection_and_suspension() {
        let none = Error::NoEligibleChannel {
            cost: 1600,
            summary: "0 of 2 eligible".into(),
        };
        let suspended = Error::ChannelSuspended {
            channel_id: "UC1".into(),
            retry_in: Duration::from_secs(4),
        };
        assert!(none.is_retry_later());
        assert!(suspended.is_retry_later());
        assert!(
            !Error::InsufficientQuota {
                channel_id: "UC1".into(),
                cost: 1,
                remaining: 0
            }
            .is_retry_later()
        );
    }

    #[test]
    fn only_rate_limit_and_server_errors_are_retryable() {
        let rate = Error::RateLimited {
            channel_id: "UC1".into(),
            message: "slow down".into(),
            retry_after: None,
        };
        let server = Error::TransientServerError {
            channel_id: "UC1".into(),
            message: "503".into(),
        };
        let quota = Error::QuotaExceededRemote {
            channel_id: "UC1".into(),
            message: "quotaExceeded".into(),
        };
        assert!(rate.is_retryable());
        assert!(server.is_retryable());
        assert!(!quota.is_retryable());
    }

    #[test]
    fn suspended_display_includes_wait() {
        let err = Error::ChannelSuspended {
            channel_id: "UC1".into(),
            retry_in: Duration::from_millis(2500),
        };
        assert_eq!(err.to_string(), "channel UC1 suspended, retry in 2500ms");
    }

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err: Error = channel_store::Error::NotFound("UC9".into()).into();
        assert!(matches!(err, Error::NotFound(id) if id == "UC9"));
        let err: Error = channel_store::Error::Io("disk full".into()).into();
        assert!(matches!(err, Error::Storage(msg) if msg.contains("disk full")));
    }
}
