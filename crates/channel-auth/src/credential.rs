//! Channel credential pair
//!
//! `expires` is a unix timestamp in milliseconds (absolute, not a delta),
//! computed at refresh time from `TokenResponse.expires_in` plus the current
//! time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::secret::Secret;
use crate::token::TokenResponse;

/// Access/refresh credential pair owned by exactly one channel.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Current access token (Bearer token for remote calls)
    pub access: String,
    /// Refresh token for obtaining new access tokens. Channels imported with
    /// only an access token cannot be renewed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
    /// Expiration as unix timestamp in milliseconds
    pub expires: u64,
}

impl Credential {
    pub fn new(access: impl Into<String>, refresh: Option<String>, expires: u64) -> Self {
        Self {
            access: access.into(),
            refresh,
            expires,
        }
    }

    /// Whether the access token expires within `margin_millis` of `now_millis`
    /// (or has already expired).
    pub fn expires_within(&self, now_millis: u64, margin_millis: u64) -> bool {
        self.expires <= now_millis.saturating_add(margin_millis)
    }

    /// Build the renewed pair from a token endpoint response.
    ///
    /// Providers that do not rotate refresh tokens omit `refresh_token`; the
    /// existing one is kept in that case.
    pub fn renewed(&self, response: TokenResponse, now_millis: u64) -> Self {
        Self {
            access: response.access_token,
            refresh: response.refresh_token.or_else(|| self.refresh.clone()),
            expires: now_millis.saturating_add(response.expires_in.saturating_mul(1000)),
        }
    }

    /// Force the next validity check to refresh.
    pub fn invalidate(&mut self) {
        self.expires = 0;
    }

    /// The access token wrapped for handing to a remote operation.
    pub fn access_token(&self) -> Secret<String> {
        Secret::new(self.access.clone())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access", &"[REDACTED]")
            .field("refresh", &self.refresh.as_ref().map(|_| "[REDACTED]"))
            .field("expires", &self.expires)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires: u64) -> Credential {
        Credential::new("at_1", Some("rt_1".into()), expires)
    }

    #[test]
    fn expires_within_margin() {
        let cred = credential(100_000);
        assert!(!cred.expires_within(0, 60_000));
        assert!(cred.expires_within(40_000, 60_000), "inside margin");
        assert!(cred.expires_within(200_000, 60_000), "already expired");
    }

    #[test]
    fn renewed_keeps_refresh_token_when_not_rotated() {
        let cred = credential(0);
        let renewed = cred.renewed(
            TokenResponse {
                access_token: "at_2".into(),
                refresh_token: None,
                expires_in: 3600,
            },
            1_000,
        );
        assert_eq!(renewed.access, "at_2");
        assert_eq!(renewed.refresh.as_deref(), Some("rt_1"));
        assert_eq!(renewed.expires, 1_000 + 3_600_000);
    }

    #[test]
    fn renewed_takes_rotated_refresh_token() {
        let renewed = credential(0).renewed(
            TokenResponse {
                access_token: "at_2".into(),
                refresh_token: Some("rt_2".into()),
                expires_in: 60,
            },
            0,
        );
        assert_eq!(renewed.refresh.as_deref(), Some("rt_2"));
    }

    #[test]
    fn invalidate_forces_expiry() {
        let mut cred = credential(u64::MAX);
        cred.invalidate();
        assert!(cred.expires_within(1, 0));
    }

    #[test]
    fn debug_redacts_tokens() {
        let debug = format!("{:?}", credential(42));
        assert!(!debug.contains("at_1"), "got: {debug}");
        assert!(!debug.contains("rt_1"), "got: {debug}");
        assert!(debug.contains("42"));
    }

    #[test]
    fn missing_refresh_token_deserializes() {
        let cred: Credential = serde_json::from_str(r#"{"access":"at","expires":5}"#).unwrap();
        assert!(cred.refresh.is_none());
    }
}
