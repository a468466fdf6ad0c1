//! OAuth refresh-token exchange
//!
//! POSTs `grant_type=refresh_token` to the platform's token endpoint. The
//! endpoint and client identity are configuration, so the same exchange
//! works for any OAuth 2.0 platform the channels belong to.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::secret::Secret;

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. Some providers
/// only return a new `refresh_token` when they rotate it.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

/// Refresh an access token using a refresh token.
pub async fn refresh_token(
    client: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    refresh: &str,
) -> Result<TokenResponse> {
    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh),
        ("client_id", client_id),
    ];
    if let Some(secret) = client_secret {
        form.push(("client_secret", secret));
    }

    let response = client
        .post(token_endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 400 invalid_grant / 401 / 403 mean the refresh token is revoked or invalid
        if status.as_u16() == 401 || status.as_u16() == 403 || body.contains("invalid_grant") {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}

/// Capability to exchange a refresh token for a new access token.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn TokenRefresher>`), so tests can substitute a scripted refresher.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;
}

/// `TokenRefresher` backed by a real OAuth token endpoint.
pub struct OAuthRefresher {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<Secret<String>>,
}

impl OAuthRefresher {
    pub fn new(
        client: reqwest::Client,
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<Secret<String>>,
    ) -> Self {
        Self {
            client,
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }
}

impl TokenRefresher for OAuthRefresher {
    fn refresh<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>> {
        Box::pin(async move {
            debug!(endpoint = %self.token_endpoint, "exchanging refresh token");
            refresh_token(
                &self.client,
                &self.token_endpoint,
                &self.client_id,
                self.client_secret.as_ref().map(|s| s.expose().as_str()),
                refresh,
            )
            .await
        })
    }
}
