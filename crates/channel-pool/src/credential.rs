//! Credential lifecycle
//!
//! `ensure_valid` is the single place a channel's access token is checked
//! for staleness. A token inside the renewal margin is refreshed with the
//! stored refresh token and the new pair is written through to storage
//! before it is used, so a crash cannot lose a rotated refresh token.
//! Refresh failures are returned, never retried here.

use std::sync::Arc;
use std::time::Duration;

use channel_auth::{Credential, Secret, TokenRefresher};
use channel_store::ChannelStore;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Refreshes and persists channel credentials.
pub struct CredentialManager {
    refresher: Arc<dyn TokenRefresher>,
    store: Arc<dyn ChannelStore>,
    renewal_margin: Duration,
}

impl CredentialManager {
    pub fn new(
        refresher: Arc<dyn TokenRefresher>,
        store: Arc<dyn ChannelStore>,
        renewal_margin: Duration,
    ) -> Self {
        Self {
            refresher,
            store,
            renewal_margin,
        }
    }

    /// Whether `credential` is expired or inside `margin` at `now`.
    pub fn is_stale(credential: &Credential, now: u64, margin: Duration) -> bool {
        credential.expires_within(now, margin.as_millis() as u64)
    }

    /// Return a usable access token, refreshing first if it is stale.
    pub async fn ensure_valid(
        &self,
        channel_id: &str,
        credential: &mut Credential,
        now: u64,
    ) -> Result<Secret<String>> {
        if Self::is_stale(credential, now, self.renewal_margin) {
            debug!(channel_id, "access token inside renewal margin, refreshing");
            self.refresh(channel_id, credential, now).await?;
        }
        Ok(credential.access_token())
    }

    /// Exchange the refresh token and persist the renewed pair.
    ///
    /// `credential` is only replaced after the store accepted the new pair.
    pub async fn refresh(
        &self,
        channel_id: &str,
        credential: &mut Credential,
        now: u64,
    ) -> Result<()> {
        let Some(refresh) = credential.refresh.as_deref() else {
            metrics::record_refresh(channel_id, false);
            return Err(Error::Credential {
                channel_id: channel_id.to_string(),
                message: channel_auth::Error::MissingRefreshToken.to_string(),
            });
        };

        let response = match self.refresher.refresh(refresh).await {
            Ok(response) => response,
            Err(e) => {
                warn!(channel_id, error = %e, "token refresh failed");
                metrics::record_refresh(channel_id, false);
                return Err(Error::Credential {
                    channel_id: channel_id.to_string(),
                    message: e.to_string(),
                });
            }
        };

        let renewed = credential.renewed(response, now);
        if let Err(e) = self
            .store
            .update_credential(channel_id, renewed.clone())
            .await
        {
            warn!(channel_id, error = %e, "failed to persist refreshed credential, not using it");
            metrics::record_refresh(channel_id, false);
            return Err(Error::Storage(format!(
                "persisting refreshed credential for {channel_id}: {e}"
            )));
        }

        *credential = renewed;
        metrics::record_refresh(channel_id, true);
        info!(channel_id, expires = credential.expires, "credential refreshed");
        Ok(())
    }
}
