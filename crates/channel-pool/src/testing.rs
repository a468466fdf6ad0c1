//! Shared test fixtures

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use channel_auth::{Credential, TokenRefresher, TokenResponse};
use channel_store::{ChannelRecord, ChannelStore, HealthRecord, JsonChannelStore, QuotaRecord};

pub const DAY: u64 = 86_400_000;

/// Refresher that counts calls and either always succeeds or always fails.
pub struct ScriptedRefresher {
    calls: AtomicUsize,
    fail: bool,
}

impl ScriptedRefresher {
    pub fn succeeding() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TokenRefresher for ScriptedRefresher {
    fn refresh<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = channel_auth::Result<TokenResponse>> + Send + 'a>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                Err(channel_auth::Error::InvalidCredentials(
                    "refresh token rejected (400): invalid_grant".into(),
                ))
            } else {
                Ok(TokenResponse {
                    access_token: format!("at_refreshed_{n}"),
                    refresh_token: None,
                    expires_in: 3_600,
                })
            }
        })
    }
}

/// Store pre-populated with active channels `(id, credential expiry)`.
pub async fn test_store(channels: &[(&str, u64)]) -> (tempfile::TempDir, Arc<JsonChannelStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonChannelStore::load(dir.path().join("channels.json"))
        .await
        .unwrap();
    for (id, expires) in channels {
        store
            .save_channel(ChannelRecord {
                id: id.to_string(),
                name: format!("Channel {id}"),
                active: true,
                credential: Credential::new(format!("at_{id}"), Some(format!("rt_{id}")), *expires),
                quota: QuotaRecord {
                    used: 0,
                    limit: 10_000,
                    reset_at: DAY,
                },
                health: HealthRecord::default(),
            })
            .await
            .unwrap();
    }
    (dir, Arc::new(store))
}
