//! Periodic maintenance tasks
//!
//! Two independent background loops keep the pool current without waiting
//! for the request path: a bulk quota rollover pass, and proactive refresh
//! of access tokens approaching expiry. Both are safe to run alongside
//! `execute`; they take the same per-channel locks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::registry::Registry;

/// Spawn a task that resets every channel whose quota window has ended.
///
/// Lazy resets on admission already cover the request path; this pass keeps
/// idle channels' persisted counters and status output current.
pub fn spawn_quota_reset_task(
    registry: Arc<Registry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            registry.reset_due_quotas().await;
        }
    })
}

/// Spawn a task that refreshes access tokens expiring within `threshold`.
///
/// Runs every `interval`. A failed refresh is logged and recorded on the
/// channel; the next cycle tries again.
pub fn spawn_refresh_task(
    registry: Arc<Registry>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, credentials were just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&registry, threshold).await;
        }
    })
}

/// Run one refresh cycle over every channel. Returns how many refreshed.
async fn refresh_cycle(registry: &Registry, threshold: Duration) -> usize {
    let mut refreshed = 0;
    for id in registry.channel_ids().await {
        match registry.refresh_if_expiring(&id, threshold).await {
            Ok(true) => refreshed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(channel_id = %id, error = %e, "background refresh failed, will retry next cycle");
            }
        }
    }
    if refreshed > 0 {
        info!(channels = refreshed, "background token refresh complete");
    } else {
        debug!("no tokens due for refresh");
    }
    refreshed
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel_auth::Credential;
    use channel_store::{ChannelStore, JsonChannelStore};

    use crate::clock::ManualClock;
    use crate::config::PoolSettings;
    use crate::registry::ChannelConfig;
    use crate::testing::{DAY, ScriptedRefresher, test_store};

    const FAR: u64 = 4_102_444_800_000;

    async fn registry(
        refresher: ScriptedRefresher,
        channels: &[(&str, u64)],
    ) -> (tempfile::TempDir, Arc<JsonChannelStore>, Arc<ManualClock>, Arc<Registry>) {
        let (dir, store) = test_store(&[]).await;
        let clock = Arc::new(ManualClock::new(0));
        let registry = Registry::new(
            PoolSettings::default(),
            store.clone(),
            Arc::new(refresher),
            clock.clone(),
        )
        .unwrap();
        for (id, expires) in channels {
            registry
                .register(ChannelConfig {
                    id: id.to_string(),
                    name: id.to_string(),
                    credential: Some(Credential::new(format!("at_{id}"), Some(format!("rt_{id}")), *expires)),
                    settings: None,
                })
                .await
                .unwrap();
        }
        (dir, store, clock, Arc::new(registry))
    }

    #[tokio::test]
    async fn refresh_cycle_skips_valid_tokens() {
        let (_dir, store, _clock, registry) =
            registry(ScriptedRefresher::succeeding(), &[("a", FAR)]).await;

        assert_eq!(refresh_cycle(&registry, Duration::from_secs(900)).await, 0);
        let record = store.load_channel("a").await.unwrap().unwrap();
        assert_eq!(record.credential.access, "at_a");
    }

    #[tokio::test]
    async fn refresh_cycle_refreshes_expiring_tokens_only() {
        let (_dir, store, _clock, registry) = registry(
            ScriptedRefresher::succeeding(),
            &[("a", 60_000), ("b", FAR)],
        )
        .await;

        assert_eq!(refresh_cycle(&registry, Duration::from_secs(900)).await, 1);
        let a = store.load_channel("a").await.unwrap().unwrap();
        assert_eq!(a.credential.access, "at_refreshed_1");
        assert_eq!(a.credential.expires, 3_600_000);
        let b = store.load_channel("b").await.unwrap().unwrap();
        assert_eq!(b.credential.access, "at_b");
    }

    #[tokio::test]
    async fn refresh_cycle_records_failure_without_counting_it() {
        let (_dir, _store, _clock, registry) =
            registry(ScriptedRefresher::failing(), &[("a", 0)]).await;

        assert_eq!(refresh_cycle(&registry, Duration::from_secs(900)).await, 0);
        let status = registry.get("a").await.unwrap();
        assert_eq!(status.consecutive_errors, 0);
        assert!(status.last_error.unwrap().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn refresh_cycle_skips_inactive_channels() {
        let refresher = ScriptedRefresher::succeeding();
        let (_dir, store, _clock, registry) = registry(refresher, &[("a", 0)]).await;
        registry.deregister("a").await.unwrap();

        assert_eq!(refresh_cycle(&registry, Duration::from_secs(900)).await, 0);
        let record = store.load_channel("a").await.unwrap().unwrap();
        assert_eq!(record.credential.access, "at_a");
    }

    #[tokio::test]
    async fn quota_reset_task_rolls_over_due_windows() {
        let (_dir, store, clock, registry) =
            registry(ScriptedRefresher::succeeding(), &[("a", FAR)]).await;
        {
            let entry = registry.entry("a").await.unwrap();
            let reservation = registry.admit(&entry, 500).await.unwrap();
            registry.record_success(reservation).await;
        }
        clock.set(DAY);

        let handle = spawn_quota_reset_task(registry.clone(), Duration::from_secs(60));
        let mut record = store.load_channel("a").await.unwrap().unwrap();
        for _ in 0..100 {
            if record.quota.used == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            record = store.load_channel("a").await.unwrap().unwrap();
        }
        handle.abort();

        assert_eq!(record.quota.used, 0);
        assert_eq!(record.quota.reset_at, 2 * DAY);
    }
}
