//! Operation executor
//!
//! Wraps a caller-supplied remote operation with quota admission, credential
//! refresh and bounded retry. One `execute` call is one logical operation:
//! the cost is reserved once, up front, and committed only if some attempt
//! succeeds. Any early return drops the reservation, which releases it.
//!
//! Per attempt: ensure the credential, check the channel's cool-down, run
//! the operation. A retryable failure waits out the backoff delay and loops
//! back to the credential check, since a long wait may itself let the token
//! go stale.

use std::future::Future;
use std::sync::Arc;

use channel_auth::Secret;
use tracing::{debug, info, warn};

use crate::classify::{ErrorKind, RemoteError};
use crate::error::{Error, Result};
use crate::metrics;
use crate::registry::{Registry, Reservation};
use crate::selector::Selector;

/// Result of a successful `execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<T> {
    /// Channel the operation ran against
    pub channel_id: String,
    /// Attempts made, including the successful one
    pub attempts: u32,
    pub value: T,
}

/// Runs remote operations against registry channels.
pub struct Executor {
    registry: Arc<Registry>,
    selector: Selector,
    max_retries: u32,
}

impl Executor {
    pub fn new(registry: Arc<Registry>) -> Self {
        let max_retries = registry.settings().max_retries;
        Self {
            selector: Selector::new(registry.clone()),
            registry,
            max_retries,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Run `operation` against `channel_id`, or against the best eligible
    /// channel when `None`, charging `cost` quota units on success.
    ///
    /// The operation receives the channel's current access token and is
    /// called at most `1 + max_retries` times.
    pub async fn execute<T, F, Fut>(
        &self,
        channel_id: Option<&str>,
        cost: u64,
        mut operation: F,
    ) -> Result<Outcome<T>>
    where
        F: FnMut(Secret<String>) -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let reservation = self.reserve(channel_id, cost).await?;
        let entry = reservation.entry().clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let token = match self.registry.ensure_credential(&entry).await {
                Ok(token) => token,
                Err(e) => {
                    metrics::record_operation(&entry.id, "credential_error");
                    return Err(e);
                }
            };

            let now = self.registry.now();
            let cooldown = entry.state.lock().cooldown_remaining(now);
            if let Some(retry_in) = cooldown {
                debug!(channel_id = %entry.id, retry_in_ms = retry_in.as_millis() as u64, "channel cooling down");
                metrics::record_operation(&entry.id, "suspended");
                return Err(Error::ChannelSuspended {
                    channel_id: entry.id.clone(),
                    retry_in,
                });
            }

            match operation(token).await {
                Ok(value) => {
                    self.registry.record_success(reservation).await;
                    metrics::record_operation(&entry.id, "success");
                    info!(channel_id = %entry.id, cost, attempts = attempt, "operation succeeded");
                    return Ok(Outcome {
                        channel_id: entry.id.clone(),
                        attempts: attempt,
                        value,
                    });
                }
                Err(remote) => {
                    let decision = self.registry.record_failure(&entry, &remote).await;
                    if decision.retry && attempt <= self.max_retries {
                        warn!(
                            channel_id = %entry.id,
                            attempt,
                            delay_ms = decision.delay.as_millis() as u64,
                            error = %remote,
                            "operation failed, retrying"
                        );
                        metrics::record_retry(&entry.id, remote.kind.label());
                        self.registry.clock().sleep(decision.delay).await;
                        continue;
                    }

                    warn!(channel_id = %entry.id, attempts = attempt, error = %remote, "operation failed");
                    metrics::record_operation(&entry.id, remote.kind.label());
                    return Err(surface(&entry.id, remote));
                }
            }
        }
    }

    /// Resolve the target channel and reserve `cost` on it.
    ///
    /// An automatic pick falls through to the next-ranked candidate when a
    /// concurrent caller took the quota between ranking and admission.
    async fn reserve(&self, channel_id: Option<&str>, cost: u64) -> Result<Reservation> {
        if let Some(id) = channel_id {
            let entry = self.registry.entry(id).await?;
            return self.note_admission(&entry.id, self.registry.admit(&entry, cost).await);
        }

        let ranked = self.selector.ranked(cost).await?;
        let mut last_err = None;
        for candidate in ranked {
            let entry = match self.registry.entry(&candidate.id).await {
                Ok(entry) => entry,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            match self.note_admission(&entry.id, self.registry.admit(&entry, cost).await) {
                Ok(reservation) => return Ok(reservation),
                Err(e @ (Error::InsufficientQuota { .. } | Error::Inactive(_))) => {
                    debug!(channel_id = %entry.id, error = %e, "candidate lost admission, trying next");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(Error::NoEligibleChannel {
            cost,
            summary: "no candidate admitted the cost".into(),
        }))
    }

    fn note_admission(&self, channel_id: &str, admitted: Result<Reservation>) -> Result<Reservation> {
        if let Err(e) = &admitted {
            let outcome = match e {
                Error::InsufficientQuota { .. } => "insufficient_quota",
                Error::Inactive(_) => "inactive",
                _ => "error",
            };
            metrics::record_operation(channel_id, outcome);
        }
        admitted
    }
}

/// Map a final remote failure onto the pool error taxonomy.
fn surface(channel_id: &str, remote: RemoteError) -> Error {
    let channel_id = channel_id.to_string();
    let message = remote.message;
    match remote.kind {
        ErrorKind::RateLimited { retry_after } => Error::RateLimited {
            channel_id,
            message,
            retry_after,
        },
        ErrorKind::QuotaExceeded => Error::QuotaExceededRemote {
            channel_id,
            message,
        },
        ErrorKind::ServerError => Error::TransientServerError {
            channel_id,
            message,
        },
        ErrorKind::Unauthorized => Error::Unauthorized {
            channel_id,
            message,
        },
        ErrorKind::Other => Error::Remote {
            channel_id,
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use channel_auth::Credential;
    use channel_store::{ChannelStore, JsonChannelStore};

    use crate::clock::{Clock, ManualClock};
    use crate::config::{ChannelSettings, PoolSettings};
    use crate::registry::ChannelConfig;
    use crate::status::HealthState;
    use crate::testing::{DAY, ScriptedRefresher, test_store};

    const FAR: u64 = 4_102_444_800_000;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<JsonChannelStore>,
        clock: Arc<ManualClock>,
        refresher: Arc<ScriptedRefresher>,
        executor: Arc<Executor>,
    }

    async fn harness(refresher: ScriptedRefresher) -> Harness {
        let (dir, store) = test_store(&[]).await;
        let clock = Arc::new(ManualClock::new(0));
        let refresher = Arc::new(refresher);
        let registry = Registry::new(
            PoolSettings::default(),
            store.clone(),
            refresher.clone(),
            clock.clone(),
        )
        .unwrap();
        Harness {
            _dir: dir,
            store,
            clock,
            refresher,
            executor: Arc::new(Executor::new(Arc::new(registry))),
        }
    }

    impl Harness {
        async fn add(&self, id: &str, expires: u64, settings: Option<ChannelSettings>) {
            self.executor
                .registry()
                .register(ChannelConfig {
                    id: id.into(),
                    name: format!("Channel {id}"),
                    credential: Some(Credential::new(format!("at_{id}"), Some(format!("rt_{id}")), expires)),
                    settings,
                })
                .await
                .unwrap();
        }

        async fn status(&self, id: &str) -> crate::status::ChannelStatus {
            self.executor.registry().get(id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn success_commits_cost_and_passes_token() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add("UC1", FAR, None).await;

        let outcome = h
            .executor
            .execute(Some("UC1"), 1_600, |token| async move {
                Ok::<_, RemoteError>(token.expose().clone())
            })
            .await
            .unwrap();
        assert_eq!(outcome.channel_id, "UC1");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.value, "at_UC1");

        let status = h.status("UC1").await;
        assert_eq!(status.quota_used, 1_600);
        assert_eq!(status.quota_reserved, 0);
        assert_eq!(status.last_used_at, Some(0));
        let record = h.store.load_channel("UC1").await.unwrap().unwrap();
        assert_eq!(record.quota.used, 1_600, "flushed after 10+ units");
    }

    #[tokio::test]
    async fn server_errors_back_off_exponentially_then_surface() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add("B", FAR, None).await;

        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let result = h
            .executor
            .execute(Some("B"), 100, |_token| {
                let calls = calls.clone();
                let clock = h.clock.clone();
                async move {
                    calls.lock().push(clock.now_millis());
                    Err::<(), _>(RemoteError::server_error("503 backend error"))
                }
            })
            .await;

        match result {
            Err(Error::TransientServerError { channel_id, .. }) => assert_eq!(channel_id, "B"),
            other => panic!("expected TransientServerError, got {other:?}"),
        }

        let times = calls.lock().clone();
        assert_eq!(times.len(), 4, "one attempt plus three retries");
        let deltas: Vec<u64> = times.windows(2).map(|w| w[1] - w[0]).collect();
        for (delta, base) in deltas.iter().zip([1_000u64, 2_000, 4_000]) {
            assert!(
                *delta >= base && *delta <= base + base / 10,
                "delta {delta} outside [{base}, {}]",
                base + base / 10
            );
        }

        let status = h.status("B").await;
        assert_eq!(status.retry_count, 4);
        assert_eq!(status.consecutive_errors, 4);
        assert_eq!(status.state, HealthState::Suspended);
        assert_eq!(status.quota_used, 0, "failed operation charges nothing");
        assert_eq!(status.quota_reserved, 0);
        assert!(status.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn remote_quota_exhaustion_excludes_channel_until_reset() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add("C", FAR, None).await;
        let calls = AtomicU32::new(0);

        let err = h
            .executor
            .execute(Some("C"), 100, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::quota_exceeded("quotaExceeded")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceededRemote { .. }), "got: {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "not retried");
        assert_eq!(h.status("C").await.quota_used, 10_000);

        let selector = h.executor.selector();
        h.clock.set(DAY / 2);
        assert!(matches!(
            selector.select_best(1).await.unwrap_err(),
            Error::NoEligibleChannel { .. }
        ));

        h.clock.set(DAY);
        assert_eq!(selector.select_best(1).await.unwrap().id, "C");
    }

    #[tokio::test]
    async fn stale_credential_is_refreshed_transparently() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add("UC1", 30_000, None).await;

        let outcome = h
            .executor
            .execute(Some("UC1"), 1, |token| async move {
                Ok::<_, RemoteError>(token.expose().clone())
            })
            .await
            .unwrap();
        assert_eq!(outcome.value, "at_refreshed_1");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(h.refresher.calls(), 1);
        let record = h.store.load_channel("UC1").await.unwrap().unwrap();
        assert_eq!(record.credential.access, "at_refreshed_1");
    }

    #[tokio::test]
    async fn credential_failure_surfaces_without_calling_operation() {
        let h = harness(ScriptedRefresher::failing()).await;
        h.add("UC1", 0, None).await;
        let calls = AtomicU32::new(0);

        let err = h
            .executor
            .execute(Some("UC1"), 100, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, RemoteError>(()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Credential { .. }), "got: {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.refresher.calls(), 1, "refresh is not retried");

        let status = h.status("UC1").await;
        assert_eq!(status.consecutive_errors, 1);
        assert_eq!(status.quota_reserved, 0);
    }

    #[tokio::test]
    async fn insufficient_quota_is_not_attempted() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add(
            "UC1",
            FAR,
            Some(ChannelSettings {
                quota_limit: 1_000,
                ..ChannelSettings::default()
            }),
        )
        .await;

        let err = h
            .executor
            .execute(Some("UC1"), 1_001, |_token| async { Ok::<_, RemoteError>(()) })
            .await
            .unwrap_err();
        match err {
            Error::InsufficientQuota { cost, remaining, .. } => {
                assert_eq!(cost, 1_001);
                assert_eq!(remaining, 1_000);
            }
            other => panic!("expected InsufficientQuota, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cooling_down_channel_is_suspended() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add("UC1", FAR, None).await;
        let entry = h.executor.registry().entry("UC1").await.unwrap();
        h.executor
            .registry()
            .record_failure(
                &entry,
                &RemoteError::rate_limited(Some(Duration::from_secs(30)), "slow down"),
            )
            .await;

        let err = h
            .executor
            .execute(Some("UC1"), 1, |_token| async { Ok::<_, RemoteError>(()) })
            .await
            .unwrap_err();
        assert!(err.is_retry_later());
        match err {
            Error::ChannelSuspended { retry_in, .. } => {
                assert_eq!(retry_in, Duration::from_secs(30))
            }
            other => panic!("expected ChannelSuspended, got {other:?}"),
        }
        assert_eq!(h.status("UC1").await.quota_reserved, 0);
    }

    #[tokio::test]
    async fn rate_limit_hint_is_honored_then_success_resets() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add("UC1", FAR, None).await;
        let calls = AtomicU32::new(0);

        let outcome = h
            .executor
            .execute(Some("UC1"), 50, |_token| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(RemoteError::rate_limited(Some(Duration::from_secs(5)), "429"))
                    } else {
                        Ok("uploaded")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(h.clock.now_millis(), 5_000);

        let status = h.status("UC1").await;
        assert_eq!(status.quota_used, 50, "charged once per logical operation");
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.consecutive_errors, 0);
        assert_eq!(status.state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn retry_hint_beyond_backoff_cap_is_returned_not_slept() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add("UC1", FAR, None).await;
        let calls = AtomicU32::new(0);
        let hint = Duration::from_secs(7_200);

        let err = h
            .executor
            .execute(Some("UC1"), 50, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(RemoteError::rate_limited(Some(hint), "429")) }
            })
            .await
            .unwrap_err();
        match err {
            Error::RateLimited { retry_after, .. } => assert_eq!(retry_after, Some(hint)),
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.clock.now_millis(), 0, "no in-call wait");

        let status = h.status("UC1").await;
        assert_eq!(status.next_retry_at, Some(7_200_000));
        assert_eq!(status.quota_used, 0);
        assert_eq!(status.quota_reserved, 0);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried_and_forces_refresh() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add("UC1", FAR, None).await;

        let err = h
            .executor
            .execute(Some("UC1"), 1, |_token| async {
                Err::<(), _>(RemoteError::unauthorized("401 invalid credentials"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }), "got: {err:?}");
        assert_eq!(h.refresher.calls(), 0);

        let outcome = h
            .executor
            .execute(Some("UC1"), 1, |token| async move {
                Ok::<_, RemoteError>(token.expose().clone())
            })
            .await
            .unwrap();
        assert_eq!(outcome.value, "at_refreshed_1");
    }

    #[tokio::test]
    async fn automatic_selection_picks_eligible_channel() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add("A", FAR, None).await;
        h.add("B", FAR, None).await;
        h.executor.registry().deregister("A").await.unwrap();

        let outcome = h
            .executor
            .execute(None, 1_600, |_token| async { Ok::<_, RemoteError>(()) })
            .await
            .unwrap();
        assert_eq!(outcome.channel_id, "B");
    }

    #[tokio::test]
    async fn unknown_or_inactive_channel_is_rejected() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add("A", FAR, None).await;
        h.executor.registry().deregister("A").await.unwrap();

        let err = h
            .executor
            .execute(Some("nope"), 1, |_token| async { Ok::<_, RemoteError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = h
            .executor
            .execute(Some("A"), 1, |_token| async { Ok::<_, RemoteError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inactive(_)));
    }

    #[tokio::test]
    async fn concurrent_executions_never_exceed_limit() {
        let h = harness(ScriptedRefresher::succeeding()).await;
        h.add(
            "UC1",
            FAR,
            Some(ChannelSettings {
                quota_limit: 1_000,
                ..ChannelSettings::default()
            }),
        )
        .await;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let executor = h.executor.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .execute(Some("UC1"), 100, |_token| async {
                        tokio::task::yield_now().await;
                        Ok::<_, RemoteError>(())
                    })
                    .await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(Error::InsufficientQuota { .. }) => {}
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!(succeeded, 10);
        let status = h.status("UC1").await;
        assert_eq!(status.quota_used, 1_000);
        assert_eq!(status.quota_reserved, 0);
    }
}
