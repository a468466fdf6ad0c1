//! Channel registry
//!
//! The registry owns every channel's runtime state and is the single source
//! of truth for the selector and executor. Each channel sits behind its own
//! locks, so read-modify-write sequences on one channel are serialized while
//! different channels proceed in parallel:
//!
//! - `state` (parking_lot Mutex): quota ledger, backoff, error metadata.
//!   Held only for in-memory updates, never across an await.
//! - `credential` (tokio Mutex): held across a refresh exchange so
//!   concurrent callers share one refresh instead of racing to rotate the
//!   refresh token.
//!
//! Storage is written through for credentials and opportunistically for
//! quota counters and health metadata; a failed opportunistic write is
//! logged and retried on the next flush.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use channel_auth::{Credential, Secret, TokenRefresher};
use channel_store::{ChannelRecord, ChannelStore, HealthRecord, QuotaRecord};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffState, Decision, jitter_sample};
use crate::classify::{ErrorKind, RemoteError};
use crate::clock::Clock;
use crate::config::{ChannelSettings, PoolSettings};
use crate::credential::CredentialManager;
use crate::error::{Error, Result};
use crate::metrics;
use crate::quota::QuotaLedger;
use crate::status::{ChannelStatus, HealthState, Ineligible, IneligibleCounts, PoolHealth};

/// Registration request for one channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,
    /// Initial credential, used only when storage has no record yet.
    /// A stored credential always wins: it may hold a rotated refresh token.
    pub credential: Option<Credential>,
    /// `None` applies the pool defaults.
    pub settings: Option<ChannelSettings>,
}

/// Mutable runtime state of one channel.
#[derive(Debug)]
pub(crate) struct ChannelState {
    name: String,
    active: bool,
    settings: ChannelSettings,
    pub(crate) ledger: QuotaLedger,
    backoff: BackoffState,
    consecutive_errors: u32,
    suspended_until: Option<u64>,
    last_used_at: Option<u64>,
    last_error: Option<String>,
}

/// Storage writes owed after a locked update.
#[derive(Debug, Default)]
pub(crate) struct Dirty {
    quota: Option<QuotaRecord>,
    health: Option<HealthRecord>,
}

impl ChannelState {
    fn from_record(record: &ChannelRecord, settings: ChannelSettings) -> Self {
        let ledger = QuotaLedger::new(
            QuotaRecord {
                limit: settings.quota_limit,
                ..record.quota
            },
            settings.soft_limit(),
            settings.window().as_millis() as u64,
            settings.flush_every,
        );
        Self {
            name: record.name.clone(),
            active: true,
            ledger,
            backoff: BackoffState {
                retry_count: record.health.retry_count,
                next_retry_at: record.health.next_retry_at,
            },
            consecutive_errors: record.health.consecutive_errors,
            suspended_until: record.health.suspended_until,
            last_used_at: record.health.last_used_at,
            last_error: record.health.last_error.clone(),
            settings,
        }
    }

    fn apply_settings(&mut self, settings: ChannelSettings) {
        self.ledger.set_limits(
            settings.quota_limit,
            settings.soft_limit(),
            settings.flush_every,
        );
        self.settings = settings;
    }

    fn health_record(&self) -> HealthRecord {
        HealthRecord {
            consecutive_errors: self.consecutive_errors,
            retry_count: self.backoff.retry_count,
            next_retry_at: self.backoff.next_retry_at,
            suspended_until: self.suspended_until,
            last_used_at: self.last_used_at,
            last_error: self.last_error.clone(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    /// Time left before the channel may run another operation: the longer
    /// of the backoff wait and any ceiling suspension.
    pub(crate) fn cooldown_remaining(&self, now: u64) -> Option<Duration> {
        let suspension = match self.suspended_until {
            Some(until) if now < until => Some(Duration::from_millis(until - now)),
            _ => None,
        };
        match (self.backoff.remaining(now), suspension) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Apply time-driven transitions: quota window rollover and suspension
    /// expiry. A channel whose cool-down elapsed while at the error ceiling
    /// goes on probation one failure below it.
    pub(crate) fn tick(&mut self, channel_id: &str, now: u64) -> Dirty {
        let mut dirty = Dirty::default();
        if self.ledger.maybe_reset(now) {
            info!(channel_id, reset_at = self.ledger.reset_at(), "quota window reset");
            metrics::set_quota_used(channel_id, 0);
            dirty.quota = Some(self.ledger.record());
        }

        if self.suspended_until.is_some_and(|until| now >= until) {
            self.suspended_until = None;
            dirty.health = Some(self.health_record());
        }

        let ceiling = self.settings.error_ceiling;
        if self.consecutive_errors >= ceiling && self.cooldown_remaining(now).is_none() {
            info!(
                channel_id,
                consecutive_errors = self.consecutive_errors,
                "suspension elapsed, channel on probation"
            );
            self.consecutive_errors = ceiling - 1;
            dirty.health = Some(self.health_record());
        }
        dirty
    }

    pub(crate) fn ineligibility(&self, cost: u64, now: u64) -> Option<Ineligible> {
        if !self.active {
            Some(Ineligible::Inactive)
        } else if self.cooldown_remaining(now).is_some() {
            Some(Ineligible::CoolingDown)
        } else if self.consecutive_errors >= self.settings.error_ceiling {
            Some(Ineligible::ErrorCeiling)
        } else if !self.ledger.fits_soft(cost) {
            Some(Ineligible::OverSoftLimit)
        } else {
            None
        }
    }

    /// Count a failure. Without a pending backoff wait, reaching the error
    /// ceiling imposes the suspension cool-down.
    fn note_failure(&mut self, channel_id: &str, message: String, decision: Decision, now: u64) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error = Some(message);
        if !decision.retry
            && self.consecutive_errors >= self.settings.error_ceiling
            && self.cooldown_remaining(now).is_none()
        {
            let suspension = self.settings.suspension();
            warn!(
                channel_id,
                consecutive_errors = self.consecutive_errors,
                suspension_secs = suspension.as_secs(),
                "error ceiling reached, channel suspended"
            );
            self.suspended_until = Some(now.saturating_add(suspension.as_millis() as u64));
        }
    }

    fn health_state(&self, now: u64) -> HealthState {
        if !self.active {
            HealthState::Inactive
        } else if self.consecutive_errors >= self.settings.error_ceiling
            || self.suspended_until.is_some_and(|until| now < until)
        {
            HealthState::Suspended
        } else if self.consecutive_errors > 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    pub(crate) fn snapshot(&self, channel_id: &str, now: u64) -> ChannelStatus {
        let cooldown = self.cooldown_remaining(now);
        ChannelStatus {
            id: channel_id.to_string(),
            name: self.name.clone(),
            active: self.active,
            state: self.health_state(now),
            quota_used: self.ledger.used(),
            quota_reserved: self.ledger.reserved(),
            quota_limit: self.ledger.limit(),
            quota_soft_limit: self.ledger.soft_limit(),
            quota_remaining: self.ledger.remaining(),
            quota_reset_at: self.ledger.reset_at(),
            retry_count: self.backoff.retry_count,
            next_retry_at: self.backoff.next_retry_at,
            retry_in_ms: cooldown.map(|d| d.as_millis() as u64),
            consecutive_errors: self.consecutive_errors,
            last_error: self.last_error.clone(),
            last_used_at: self.last_used_at,
        }
    }
}

/// One registered channel.
pub(crate) struct ChannelEntry {
    pub(crate) id: String,
    pub(crate) state: parking_lot::Mutex<ChannelState>,
    credential: tokio::sync::Mutex<Credential>,
}

/// Admitted quota held for one in-flight operation.
///
/// Dropping an unsettled reservation hands the units back, so a failed or
/// cancelled `execute` never leaks admitted quota.
pub(crate) struct Reservation {
    entry: Arc<ChannelEntry>,
    cost: u64,
    settled: bool,
}

impl Reservation {
    pub(crate) fn entry(&self) -> &Arc<ChannelEntry> {
        &self.entry
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.entry.state.lock().ledger.release(self.cost);
        }
    }
}

/// Result of evaluating every channel against a cost.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub(crate) all: Vec<ChannelStatus>,
    pub(crate) eligible: Vec<ChannelStatus>,
    pub(crate) ineligible: IneligibleCounts,
}

impl Scan {
    pub(crate) fn summary(&self) -> String {
        let c = &self.ineligible;
        format!(
            "{} of {} channels eligible (inactive: {}, cooling_down: {}, error_ceiling: {}, over_quota: {})",
            self.eligible.len(),
            self.all.len(),
            c.inactive,
            c.cooling_down,
            c.error_ceiling,
            c.over_quota
        )
    }
}

/// The set of known channels and their runtime state.
pub struct Registry {
    channels: RwLock<HashMap<String, Arc<ChannelEntry>>>,
    store: Arc<dyn ChannelStore>,
    credentials: CredentialManager,
    clock: Arc<dyn Clock>,
    settings: PoolSettings,
}

impl Registry {
    pub fn new(
        settings: PoolSettings,
        store: Arc<dyn ChannelStore>,
        refresher: Arc<dyn TokenRefresher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;
        let credentials = CredentialManager::new(refresher, store.clone(), settings.renewal_margin());
        Ok(Self {
            channels: RwLock::new(HashMap::new()),
            store,
            credentials,
            clock,
            settings,
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Register a channel, resuming persisted quota and health state.
    ///
    /// Re-registering a known channel reactivates it and applies the new
    /// name and settings without touching its counters.
    pub async fn register(&self, config: ChannelConfig) -> Result<ChannelStatus> {
        let settings = config
            .settings
            .unwrap_or_else(|| self.settings.defaults.clone());
        settings.validate()?;
        let now = self.now();

        let existing = self.channels.read().await.get(&config.id).cloned();
        if let Some(entry) = existing {
            let status = {
                let mut state = entry.state.lock();
                state.active = true;
                state.name = config.name;
                state.apply_settings(settings);
                state.snapshot(&entry.id, now)
            };
            self.store.set_active(&entry.id, true).await?;
            info!(channel_id = %entry.id, "channel re-registered");
            return Ok(status);
        }

        let record = match self.store.load_channel(&config.id).await? {
            Some(mut record) => {
                debug!(channel_id = %config.id, used = record.quota.used, "resuming persisted channel state");
                record.active = true;
                record.name = config.name;
                record.quota.limit = settings.quota_limit;
                record
            }
            None => {
                let credential = config.credential.ok_or_else(|| Error::Credential {
                    channel_id: config.id.clone(),
                    message: "no stored or configured credential".into(),
                })?;
                ChannelRecord {
                    id: config.id.clone(),
                    name: config.name,
                    active: true,
                    credential,
                    quota: QuotaRecord {
                        used: 0,
                        limit: settings.quota_limit,
                        reset_at: now.saturating_add(settings.window().as_millis() as u64),
                    },
                    health: HealthRecord::default(),
                }
            }
        };
        self.store.save_channel(record.clone()).await?;

        let state = ChannelState::from_record(&record, settings);
        let entry = Arc::new(ChannelEntry {
            id: record.id.clone(),
            state: parking_lot::Mutex::new(state),
            credential: tokio::sync::Mutex::new(record.credential),
        });

        let entry = self
            .channels
            .write()
            .await
            .entry(record.id.clone())
            .or_insert(entry)
            .clone();
        let status = entry.state.lock().snapshot(&entry.id, now);
        metrics::set_quota_used(&entry.id, status.quota_used);
        info!(
            channel_id = %entry.id,
            quota_used = status.quota_used,
            quota_limit = status.quota_limit,
            "channel registered"
        );
        Ok(status)
    }

    /// Soft delete: the channel stays known and its record stays in storage,
    /// but it is never selected or executed against again until re-registered.
    pub async fn deregister(&self, channel_id: &str) -> Result<()> {
        let entry = self.entry(channel_id).await?;
        entry.state.lock().active = false;
        self.store.set_active(channel_id, false).await?;
        info!(channel_id, "channel deregistered");
        Ok(())
    }

    pub async fn get(&self, channel_id: &str) -> Result<ChannelStatus> {
        let entry = self.entry(channel_id).await?;
        let now = self.now();
        let (status, dirty) = {
            let mut state = entry.state.lock();
            let dirty = state.tick(channel_id, now);
            (state.snapshot(channel_id, now), dirty)
        };
        self.flush(channel_id, dirty).await;
        Ok(status)
    }

    /// Channels eligible for an operation costing `cost`.
    pub async fn list_eligible(&self, cost: u64) -> Vec<ChannelStatus> {
        self.scan(cost).await.eligible
    }

    /// Status of one channel, or of every channel when `channel_id` is `None`.
    pub async fn status(&self, channel_id: Option<&str>) -> Result<Vec<ChannelStatus>> {
        match channel_id {
            Some(id) => Ok(vec![self.get(id).await?]),
            None => Ok(self.scan(0).await.all),
        }
    }

    pub async fn health(&self) -> PoolHealth {
        let scan = self.scan(0).await;
        PoolHealth::new(scan.all, scan.eligible.len(), scan.ineligible)
    }

    pub async fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Bulk pass for the periodic trigger: roll over every channel whose
    /// window has ended. Returns how many were reset.
    pub async fn reset_due_quotas(&self) -> usize {
        let now = self.now();
        let mut reset = 0;
        for entry in self.entries().await {
            let record = {
                let mut state = entry.state.lock();
                state.ledger.maybe_reset(now).then(|| state.ledger.record())
            };
            if let Some(record) = record {
                reset += 1;
                metrics::set_quota_used(&entry.id, 0);
                self.flush(
                    &entry.id,
                    Dirty {
                        quota: Some(record),
                        health: None,
                    },
                )
                .await;
            }
        }
        if reset > 0 {
            info!(channels = reset, "quota windows reset");
        }
        reset
    }

    /// Refresh the channel's credential if it expires within `threshold`.
    ///
    /// Used by the proactive refresh task. Returns whether a refresh ran.
    /// Failures are recorded as the channel's last error but do not count
    /// toward its error ceiling; the request path will surface them.
    pub async fn refresh_if_expiring(&self, channel_id: &str, threshold: Duration) -> Result<bool> {
        let entry = self.entry(channel_id).await?;
        let active = entry.state.lock().active;
        if !active {
            return Ok(false);
        }

        let mut credential = entry.credential.lock().await;
        let now = self.now();
        if !CredentialManager::is_stale(&credential, now, threshold) {
            return Ok(false);
        }
        let result = self.credentials.refresh(channel_id, &mut credential, now).await;
        drop(credential);

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                let health = {
                    let mut state = entry.state.lock();
                    state.last_error = Some(e.to_string());
                    state.health_record()
                };
                self.flush(
                    channel_id,
                    Dirty {
                        quota: None,
                        health: Some(health),
                    },
                )
                .await;
                Err(e)
            }
        }
    }

    // --- executor / selector plumbing ---

    pub(crate) async fn entry(&self, channel_id: &str) -> Result<Arc<ChannelEntry>> {
        self.channels
            .read()
            .await
            .get(channel_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(channel_id.to_string()))
    }

    async fn entries(&self) -> Vec<Arc<ChannelEntry>> {
        let mut entries: Vec<Arc<ChannelEntry>> =
            self.channels.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Evaluate every channel against `cost`, applying lazy transitions.
    pub(crate) async fn scan(&self, cost: u64) -> Scan {
        let now = self.now();
        let mut scan = Scan::default();
        for entry in self.entries().await {
            let (status, reason, dirty) = {
                let mut state = entry.state.lock();
                let dirty = state.tick(&entry.id, now);
                (
                    state.snapshot(&entry.id, now),
                    state.ineligibility(cost, now),
                    dirty,
                )
            };
            self.flush(&entry.id, dirty).await;
            match reason {
                Some(reason) => scan.ineligible.add(reason),
                None => scan.eligible.push(status.clone()),
            }
            scan.all.push(status);
        }
        scan
    }

    /// Roll the window if due, then reserve `cost` against the hard limit.
    pub(crate) async fn admit(&self, entry: &Arc<ChannelEntry>, cost: u64) -> Result<Reservation> {
        let now = self.now();
        let (admitted, remaining, dirty) = {
            let mut state = entry.state.lock();
            if !state.is_active() {
                return Err(Error::Inactive(entry.id.clone()));
            }
            let dirty = state.tick(&entry.id, now);
            let admitted = state.ledger.admit(cost);
            (admitted, state.ledger.remaining(), dirty)
        };
        self.flush(&entry.id, dirty).await;

        if !admitted {
            debug!(channel_id = %entry.id, cost, remaining, "admission rejected");
            return Err(Error::InsufficientQuota {
                channel_id: entry.id.clone(),
                cost,
                remaining,
            });
        }
        Ok(Reservation {
            entry: entry.clone(),
            cost,
            settled: false,
        })
    }

    /// Current access token, refreshed first if stale. A failure counts
    /// against the channel like any other failure.
    pub(crate) async fn ensure_credential(&self, entry: &ChannelEntry) -> Result<Secret<String>> {
        let mut credential = entry.credential.lock().await;
        let result = self
            .credentials
            .ensure_valid(&entry.id, &mut credential, self.now())
            .await;
        drop(credential);

        if let Err(e) = &result {
            let now = self.now();
            let health = {
                let mut state = entry.state.lock();
                state.note_failure(&entry.id, e.to_string(), Decision::surface(), now);
                state.health_record()
            };
            self.flush(
                &entry.id,
                Dirty {
                    quota: None,
                    health: Some(health),
                },
            )
            .await;
        }
        result
    }

    /// Commit the reserved quota and reset the channel's failure state.
    pub(crate) async fn record_success(&self, mut reservation: Reservation) {
        let now = self.now();
        let entry = reservation.entry.clone();
        let (dirty, used) = {
            let mut state = entry.state.lock();
            let flush = state.ledger.commit(reservation.cost);
            reservation.settled = true;

            let was_failing = state.consecutive_errors > 0
                || state.backoff.retry_count > 0
                || state.suspended_until.is_some();
            if was_failing {
                info!(
                    channel_id = %entry.id,
                    from = state.health_state(now).label(),
                    "channel recovered"
                );
            }
            state.backoff.on_success();
            state.consecutive_errors = 0;
            state.suspended_until = None;
            state.last_used_at = Some(now);

            let dirty = Dirty {
                quota: flush.then(|| state.ledger.record()),
                health: (flush || was_failing).then(|| state.health_record()),
            };
            (dirty, state.ledger.used())
        };
        metrics::set_quota_used(&entry.id, used);
        self.flush(&entry.id, dirty).await;
    }

    /// Record a failed remote call and decide whether it may be retried.
    pub(crate) async fn record_failure(&self, entry: &ChannelEntry, error: &RemoteError) -> Decision {
        let now = self.now();
        let (decision, dirty) = {
            let mut state = entry.state.lock();
            let mut dirty = Dirty::default();
            if error.kind == ErrorKind::QuotaExceeded {
                warn!(channel_id = %entry.id, "platform reported quota exhausted");
                state.ledger.mark_exhausted();
                metrics::set_quota_used(&entry.id, state.ledger.used());
                dirty.quota = Some(state.ledger.record());
            }
            let policy = state.settings.backoff_policy();
            let mut decision = state
                .backoff
                .on_failure(&policy, &error.kind, now, jitter_sample());
            if decision.retry && decision.delay > policy.max {
                // next_retry_at still carries the full hint.
                warn!(
                    channel_id = %entry.id,
                    delay_ms = decision.delay.as_millis() as u64,
                    max_ms = policy.max.as_millis() as u64,
                    "retry hint exceeds backoff cap, not waiting in-call"
                );
                decision.retry = false;
            }
            state.note_failure(&entry.id, error.to_string(), decision, now);
            dirty.health = Some(state.health_record());
            (decision, dirty)
        };

        if error.kind == ErrorKind::Unauthorized {
            entry.credential.lock().await.invalidate();
        }
        self.flush(&entry.id, dirty).await;
        decision
    }

    /// Best-effort write of quota and health metadata.
    async fn flush(&self, channel_id: &str, dirty: Dirty) {
        if let Some(quota) = dirty.quota
            && let Err(e) = self.store.update_quota(channel_id, quota).await
        {
            warn!(channel_id, error = %e, "failed to persist quota counters");
        }
        if let Some(health) = dirty.health
            && let Err(e) = self.store.update_health(channel_id, health).await
        {
            warn!(channel_id, error = %e, "failed to persist channel health");
        }
    }
}
