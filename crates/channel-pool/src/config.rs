//! Pool and per-channel settings
//!
//! Every tunable is an explicit, defaulted field. Defaults are applied once
//! when the settings are deserialized or constructed, and `validate()` runs
//! at registration time.

use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};

/// Per-channel quota, health and backoff settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Hard ceiling of quota units per window
    pub quota_limit: u64,
    /// Quota window length
    pub window_secs: u64,
    /// Fraction of `quota_limit` treated as the soft ceiling for selection
    pub safety_threshold: f64,
    /// Consecutive failures that remove a channel from selection
    pub error_ceiling: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound of random jitter as a fraction of the exponential delay
    pub jitter_ratio: f64,
    /// Committed units between quota flushes to storage
    pub flush_every: u64,
    /// Cool-down imposed when the error ceiling is reached without a
    /// backoff wait already pending
    pub suspension_secs: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            quota_limit: 10_000,
            window_secs: 86_400,
            safety_threshold: 0.8,
            error_ceiling: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            jitter_ratio: 0.1,
            flush_every: 10,
            suspension_secs: 300,
        }
    }
}

impl ChannelSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.safety_threshold > 0.0 && self.safety_threshold <= 1.0) {
            return Err(Error::InvalidSettings(format!(
                "safety_threshold must be in (0, 1], got {}",
                self.safety_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(Error::InvalidSettings(format!(
                "jitter_ratio must be in [0, 1), got {}",
                self.jitter_ratio
            )));
        }
        if self.window_secs == 0 {
            return Err(Error::InvalidSettings(
                "window_secs must be greater than 0".into(),
            ));
        }
        if self.error_ceiling == 0 {
            return Err(Error::InvalidSettings(
                "error_ceiling must be at least 1".into(),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::InvalidSettings(format!(
                "backoff_base_ms must be in 1..={}, got {}",
                self.backoff_max_ms, self.backoff_base_ms
            )));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn suspension(&self) -> Duration {
        Duration::from_secs(self.suspension_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            jitter_ratio: self.jitter_ratio,
        }
    }

    /// Soft ceiling: `floor(limit * safety_threshold)`.
    ///
    /// The product is nudged up by a relative epsilon before flooring so
    /// that representation error (`100 * 0.29 = 28.999...`) does not cost
    /// a unit.
    pub fn soft_limit(&self) -> u64 {
        let exact = self.quota_limit as f64 * self.safety_threshold;
        let soft = (exact + exact * 1e-9).floor() as u64;
        soft.min(self.quota_limit)
    }
}

/// Settings shared by the whole pool.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Access tokens expiring within this margin are refreshed before use
    pub renewal_margin_secs: u64,
    /// Automatic retries per logical operation
    pub max_retries: u32,
    /// Remaining-quota band within which least-recently-used wins
    pub tie_tolerance: u64,
    /// Applied to channels registered without explicit settings
    pub defaults: ChannelSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            renewal_margin_secs: 60,
            max_retries: 3,
            tie_tolerance: 100,
            defaults: ChannelSettings::default(),
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate()
    }

    pub fn renewal_margin(&self) -> Duration {
        Duration::from_secs(self.renewal_margin_secs)
    }
}
