//! Persisted channel record
//!
//! Timestamps are unix milliseconds. The record splits into field groups
//! (credential, quota, health) that are updated independently.

use channel_auth::Credential;
use serde::{Deserialize, Serialize};

/// Everything the store keeps about one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
    /// `false` once deregistered; the record stays for audit.
    pub active: bool,
    pub credential: Credential,
    pub quota: QuotaRecord,
    #[serde(default)]
    pub health: HealthRecord,
}

/// Quota counters for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub used: u64,
    pub limit: u64,
    /// Window boundary: `used` resets to 0 once now reaches this
    pub reset_at: u64,
}

/// Backoff and error metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub consecutive_errors: u32,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
