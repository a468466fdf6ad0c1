//! Read-only channel and pool status for dashboards

use serde::Serialize;

/// Health of one channel.
///
/// - Healthy: no failures since the last success
/// - Degraded: some consecutive failures, still selectable
/// - Suspended: error ceiling reached or suspension cool-down running;
///   expires on its own once the cool-down elapses
/// - Inactive: deregistered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Suspended,
    Inactive,
}

impl HealthState {
    pub fn label(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Suspended => "suspended",
            HealthState::Inactive => "inactive",
        }
    }
}

/// Snapshot of one channel's runtime state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub state: HealthState,
    pub quota_used: u64,
    pub quota_reserved: u64,
    pub quota_limit: u64,
    pub quota_soft_limit: u64,
    pub quota_remaining: u64,
    pub quota_reset_at: u64,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<u64>,
    /// Milliseconds until the channel may be used again, if cooling down
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
    pub consecutive_errors: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
}

/// Why a channel was left out of selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    Inactive,
    CoolingDown,
    ErrorCeiling,
    OverSoftLimit,
}

/// Per-reason tally from one eligibility scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IneligibleCounts {
    pub inactive: usize,
    pub cooling_down: usize,
    pub error_ceiling: usize,
    pub over_quota: usize,
}

impl IneligibleCounts {
    pub fn add(&mut self, reason: Ineligible) {
        match reason {
            Ineligible::Inactive => self.inactive += 1,
            Ineligible::CoolingDown => self.cooling_down += 1,
            Ineligible::ErrorCeiling => self.error_ceiling += 1,
            Ineligible::OverSoftLimit => self.over_quota += 1,
        }
    }
}

/// Pool-wide health summary.
///
/// `healthy` when every active channel is healthy, `degraded` when at least
/// one channel is still eligible, `unhealthy` when none is.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub status: &'static str,
    pub channels_total: usize,
    pub channels_eligible: usize,
    pub ineligible: IneligibleCounts,
    pub channels: Vec<ChannelStatus>,
}

impl PoolHealth {
    pub fn new(channels: Vec<ChannelStatus>, eligible: usize, ineligible: IneligibleCounts) -> Self {
        let active: Vec<&ChannelStatus> = channels.iter().filter(|c| c.active).collect();
        let status = if eligible == 0 {
            "unhealthy"
        } else if active.iter().all(|c| c.state == HealthState::Healthy) {
            "healthy"
        } else {
            "degraded"
        };
        Self {
            status,
            channels_total: channels.len(),
            channels_eligible: eligible,
            ineligible,
            channels,
        }
    }

    pub fn is_available(&self) -> bool {
        self.channels_eligible > 0
    }
}
