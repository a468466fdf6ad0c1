//! Quota-aware channel pool
//!
//! Tracks a time-windowed quota per channel, picks the best channel for an
//! operation of a given cost, and runs remote operations through a
//! credential that may need refreshing mid-flight, retrying transient
//! failures with bounded per-channel backoff.
//!
//! Channel lifecycle:
//! 1. `Registry::register` resumes persisted quota and health state
//! 2. `Selector::select_best` ranks eligible channels by remaining quota,
//!    least recently used first within the tie band
//! 3. `Executor::execute` reserves the cost, ensures a fresh access token,
//!    runs the operation and commits the cost on success
//! 4. Failures move the channel Healthy → Degraded → Suspended; the
//!    cool-down expires on its own and the next success restores Healthy
//! 5. Background tasks roll quota windows over and refresh expiring tokens

pub mod backoff;
pub mod classify;
pub mod clock;
pub mod config;
pub mod credential;
pub mod error;
pub mod executor;
pub mod maintenance;
mod metrics;
pub mod quota;
pub mod registry;
pub mod selector;
pub mod status;

#[cfg(test)]
mod testing;

pub use backoff::{BackoffPolicy, BackoffState, Decision};
pub use classify::{ErrorKind, RemoteError, classify_status, parse_retry_after};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ChannelSettings, PoolSettings};
pub use credential::CredentialManager;
pub use error::{Error, Result};
pub use executor::{Executor, Outcome};
pub use maintenance::{spawn_quota_reset_task, spawn_refresh_task};
pub use quota::QuotaLedger;
pub use registry::{ChannelConfig, Registry};
pub use selector::{Selector, rank};
pub use status::{ChannelStatus, HealthState, IneligibleCounts, PoolHealth};
