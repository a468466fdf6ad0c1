//! Prometheus metrics exposition
//!
//! The pool emits its counters and gauges through the `metrics` facade:
//!
//! - `channel_operations_total` (counter): labels `channel`, `outcome`
//! - `channel_retries_total` (counter): labels `channel`, `kind`
//! - `channel_credential_refresh_total` (counter): labels `channel`, `outcome`
//! - `channel_quota_used` (gauge): label `channel`
//!
//! The service adds `channel_manager_requests_total` for its own HTTP API.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{Error, Result};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Must run before the registry is built so registration gauges are kept.
pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Metrics(e.to_string()))
}

/// Record an API request by route and response status.
pub fn record_request(route: &str, status: u16) {
    metrics::counter!(
        "channel_manager_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
