//! Pool metrics
//!
//! Emitted through the `metrics` facade; the binary installs the Prometheus
//! recorder. Without a recorder these calls are no-ops.
//!
//! - `channel_operations_total` (counter): labels `channel`, `outcome`
//! - `channel_retries_total` (counter): labels `channel`, `kind`
//! - `channel_credential_refresh_total` (counter): labels `channel`, `outcome`
//! - `channel_quota_used` (gauge): label `channel`

/// Record the final outcome of one `execute` call.
pub fn record_operation(channel_id: &str, outcome: &str) {
    metrics::counter!(
        "channel_operations_total",
        "channel" => channel_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an automatic retry scheduled after a failure of `kind`.
pub fn record_retry(channel_id: &str, kind: &str) {
    metrics::counter!(
        "channel_retries_total",
        "channel" => channel_id.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_refresh(channel_id: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!(
        "channel_credential_refresh_total",
        "channel" => channel_id.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn set_quota_used(channel_id: &str, used: u64) {
    metrics::gauge!("channel_quota_used", "channel" => channel_id.to_string()).set(used as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_operation("UC1", "success");
        record_retry("UC1", "server_error");
        record_refresh("UC1", true);
        set_quota_used("UC1", 1_600);
    }

    #[test]
    fn metrics_render_with_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_operation("UC1", "success");
        record_retry("UC2", "rate_limited");
        record_refresh("UC1", false);
        set_quota_used("UC1", 1_600);

        let output = handle.render();
        assert!(output.contains("channel_operations_total"));
        assert!(output.contains("outcome=\"success\""));
        assert!(output.contains("kind=\"rate_limited\""));
        assert!(output.contains("channel_credential_refresh_total"));
        assert!(output.contains("outcome=\"failure\""));
        assert!(output.contains("channel_quota_used{channel=\"UC1\"}"));
    }
}
