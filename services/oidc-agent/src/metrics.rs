//! Prometheus metrics exposition
//!
//! The engine crates emit:
//!
//! - `oidc_validation_total` (counter): label `result`
//! - `oidc_renewals_total` (counter): label `outcome`
//! - `oidc_session_changed_total` (counter): label `reason`
//!
//! The agent adds:
//!
//! - `oidc_agent_requests_total` (counter): labels `route`, `status`
//! - `oidc_agent_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("oidc_agent_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a completed route call.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    let route = route.to_string();
    metrics::counter!("oidc_agent_requests_total", "route" => route.clone(), "status" => status.to_string())
        .increment(1);
    metrics::histogram!("oidc_agent_request_duration_seconds", "route" => route)
        .record(duration_secs);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder()
        .expect("failed to set histogram buckets")
        .build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
