//! Metrics recording on the `metrics` facade, exported via Prometheus.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::{Error, Result};

/// Install the global Prometheus recorder and return its render handle.
///
/// Call once at startup. Tests build their own non-global recorder via
/// [`PrometheusBuilder::build_recorder`] instead.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Internal(format!("failed to install metrics recorder: {e}")))
}

/// Count a completed request and record its latency, by method, path,
/// status, and verified subject (`"anonymous"` when there is none).
pub fn record_request(method: &str, path: &str, status: u16, subject: &str, duration: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
        ("subject", subject.to_string()),
    ];
    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Count an authentication attempt by method and outcome.
///
/// `reason` is the rejection reason code for failures, `"ok"` on success.
pub fn record_auth_attempt(method: &str, reason: &str) {
    let labels = [
        ("method", method.to_string()),
        ("reason", reason.to_string()),
    ];
    counter!("gateway_auth_attempts_total", &labels).increment(1);
}

/// Count a rate-limit rejection by limiter class and key kind.
pub fn record_rate_limited(class: &str, key_kind: &'static str) {
    let labels = [("class", class.to_string()), ("key", key_kind.to_string())];
    counter!("gateway_rate_limited_total", &labels).increment(1);
}

/// Track in-flight requests.
pub fn inflight_add(delta: f64) {
    gauge!("gateway_inflight_requests").increment(delta);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::with_local_recorder;

    #[test]
    fn recorded_metrics_render_in_prometheus_exposition() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        with_local_recorder(&recorder, || {
            record_request("POST", "/process", 200, "user-42", Duration::from_millis(12));
            record_auth_attempt("token", "ok");
            record_auth_attempt("token", "expired");
            record_rate_limited("heavy", "subject");
        });

        let rendered = handle.render();
        assert!(rendered.contains("gateway_requests_total"));
        assert!(rendered.contains("subject=\"user-42\""));
        assert!(rendered.contains("gateway_auth_attempts_total"));
        assert!(rendered.contains("reason=\"expired\""));
        assert!(rendered.contains("gateway_rate_limited_total"));
    }
}
