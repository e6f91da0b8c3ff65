//! Request-layer metrics
//!
//! Recorded through the `metrics` facade; calls are no-ops until a recorder
//! is installed (the binary installs the Prometheus one).
//!
//! - `api_requests_total` (counter): labels `status`, `method`
//! - `api_request_duration_seconds` (histogram): label `status`
//! - `api_errors_total` (counter): label `kind`
//! - `api_dedup_hits_total` (counter)

/// Record a request that received a final response.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("api_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("api_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a failed call, labelled with `ApiError::kind`.
pub fn record_error(kind: &'static str) {
    metrics::counter!("api_errors_total", "kind" => kind).increment(1);
}

/// Record a GET that joined an in-flight identical request.
pub fn record_dedup_hit() {
    metrics::counter!("api_dedup_hits_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, "GET", 0.05);
        record_error("timeout");
        record_dedup_hit();
    }

    #[test]
    fn record_request_carries_status_and_method() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "GET", 0.042);
        record_request(500, "POST", 1.5);

        let output = handle.render();
        assert!(output.contains("api_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("method=\"POST\""));
        assert!(output.contains("api_request_duration_seconds"));
    }

    #[test]
    fn errors_and_dedup_hits_are_counted() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_error("rate_limited");
        record_error("too_many_failures");
        record_dedup_hit();

        let output = handle.render();
        assert!(output.contains("kind=\"rate_limited\""));
        assert!(output.contains("kind=\"too_many_failures\""));
        assert!(output.contains("api_dedup_hits_total 1"));
    }
}
