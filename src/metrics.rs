use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics exporter
///
/// Fails if a recorder is already installed (e.g., in tests)
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    init_metric_descriptions();

    Ok(handle)
}

/// Initialize metric descriptions (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!(
        "telemetry_events_total",
        "Log events accepted by the filter"
    );
    describe_counter!(
        "telemetry_events_filtered_total",
        "Log events rejected by the filter"
    );
    describe_counter!(
        "telemetry_sink_records_total",
        "Records written to a sink destination"
    );
    describe_counter!(
        "telemetry_sink_dropped_total",
        "Records a sink destination dropped"
    );
    describe_histogram!(
        "telemetry_sink_flush_duration_seconds",
        "Time spent flushing a batch to a sink destination"
    );
    describe_gauge!(
        "telemetry_info",
        "Build information"
    );

    gauge!("telemetry_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

/// Record an event the filter accepted
pub fn record_event_accepted(kind: &'static str) {
    counter!("telemetry_events_total", "kind" => kind).increment(1);
}

/// Record an event the filter rejected
pub fn record_event_filtered(status: u16) {
    counter!("telemetry_events_filtered_total", "status" => status.to_string()).increment(1);
}

/// Record records delivered to a destination
pub fn record_sink_written(destination: &'static str, count: u64) {
    counter!("telemetry_sink_records_total", "destination" => destination).increment(count);
}

/// Record records a destination lost
pub fn record_sink_dropped(destination: &'static str, reason: &'static str, count: u64) {
    counter!(
        "telemetry_sink_dropped_total",
        "destination" => destination,
        "reason" => reason
    )
    .increment(count);
}

/// Record batch flush latency
pub fn record_flush_duration(destination: &'static str, duration: Duration) {
    histogram!(
        "telemetry_sink_flush_duration_seconds",
        "destination" => destination
    )
    .record(duration.as_secs_f64());
}
