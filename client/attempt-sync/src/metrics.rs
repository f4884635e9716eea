use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::ApiError;

lazy_static! {
    // Transport
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempt_api_requests_total",
        "Total number of requests sent to the attempt API",
        &["endpoint", "status"]
    )
    .unwrap();

    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "attempt_api_request_duration_seconds",
        "Attempt API request duration in seconds",
        &["endpoint"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Answers
    pub static ref ANSWER_SAVES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "answer_saves_total",
        "Answer delivery attempts by path and result",
        &["path", "status"]
    )
    .unwrap();

    pub static ref ANSWERS_QUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "answers_queued_total",
        "Answers placed in the durable queue",
        &["reason"]
    )
    .unwrap();

    pub static ref ANSWERS_ABANDONED_TOTAL: IntCounter = register_int_counter!(
        "answers_abandoned_total",
        "Answers dropped after exhausting their retries"
    )
    .unwrap();

    pub static ref ANSWERS_PENDING: IntGauge = register_int_gauge!(
        "answers_pending",
        "Answers waiting in the durable queue"
    )
    .unwrap();

    pub static ref SYNC_PASSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sync_passes_total",
        "Sync passes over the durable answer queue",
        &["outcome"]
    )
    .unwrap();

    pub static ref QUEUE_STORAGE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "queue_storage_errors_total",
        "Failures reading or writing the durable answer queue",
        &["operation"]
    )
    .unwrap();

    // Telemetry
    pub static ref TELEMETRY_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "telemetry_events_total",
        "Behavioral events buffered for upload",
        &["event_type"]
    )
    .unwrap();

    pub static ref TELEMETRY_FLUSHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "telemetry_flushes_total",
        "Telemetry batch flushes by trigger and result",
        &["trigger", "status"]
    )
    .unwrap();

    pub static ref TELEMETRY_EVENTS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "telemetry_events_dropped_total",
        "Behavioral events lost because their batch failed to upload",
        &["reason"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track an attempt API call with metrics
pub async fn track_api_call<F, T>(endpoint: &str, future: F) -> Result<T, ApiError>
where
    F: std::future::Future<Output = Result<T, ApiError>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = match &result {
        Ok(_) => "success",
        Err(err) => err.label(),
    };

    API_REQUESTS_TOTAL
        .with_label_values(&[endpoint, status])
        .inc();

    API_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint])
        .observe(duration);

    result
}
