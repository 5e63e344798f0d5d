//! Prometheus metrics surface.

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder};
use std::time::Duration;

static HOOK_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "streamgate_hook_requests_total",
            "Hook requests handled, by action and business code",
        ),
        &["action", "code"],
    )
    .expect("failed to create streamgate_hook_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register streamgate_hook_requests_total");
    counter
});

static HOOK_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "streamgate_hook_request_duration_seconds",
            "Hook request latency",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
        ]),
        &["action"],
    )
    .expect("failed to create streamgate_hook_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register streamgate_hook_request_duration_seconds");
    histogram
});

pub fn observe_hook_request(action: &str, code: i32, elapsed: Duration) {
    let code_label = code.to_string();
    HOOK_REQUESTS_TOTAL
        .with_label_values(&[action, &code_label])
        .inc();
    HOOK_REQUEST_DURATION_SECONDS
        .with_label_values(&[action])
        .observe(elapsed.as_secs_f64());
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
