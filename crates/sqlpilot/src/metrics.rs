use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_QUERIES: OnceLock<IntGauge> = OnceLock::new();
static REPAIR_ATTEMPTS: OnceLock<IntCounter> = OnceLock::new();
static DROPPED_EVENTS: OnceLock<IntCounter> = OnceLock::new();
static FEEDBACK_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static QUERY_DURATION: OnceLock<Histogram> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .expect("valid requests_total metric")
    });

    let active_queries = ACTIVE_QUERIES.get_or_init(|| {
        IntGauge::new("active_queries", "Queries currently being orchestrated")
            .expect("valid active_queries metric")
    });

    let repair_attempts = REPAIR_ATTEMPTS.get_or_init(|| {
        IntCounter::new("repair_attempts_total", "Regenerations after a failed execution")
            .expect("valid repair_attempts_total metric")
    });

    let dropped_events = DROPPED_EVENTS.get_or_init(|| {
        IntCounter::new(
            "progress_events_dropped_total",
            "Progress events dropped because a stream channel was full",
        )
        .expect("valid progress_events_dropped_total metric")
    });

    let feedback_counter = FEEDBACK_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("feedback_total", "Feedback events by polarity"),
            &["polarity"],
        )
        .expect("valid feedback_total metric")
    });

    let query_duration = QUERY_DURATION.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "query_duration_seconds",
            "Wall time from submission to terminal state",
        ))
        .expect("valid query_duration_seconds metric")
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(active_queries.clone())).ok();
    REGISTRY.register(Box::new(repair_attempts.clone())).ok();
    REGISTRY.register(Box::new(dropped_events.clone())).ok();
    REGISTRY.register(Box::new(feedback_counter.clone())).ok();
    REGISTRY.register(Box::new(query_duration.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_active_queries() {
    if let Some(gauge) = ACTIVE_QUERIES.get() {
        gauge.inc();
    }
}

pub fn dec_active_queries() {
    if let Some(gauge) = ACTIVE_QUERIES.get() {
        gauge.dec();
    }
}

pub fn inc_repair_attempts() {
    if let Some(counter) = REPAIR_ATTEMPTS.get() {
        counter.inc();
    }
}

pub fn inc_dropped_events() {
    if let Some(counter) = DROPPED_EVENTS.get() {
        counter.inc();
    }
}

pub fn inc_feedback(polarity: &str) {
    if let Some(counter) = FEEDBACK_COUNTER.get() {
        counter.with_label_values(&[polarity]).inc();
    }
}

pub fn observe_query_duration(seconds: f64) {
    if let Some(histogram) = QUERY_DURATION.get() {
        histogram.observe(seconds);
    }
}

/// Registry contents in the Prometheus text exposition format.
pub fn render() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    buffer
}

#[cfg(feature = "cli")]
pub async fn get_metrics() -> impl axum::response::IntoResponse {
    (
        axum::http::StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render_after_init() {
        init_metrics();
        inc_dropped_events();
        inc_request("chat_query", "ok");
        let text = String::from_utf8(render()).unwrap();
        assert!(text.contains("progress_events_dropped_total"));
        assert!(text.contains("requests_total"));
    }

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        inc_feedback("thumbs_up");
    }
}
