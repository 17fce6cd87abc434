//! Prometheus instruments for the ingest path.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub events_ingested: IntCounter,
    pub events_duplicate: IntCounter,
    pub events_rejected: IntCounter,
    pub publish_failures: IntCounter,
    pub rate_limited: IntCounter,
    /// Events the dedup layer suppressed; the operator signal for bloom
    /// saturation (a rising rate with flat ingest means false positives).
    pub dedup_dropped: IntCounter,
    pub http_requests: IntCounterVec,
    pub http_duration: HistogramVec,
    pub dedup_check_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_ingested = IntCounter::new(
            "gateway_events_ingested_total",
            "Events accepted and published to the stream",
        )
        .expect("metric definition");
        let events_duplicate = IntCounter::new(
            "gateway_events_duplicate_total",
            "Events accepted idempotently without publishing",
        )
        .expect("metric definition");
        let events_rejected = IntCounter::new(
            "gateway_events_rejected_total",
            "Events rejected by validation",
        )
        .expect("metric definition");
        let publish_failures = IntCounter::new(
            "gateway_publish_failures_total",
            "Stream publish attempts that failed",
        )
        .expect("metric definition");
        let rate_limited = IntCounter::new(
            "gateway_rate_limited_total",
            "Requests rejected by the per-key rate limiter",
        )
        .expect("metric definition");
        let dedup_dropped = IntCounter::new(
            "gateway_dedup_dropped_total",
            "Events suppressed as duplicates by the sliding-window filter",
        )
        .expect("metric definition");
        let http_requests = IntCounterVec::new(
            Opts::new("gateway_http_requests_total", "HTTP requests by route"),
            &["method", "path", "status"],
        )
        .expect("metric definition");
        let http_duration = HistogramVec::new(
            HistogramOpts::new(
                "gateway_http_request_duration_seconds",
                "HTTP request latency by route",
            ),
            &["method", "path"],
        )
        .expect("metric definition");
        let dedup_check_duration = Histogram::with_opts(HistogramOpts::new(
            "gateway_dedup_check_duration_seconds",
            "Latency of a single dedup membership check",
        ))
        .expect("metric definition");

        for collector in [
            Box::new(events_ingested.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(events_duplicate.clone()),
            Box::new(events_rejected.clone()),
            Box::new(publish_failures.clone()),
            Box::new(rate_limited.clone()),
            Box::new(dedup_dropped.clone()),
            Box::new(http_requests.clone()),
            Box::new(http_duration.clone()),
            Box::new(dedup_check_duration.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        Self {
            registry,
            events_ingested,
            events_duplicate,
            events_rejected,
            publish_failures,
            rate_limited,
            dedup_dropped,
            http_requests,
            http_duration,
            dedup_check_duration,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let metrics = Metrics::new();
        metrics.events_ingested.inc();
        metrics.events_duplicate.inc_by(2);
        metrics
            .http_requests
            .with_label_values(&["POST", "/v1/events/ingest", "200"])
            .inc();

        let text = metrics.render();
        assert!(text.contains("gateway_events_ingested_total 1"));
        assert!(text.contains("gateway_events_duplicate_total 2"));
        assert!(text.contains("gateway_http_requests_total"));
    }
}
