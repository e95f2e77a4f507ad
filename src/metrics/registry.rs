use metrics::Unit;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0,
];

const COUNTERS: &[(&str, &str)] = &[
    ("mdgate_http_requests_total", "Total HTTP requests processed"),
    (
        "mdgate_conversions_total",
        "Total conversions attempted, labeled by method and outcome",
    ),
    ("mdgate_cache_events_total", "Conversion cache hits and misses"),
    (
        "mdgate_render_queue_rejected_total",
        "Gate acquisitions rejected because the queue was full",
    ),
    ("mdgate_proxy_fetch_total", "Forward-proxy fetch attempts"),
    (
        "mdgate_paywall_fallback_total",
        "Paywall fallback attempts, labeled by stage",
    ),
    (
        "mdgate_dispatch_retries_total",
        "Per-domain dispatcher retry attempts",
    ),
    (
        "mdgate_dispatch_rate_limited_total",
        "Tasks that observed a rate-limit status",
    ),
    (
        "mdgate_crawl_nodes_total",
        "Deep-crawl nodes processed, labeled by outcome",
    ),
    (
        "mdgate_crawl_checkpoints_total",
        "Deep-crawl checkpoint snapshots written",
    ),
];

const GAUGES: &[(&str, &str)] = &[(
    "mdgate_render_queue_depth",
    "Acquirers currently waiting at the render gate",
)];

const HISTOGRAMS: &[(&str, &str)] = &[(
    "mdgate_convert_duration_seconds",
    "End-to-end conversion duration",
)];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .expect("valid matcher")
}

impl Metrics {
    /// Install the global Prometheus recorder and register the description
    /// table. A second install (tests building several states in one
    /// process) falls back to a detached recorder; macro calls then go to
    /// whichever recorder won the global slot.
    pub fn install() -> Self {
        let handle = match builder().install_recorder() {
            Ok(handle) => handle,
            Err(_) => builder().build_recorder().handle(),
        };

        for (name, help) in COUNTERS {
            metrics::describe_counter!(*name, Unit::Count, *help);
        }
        for (name, help) in GAUGES {
            metrics::describe_gauge!(*name, Unit::Count, *help);
        }
        for (name, help) in HISTOGRAMS {
            metrics::describe_histogram!(*name, Unit::Seconds, *help);
        }

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
