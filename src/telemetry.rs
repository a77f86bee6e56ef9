//! Logging setup and metric events.
//!
//! Metric events are plain `tracing` events with target
//! `feed_kernel::metrics` and a `metric_type` field, so any subscriber can
//! route them to a metrics backend.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize the tracing subscriber with JSON or pretty format.
///
/// `LOG_FORMAT=pretty` selects human-readable output; anything else emits
/// JSON. `RUST_LOG` overrides the default filter. Returns an error if a
/// global subscriber is already installed.
pub fn init_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "feed_kernel=info,sqlx=warn".into());

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_span_events(FmtSpan::CLOSE))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .try_init()
    }
}

/// Record feed assembly metrics.
pub fn record_assembly_metrics(mode: &str, candidates: usize, pinned: usize, latency_ms: u64) {
    tracing::info!(
        target: "feed_kernel::metrics",
        metric_type = "assembly",
        mode = mode,
        candidates = candidates,
        pinned = pinned,
        latency_ms = latency_ms,
        "assembly_metric"
    );
}

/// Record violation map metrics.
pub fn record_violation_metrics(items: usize, violations: usize, cancelled: bool, latency_ms: u64) {
    tracing::info!(
        target: "feed_kernel::metrics",
        metric_type = "violations",
        items = items,
        violations = violations,
        cancelled = cancelled,
        latency_ms = latency_ms,
        "violation_metric"
    );
}

/// Record store operation metrics.
pub fn record_store_metrics(operation: &str, status: &str, latency_ms: u64) {
    tracing::info!(
        target: "feed_kernel::metrics",
        metric_type = "store",
        operation = operation,
        status = status,
        latency_ms = latency_ms,
        "store_metric"
    );
}
