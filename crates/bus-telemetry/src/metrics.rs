//! Prometheus metrics for the event bus.
//!
//! All metrics follow the naming convention: `bus_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., bus_publish_total)
//! - **Gauge**: Value that can go up or down (e.g., bus_pending_messages)
//! - **Histogram**: Distribution of values (e.g., bus_processing_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts,
    HistogramVec, Opts, Registry, TextEncoder,
};

use crate::TelemetryError;

/// Values of the `status` label on publish/consume counters.
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const INVALID: &str = "invalid";
    pub const ERROR: &str = "error";
    pub const DEAD_LETTER: &str = "dead_letter";
}

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH / CONSUME
    // =========================================================================

    /// Publish attempts by stream and outcome
    pub static ref PUBLISH_TOTAL: CounterVec = CounterVec::new(
        Opts::new("bus_publish_total", "Messages published by stream and status"),
        &["stream", "status"]  // status: success/error
    ).expect("metric creation failed");

    /// Consumed entries by stream and outcome
    pub static ref CONSUME_TOTAL: CounterVec = CounterVec::new(
        Opts::new("bus_consume_total", "Entries consumed by stream and status"),
        &["stream", "status"]  // status: success/invalid/error/dead_letter
    ).expect("metric creation failed");

    /// Handler processing time
    pub static ref PROCESSING_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "bus_processing_duration_seconds",
            "Time spent inside message handlers"
        ).buckets(exponential_buckets(0.0005, 2.0, 16).expect("valid buckets")),
        &["stream"]
    ).expect("metric creation failed");

    /// Serialized payload size
    pub static ref PAYLOAD_SIZE: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "bus_payload_size_bytes",
            "Serialized payload size at publish time"
        ).buckets(exponential_buckets(64.0, 4.0, 10).expect("valid buckets")),
        &["stream"]
    ).expect("metric creation failed");

    // =========================================================================
    // BACKLOG
    // =========================================================================

    /// Delivered but unacknowledged entries per consumer group
    pub static ref PENDING_MESSAGES: GaugeVec = GaugeVec::new(
        Opts::new("bus_pending_messages", "Pending (delivered, unacked) entries"),
        &["stream", "group"]
    ).expect("metric creation failed");

    /// Stream length as reported by the broker
    pub static ref STREAM_LENGTH: GaugeVec = GaugeVec::new(
        Opts::new("bus_stream_length", "Number of entries retained in the stream"),
        &["stream"]
    ).expect("metric creation failed");

    /// Retry count of the message most recently retried
    pub static ref RETRY_ATTEMPTS: GaugeVec = GaugeVec::new(
        Opts::new("bus_retry_attempts", "Retry attempts of the last failed entry"),
        &["stream", "group"]
    ).expect("metric creation failed");

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Connection-class transport errors
    pub static ref CONNECTION_ERRORS: Counter = Counter::new(
        "bus_connection_errors_total",
        "Transport connection errors"
    ).expect("metric creation failed");

    /// Reconnection attempts
    pub static ref RECONNECTS: Counter = Counter::new(
        "bus_reconnects_total",
        "Transport reconnection attempts"
    ).expect("metric creation failed");

    // =========================================================================
    // REJECTIONS
    // =========================================================================

    /// Messages refused before reaching the broker or the handler
    pub static ref REJECTIONS: CounterVec = CounterVec::new(
        Opts::new("bus_rejections_total", "Rejected messages by reason"),
        &["reason"]  // reason: payload_too_large/parse_error/invalid_signature/max_retries
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; collectors that are already registered are
/// skipped.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(PUBLISH_TOTAL.clone()),
        Box::new(CONSUME_TOTAL.clone()),
        Box::new(PROCESSING_DURATION.clone()),
        Box::new(PAYLOAD_SIZE.clone()),
        Box::new(PENDING_MESSAGES.clone()),
        Box::new(STREAM_LENGTH.clone()),
        Box::new(RETRY_ATTEMPTS.clone()),
        Box::new(CONNECTION_ERRORS.clone()),
        Box::new(RECONNECTS.clone()),
        Box::new(REJECTIONS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}
