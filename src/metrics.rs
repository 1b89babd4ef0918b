/// Metrics and telemetry for the Aurora relay
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Crawl queue depth, announcements, and task outcomes
/// - Sequencer throughput and subscriber fanout
/// - Cache hit/miss rates and identity resolution
/// - Upstream connections and background jobs

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Encoder, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};
use tracing::error;

lazy_static! {
    // ========== Crawl Metrics ==========

    /// Pending crawl tasks per source
    pub static ref CRAWL_QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        "relay_crawl_queue_depth",
        "Pending crawl tasks per source",
        &["host"]
    )
    .unwrap();

    /// Crawl tasks currently running
    pub static ref CRAWL_TASKS_ACTIVE: IntGauge = register_int_gauge!(
        "relay_crawl_tasks_active",
        "Crawl tasks currently being processed"
    )
    .unwrap();

    /// Announcements by result (queued, coalesced, backpressure, rejected)
    pub static ref CRAWL_ANNOUNCEMENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "relay_crawl_announcements_total",
        "Crawl announcements by result",
        &["result"]
    )
    .unwrap();

    /// Finished crawl tasks by outcome
    pub static ref CRAWL_TASKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "relay_crawl_tasks_total",
        "Crawl tasks by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Crawl task duration in seconds
    pub static ref CRAWL_TASK_DURATION_SECONDS: Histogram = register_histogram!(
        "relay_crawl_task_duration_seconds",
        "Crawl task latencies in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    /// Sources flagged for invalid content
    pub static ref SOURCE_FLAGS_TOTAL: IntCounter = register_int_counter!(
        "relay_source_flags_total",
        "Times a source was flagged for invalid repository content"
    )
    .unwrap();

    // ========== Upstream Metrics ==========

    /// Open upstream subscriptions
    pub static ref UPSTREAM_CONNECTIONS: IntGauge = register_int_gauge!(
        "relay_upstream_connections",
        "Open upstream source subscriptions"
    )
    .unwrap();

    /// Upstream frames by type
    pub static ref UPSTREAM_FRAMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "relay_upstream_frames_total",
        "Frames received from sources by type",
        &["frame_type"]
    )
    .unwrap();

    // ========== Sequencer Metrics ==========

    /// Sequencer events by event type
    pub static ref SEQUENCER_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sequencer_events_total",
        "Total number of sequencer events",
        &["event_type"]
    )
    .unwrap();

    /// Current sequence number
    pub static ref SEQUENCER_CURRENT_SEQ: IntGauge = register_int_gauge!(
        "sequencer_current_seq",
        "Current sequence number"
    )
    .unwrap();

    /// Events removed by retention
    pub static ref EVENT_LOG_TRIMMED_TOTAL: IntCounter = register_int_counter!(
        "relay_event_log_trimmed_total",
        "Events removed from the event log by retention"
    )
    .unwrap();

    // ========== Firehose Metrics ==========

    /// Registered firehose subscribers
    pub static ref FIREHOSE_SUBSCRIBERS: IntGauge = register_int_gauge!(
        "relay_firehose_subscribers",
        "Registered firehose subscribers"
    )
    .unwrap();

    /// Subscribers dropped for lagging
    pub static ref FIREHOSE_SLOW_CONSUMERS_TOTAL: IntCounter = register_int_counter!(
        "relay_firehose_slow_consumers_total",
        "Subscribers disconnected for falling behind"
    )
    .unwrap();

    /// Events delivered from replay
    pub static ref FIREHOSE_REPLAYED_EVENTS_TOTAL: IntCounter = register_int_counter!(
        "relay_firehose_replayed_events_total",
        "Events delivered to subscribers from replay"
    )
    .unwrap();

    /// Sequence lag between the head and the event being delivered
    pub static ref FIREHOSE_DELIVERY_LAG: HistogramVec = register_histogram_vec!(
        "relay_firehose_delivery_lag",
        "Sequence numbers between the log head and the delivered event",
        &["phase"],
        vec![0.0, 1.0, 10.0, 100.0, 1000.0, 10000.0, 100000.0]
    )
    .unwrap();

    // ========== Cache Metrics ==========

    /// Cache hits by cache type
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_hits_total",
        "Total number of cache hits",
        &["cache_type"]
    )
    .unwrap();

    /// Cache misses by cache type
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_misses_total",
        "Total number of cache misses",
        &["cache_type"]
    )
    .unwrap();

    // ========== Identity Resolution Metrics ==========

    /// Identity resolutions by DID method
    pub static ref IDENTITY_RESOLUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "identity_resolutions_total",
        "Total number of DID resolutions",
        &["did_method", "status"]
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();

    /// Background job duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "background_job_duration_seconds",
        "Background job execution time in seconds",
        &["job_type"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .unwrap();

    // ========== System Metrics ==========

    /// Build and environment information
    pub static ref BUILD_INFO: IntGaugeVec = register_int_gauge_vec!(
        "relay_build_info",
        "Relay version and environment",
        &["version", "environment"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record build information
pub fn record_build_info(version: &str, environment: &str) {
    BUILD_INFO.with_label_values(&[version, environment]).set(1);
}

/// Record a cache access
pub fn record_cache_access(cache_type: &str, hit: bool) {
    if hit {
        CACHE_HITS_TOTAL.with_label_values(&[cache_type]).inc();
    } else {
        CACHE_MISSES_TOTAL.with_label_values(&[cache_type]).inc();
    }
}

/// Record an identity resolution
pub fn record_identity_resolution(did_method: &str, status: &str) {
    IDENTITY_RESOLUTIONS_TOTAL
        .with_label_values(&[did_method, status])
        .inc();
}

/// Record an announcement result
pub fn record_announcement(result: &str) {
    CRAWL_ANNOUNCEMENTS_TOTAL.with_label_values(&[result]).inc();
}

/// Set the queue depth for a source
pub fn set_queue_depth(host: &str, depth: usize) {
    CRAWL_QUEUE_DEPTH
        .with_label_values(&[host])
        .set(depth as i64);
}

/// Record a finished crawl task
pub fn record_crawl_task(outcome: &str, duration: f64) {
    CRAWL_TASKS_TOTAL.with_label_values(&[outcome]).inc();
    CRAWL_TASK_DURATION_SECONDS.observe(duration);
}

/// Record an upstream frame
pub fn record_upstream_frame(frame_type: &str) {
    UPSTREAM_FRAMES_TOTAL.with_label_values(&[frame_type]).inc();
}

/// Record a sequencer event
pub fn record_sequencer_event(event_type: &str, seq: i64) {
    SEQUENCER_EVENTS_TOTAL
        .with_label_values(&[event_type])
        .inc();
    SEQUENCER_CURRENT_SEQ.set(seq);
}

/// Record a delivered firehose event
pub fn record_delivery_lag(phase: &str, lag: i64) {
    FIREHOSE_DELIVERY_LAG
        .with_label_values(&[phase])
        .observe(lag.max(0) as f64);
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_metrics() {
        record_announcement("queued");
        record_crawl_task("success", 0.2);
        record_cache_access("did", true);
        set_queue_depth("pds.example.com", 3);

        let output = render_metrics();
        assert!(output.contains("relay_crawl_announcements_total"));
        assert!(output.contains("relay_crawl_tasks_total"));
        assert!(output.contains("cache_hits_total"));
        assert!(output.contains("relay_crawl_queue_depth"));
    }

    #[test]
    fn test_sequencer_gauge_tracks_seq() {
        record_sequencer_event("commit", 42);
        assert!(SEQUENCER_CURRENT_SEQ.get() >= 1);
    }
}
