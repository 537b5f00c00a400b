//! Prometheus metrics registry and instruments.
//!
//! Instruments are process-wide statics; [`init_metrics`] registers them
//! once at start-up and [`render`] produces the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Schema
    pub static ref MIGRATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quillstore_migrations_total", "Migration units committed"),
        &["direction"]
    ).expect("metric can be created");

    // Content lifecycle
    pub static ref CONTENT_MUTATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quillstore_content_mutations_total", "Committed content mutations"),
        &["action"]
    ).expect("metric can be created");
    pub static ref SCHEDULED_ACTIVATIONS_TOTAL: IntCounter = IntCounter::new(
        "quillstore_scheduled_activations_total",
        "Scheduled content activated by the publish sweep"
    ).expect("metric can be created");
    pub static ref CONTENT_ITEMS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("quillstore_content_items", "Content items by status"),
        &["status"]
    ).expect("metric can be created");

    // Search index
    pub static ref SEARCH_INDEX_REBUILDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quillstore_search_index_rebuilds_total", "Full search index rebuilds"),
        &["status"]
    ).expect("metric can be created");
    pub static ref SEARCH_INDEX_SYNC_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "quillstore_search_index_sync_failures_total",
        "Incremental index updates that marked the index stale"
    ).expect("metric can be created");

    // Retention and audit
    pub static ref RETENTION_PRUNE_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quillstore_retention_prune_failures_total", "Failed retention prunes"),
        &["target"]
    ).expect("metric can be created");
    pub static ref AUDIT_WRITES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quillstore_audit_writes_total", "Audit entries written"),
        &["status"]
    ).expect("metric can be created");

    // Analytics
    pub static ref ANALYTICS_BUCKETS_AGGREGATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quillstore_analytics_buckets_aggregated_total", "Analytics roll-up rows written"),
        &["granularity"]
    ).expect("metric can be created");

    // Background jobs
    pub static ref JOB_RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quillstore_job_runs_total", "Periodic job runs"),
        &["job", "status"]
    ).expect("metric can be created");
    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "quillstore_job_duration_seconds",
            "Periodic job duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["job"]
    ).expect("metric can be created");

    // Errors
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quillstore_errors_total", "Errors returned by storage operations"),
        &["error_type", "operation"]
    ).expect("metric can be created");
}

/// Record one periodic job run.
pub fn observe_job(job: &str, status: &str, elapsed: Duration) {
    JOB_RUNS_TOTAL.with_label_values(&[job, status]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[job])
        .observe(elapsed.as_secs_f64());
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(MIGRATIONS_TOTAL.clone()))
        .expect("MIGRATIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CONTENT_MUTATIONS_TOTAL.clone()))
        .expect("CONTENT_MUTATIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(SCHEDULED_ACTIVATIONS_TOTAL.clone()))
        .expect("SCHEDULED_ACTIVATIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CONTENT_ITEMS.clone()))
        .expect("CONTENT_ITEMS can be registered");
    REGISTRY
        .register(Box::new(SEARCH_INDEX_REBUILDS_TOTAL.clone()))
        .expect("SEARCH_INDEX_REBUILDS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(SEARCH_INDEX_SYNC_FAILURES_TOTAL.clone()))
        .expect("SEARCH_INDEX_SYNC_FAILURES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(RETENTION_PRUNE_FAILURES_TOTAL.clone()))
        .expect("RETENTION_PRUNE_FAILURES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(AUDIT_WRITES_TOTAL.clone()))
        .expect("AUDIT_WRITES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ANALYTICS_BUCKETS_AGGREGATED_TOTAL.clone()))
        .expect("ANALYTICS_BUCKETS_AGGREGATED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(JOB_RUNS_TOTAL.clone()))
        .expect("JOB_RUNS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(JOB_DURATION_SECONDS.clone()))
        .expect("JOB_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Encode every registered metric in Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
