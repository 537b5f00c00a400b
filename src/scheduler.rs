//! Periodic jobs
//!
//! Two loops run next to the web layer:
//! - the publish sweep, which activates due scheduled content
//! - maintenance: version retention, analytics roll-ups and purge,
//!   preview-token cleanup and search index self-heal
//!
//! Each `run_*` function is one pass and can be called directly (tests,
//! CLI); `spawn_*` wraps it in a `tokio` interval loop.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::Store;
use crate::data::ContentStatus;
use crate::error::StoreError;
use crate::metrics::{CONTENT_ITEMS, ERRORS_TOTAL, observe_job};
use crate::service::PurgeSummary;

const PUBLISH_SWEEP: &str = "publish_sweep";
const MAINTENANCE: &str = "maintenance";

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub versions_pruned: u64,
    pub hourly_buckets: u64,
    pub daily_rollups: u64,
    pub analytics_purged: PurgeSummary,
    pub preview_tokens_removed: u64,
    pub search_index_rebuilt: bool,
    /// `step: error` for every step that failed; the others still ran
    pub failures: Vec<String>,
}

impl MaintenanceReport {
    fn record_failure(&mut self, step: &str, error: StoreError) {
        ERRORS_TOTAL
            .with_label_values(&[error.kind(), step])
            .inc();
        tracing::error!(step, %error, "Maintenance step failed");
        self.failures.push(format!("{step}: {error}"));
    }
}

/// Publish everything due at `now`.
pub async fn run_publish_sweep(store: &Store, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let started = Instant::now();
    let result = store.content.activate_due_scheduled_content(now).await;

    match &result {
        Ok(activated) => {
            observe_job(PUBLISH_SWEEP, "success", started.elapsed());
            tracing::debug!(activated, "Publish sweep finished");
        }
        Err(error) => {
            observe_job(PUBLISH_SWEEP, "failure", started.elapsed());
            ERRORS_TOTAL
                .with_label_values(&[error.kind(), PUBLISH_SWEEP])
                .inc();
            tracing::error!(%error, retryable = error.is_retryable(), "Publish sweep failed");
        }
    }
    result
}

/// One maintenance pass. A failing step is reported and the rest still run.
pub async fn run_maintenance(store: &Store, now: DateTime<Utc>) -> MaintenanceReport {
    let started = Instant::now();
    let mut report = MaintenanceReport::default();

    match store
        .versions
        .prune_all(store.config.content.version_retention)
        .await
    {
        Ok(pruned) => report.versions_pruned = pruned,
        Err(error) => report.record_failure("version_retention", error),
    }

    match store.analytics.aggregate_hourly(now).await {
        Ok(buckets) => report.hourly_buckets = buckets,
        Err(error) => report.record_failure("analytics_hourly", error),
    }

    // Yesterday settles once its last hour is aggregated; today stays
    // current for dashboards.
    for day in [now - ChronoDuration::days(1), now] {
        match store.analytics.aggregate_daily(day.date_naive()).await {
            Ok(_) => report.daily_rollups += 1,
            Err(error) => report.record_failure("analytics_daily", error),
        }
    }

    match store.analytics.purge(now).await {
        Ok(summary) => report.analytics_purged = summary,
        Err(error) => report.record_failure("analytics_purge", error),
    }

    match store.previews.cleanup_expired(now).await {
        Ok(removed) => report.preview_tokens_removed = removed,
        Err(error) => report.record_failure("preview_tokens", error),
    }

    match store.search.heal_if_stale().await {
        Ok(rebuilt) => report.search_index_rebuilt = rebuilt,
        Err(error) => report.record_failure("search_index", error),
    }

    if let Err(error) = refresh_content_gauge(store).await {
        report.record_failure("content_gauge", error);
    }

    let status = if report.failures.is_empty() {
        "success"
    } else {
        "failure"
    };
    observe_job(MAINTENANCE, status, started.elapsed());
    tracing::info!(
        versions_pruned = report.versions_pruned,
        hourly_buckets = report.hourly_buckets,
        preview_tokens_removed = report.preview_tokens_removed,
        search_index_rebuilt = report.search_index_rebuilt,
        failures = report.failures.len(),
        "Maintenance finished"
    );
    report
}

async fn refresh_content_gauge(store: &Store) -> Result<(), StoreError> {
    let counts = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM content GROUP BY status",
    )
    .fetch_all(store.db.pool())
    .await?;

    for status in ContentStatus::ALL {
        let count = counts
            .iter()
            .find(|(name, _)| name == status.as_str())
            .map_or(0, |(_, count)| *count);
        CONTENT_ITEMS
            .with_label_values(&[status.as_str()])
            .set(count);
    }
    Ok(())
}

fn interval(seconds: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(seconds.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Spawn the scheduled-publish sweep loop.
pub fn spawn_publish_sweep(store: Arc<Store>) -> JoinHandle<()> {
    let seconds = store.config.scheduler.publish_interval_seconds;
    let handle = tokio::spawn(async move {
        let mut ticker = interval(seconds);
        loop {
            ticker.tick().await;
            // Errors are logged and counted inside; the next tick retries.
            let _ = run_publish_sweep(&store, Utc::now()).await;
        }
    });

    tracing::info!(interval_seconds = seconds, "Publish sweep task spawned");
    handle
}

/// Spawn the maintenance loop. The first pass runs one interval after start.
pub fn spawn_maintenance(store: Arc<Store>) -> JoinHandle<()> {
    let seconds = store.config.scheduler.maintenance_interval_seconds;
    let handle = tokio::spawn(async move {
        let mut ticker = interval(seconds);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_maintenance(&store, Utc::now()).await;
        }
    });

    tracing::info!(interval_seconds = seconds, "Maintenance task spawned");
    handle
}
