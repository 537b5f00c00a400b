//! Privacy-preserving analytics
//!
//! Raw page views land in `analytics_events` with a salted session hash
//! instead of an address. Roll-ups are recomputed from their source rows
//! and replace what is stored, so re-running an aggregation never double
//! counts.

use chrono::{DateTime, Duration, DurationRound, NaiveDate, TimeZone, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::AnalyticsConfig;
use crate::data::{
    DailyStat, Database, DeviceType, HourlyStat, PageCount, put_setting, timestamp,
};
use crate::error::StoreError;
use crate::metrics::{ANALYTICS_BUCKETS_AGGREGATED_TOTAL, RETENTION_PRUNE_FAILURES_TOTAL};

const TOP_PAGES_LIMIT: i64 = 10;
const SALT_KEY_PREFIX: &str = "session_salt_";

/// One page view as reported by the web layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageView {
    pub path: String,
    pub referrer_domain: Option<String>,
    pub country_code: Option<String>,
    #[serde(default)]
    pub device_type: DeviceType,
    pub browser_family: Option<String>,
    pub session_hash: String,
    pub response_time_ms: Option<i64>,
    pub status_code: i64,
    pub content_id: Option<i64>,
    pub content_type: Option<String>,
    /// Defaults to the time of recording
    pub timestamp: Option<DateTime<Utc>>,
}

/// Rows removed by [`AnalyticsService::purge`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PurgeSummary {
    pub raw_events: u64,
    pub hourly: u64,
    pub daily: u64,
}

/// Key of the hourly bucket containing `at`, e.g. `2024-03-09T07:00:00Z`.
pub fn hour_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:00:00Z").to_string()
}

pub fn hour_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::hours(1)).unwrap_or(at)
}

/// IPv4 keeps two octets, IPv6 three groups.
pub fn anonymize_ip(ip: &str) -> String {
    if ip.contains(':') {
        let parts: Vec<&str> = ip.split(':').collect();
        if parts.len() >= 4 {
            return format!("{}:{}:{}:*", parts[0], parts[1], parts[2]);
        }
    } else {
        let parts: Vec<&str> = ip.split('.').collect();
        if parts.len() == 4 {
            return format!("{}.{}.0.0", parts[0], parts[1]);
        }
    }
    "unknown".to_string()
}

pub fn browser_family(user_agent: &str) -> &'static str {
    let ua = user_agent.to_lowercase();
    if ua.contains("firefox") {
        "Firefox"
    } else if ua.contains("edg/") || ua.contains("edge") {
        "Edge"
    } else if ua.contains("opr/") || ua.contains("opera") {
        "Opera"
    } else if ua.contains("chrome") || ua.contains("chromium") {
        "Chrome"
    } else if ua.contains("safari") {
        "Safari"
    } else {
        "Other"
    }
}

pub fn device_type(user_agent: &str) -> DeviceType {
    let ua = user_agent.to_lowercase();
    if ua.contains("tablet") || ua.contains("ipad") {
        DeviceType::Tablet
    } else if ua.contains("mobile") || ua.contains("android") {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    }
}

/// Session identifier that cannot be reversed to an address.
///
/// The salt rotates daily, so the same visitor gets a new hash each day.
pub fn session_hash(salt: &str, ip: &str, user_agent: &str) -> String {
    let input = format!("{salt}|{}|{}", anonymize_ip(ip), browser_family(user_agent));
    let digest = Sha256::digest(input.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Analytics service
pub struct AnalyticsService {
    db: Arc<Database>,
    config: AnalyticsConfig,
}

impl AnalyticsService {
    pub fn new(db: Arc<Database>, config: AnalyticsConfig) -> Self {
        Self { db, config }
    }

    /// Salt for session hashes on the day of `now`, created on first use.
    pub async fn daily_salt(&self, now: DateTime<Utc>) -> Result<String, StoreError> {
        let key = format!("{SALT_KEY_PREFIX}{}", now.format("%Y-%m-%d"));
        if let Some(salt) = self.db.get_setting(&key).await? {
            return Ok(salt);
        }

        let mut bytes = [0_u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let salt: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

        let mut tx = self.db.begin_write().await?;
        // Another writer may have created it while we waited for the gate.
        let existing = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(&key)
            .fetch_optional(tx.conn())
            .await?;
        if let Some(existing) = existing {
            return Ok(existing);
        }
        put_setting(tx.conn(), &key, &salt).await?;
        sqlx::query("DELETE FROM settings WHERE key LIKE 'session_salt_%' AND key != ?")
            .bind(&key)
            .execute(tx.conn())
            .await?;
        tx.commit().await?;
        Ok(salt)
    }

    pub async fn record_event(&self, view: &PageView) -> Result<(), StoreError> {
        if view.path.is_empty() || view.session_hash.is_empty() {
            return Err(StoreError::Validation(
                "page view needs a path and a session hash".to_string(),
            ));
        }

        let at = view.timestamp.unwrap_or_else(Utc::now);
        let mut tx = self.db.begin_write().await?;
        sqlx::query(
            r#"
            INSERT INTO analytics_events (
                timestamp, path, referrer_domain, country_code, device_type, browser_family,
                session_hash, response_time_ms, status_code, content_id, content_type
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(timestamp(at))
        .bind(&view.path)
        .bind(&view.referrer_domain)
        .bind(&view.country_code)
        .bind(view.device_type)
        .bind(&view.browser_family)
        .bind(&view.session_hash)
        .bind(view.response_time_ms)
        .bind(view.status_code)
        .bind(view.content_id)
        .bind(&view.content_type)
        .execute(tx.conn())
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Aggregation
    // =========================================================================

    /// Recompute the completed hours of the lookback window before `now`.
    ///
    /// Returns the number of hourly buckets written.
    pub async fn aggregate_hourly(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let end = hour_floor(now);
        let start = end - Duration::hours(i64::from(self.config.aggregation_lookback_hours));

        let mut tx = self.db.begin_write().await?;
        let written = sqlx::query(
            r#"
            INSERT INTO analytics_hourly (
                hour, path, content_id, content_type,
                pageviews, unique_sessions, avg_response_time_ms, error_count
            )
            SELECT
                strftime('%Y-%m-%dT%H:00:00Z', timestamp) AS bucket,
                path,
                MAX(content_id),
                MAX(content_type),
                COUNT(*),
                COUNT(DISTINCT session_hash),
                AVG(response_time_ms),
                SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END)
            FROM analytics_events
            WHERE timestamp >= ? AND timestamp < ?
            GROUP BY bucket, path
            ON CONFLICT (hour, path) DO UPDATE SET
                content_id = excluded.content_id,
                content_type = excluded.content_type,
                pageviews = excluded.pageviews,
                unique_sessions = excluded.unique_sessions,
                avg_response_time_ms = excluded.avg_response_time_ms,
                error_count = excluded.error_count
            "#,
        )
        .bind(timestamp(start))
        .bind(timestamp(end))
        .execute(tx.conn())
        .await?
        .rows_affected();
        tx.commit().await?;

        ANALYTICS_BUCKETS_AGGREGATED_TOTAL
            .with_label_values(&["hourly"])
            .inc_by(written);
        tracing::debug!(written, from = %hour_key(start), to = %hour_key(end), "Hourly analytics aggregated");
        Ok(written)
    }

    /// Recompute the daily roll-up and per-content totals for `date`.
    pub async fn aggregate_daily(&self, date: NaiveDate) -> Result<DailyStat, StoreError> {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| StoreError::Validation(format!("invalid date {date}")))?;
        let day_start = Utc.from_utc_datetime(&midnight);
        let from = hour_key(day_start);
        let to = hour_key(day_start + Duration::days(1));
        let date_key = date.format("%Y-%m-%d").to_string();

        let mut tx = self.db.begin_write().await?;
        let (total_pageviews, unique_sessions, avg_response_time_ms, error_count) =
            sqlx::query_as::<_, (i64, i64, Option<f64>, i64)>(
                r#"
                SELECT
                    COALESCE(SUM(pageviews), 0),
                    COALESCE(SUM(unique_sessions), 0),
                    SUM(avg_response_time_ms * pageviews)
                        / NULLIF(SUM(CASE WHEN avg_response_time_ms IS NOT NULL THEN pageviews END), 0),
                    COALESCE(SUM(error_count), 0)
                FROM analytics_hourly
                WHERE hour >= ? AND hour < ?
                "#,
            )
            .bind(&from)
            .bind(&to)
            .fetch_one(tx.conn())
            .await?;

        let top_pages = sqlx::query_as::<_, PageCount>(
            "SELECT path, SUM(pageviews) AS views FROM analytics_hourly \
             WHERE hour >= ? AND hour < ? GROUP BY path ORDER BY views DESC, path LIMIT ?",
        )
        .bind(&from)
        .bind(&to)
        .bind(TOP_PAGES_LIMIT)
        .fetch_all(tx.conn())
        .await?;
        let top_pages_json =
            serde_json::to_string(&top_pages).map_err(|e| StoreError::Internal(e.into()))?;

        sqlx::query(
            r#"
            INSERT INTO analytics_daily (
                date, total_pageviews, unique_sessions, avg_response_time_ms, error_count, top_pages
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (date) DO UPDATE SET
                total_pageviews = excluded.total_pageviews,
                unique_sessions = excluded.unique_sessions,
                avg_response_time_ms = excluded.avg_response_time_ms,
                error_count = excluded.error_count,
                top_pages = excluded.top_pages
            "#,
        )
        .bind(&date_key)
        .bind(total_pageviews)
        .bind(unique_sessions)
        .bind(avg_response_time_ms)
        .bind(error_count)
        .bind(&top_pages_json)
        .execute(tx.conn())
        .await?;

        let content_rows = sqlx::query(
            r#"
            INSERT INTO analytics_content (content_id, date, pageviews, unique_sessions)
            SELECT h.content_id, ?, SUM(h.pageviews), SUM(h.unique_sessions)
            FROM analytics_hourly h
            JOIN content c ON c.id = h.content_id
            WHERE h.hour >= ? AND h.hour < ?
            GROUP BY h.content_id
            ON CONFLICT (content_id, date) DO UPDATE SET
                pageviews = excluded.pageviews,
                unique_sessions = excluded.unique_sessions
            "#,
        )
        .bind(&date_key)
        .bind(&from)
        .bind(&to)
        .execute(tx.conn())
        .await?
        .rows_affected();
        tx.commit().await?;

        ANALYTICS_BUCKETS_AGGREGATED_TOTAL
            .with_label_values(&["daily"])
            .inc();
        ANALYTICS_BUCKETS_AGGREGATED_TOTAL
            .with_label_values(&["content"])
            .inc_by(content_rows);
        tracing::debug!(date = %date_key, total_pageviews, content_rows, "Daily analytics aggregated");

        Ok(DailyStat {
            date: date_key,
            total_pageviews,
            unique_sessions,
            avg_response_time_ms,
            error_count,
            top_pages,
        })
    }

    /// Drop rows beyond their retention windows.
    pub async fn purge(&self, now: DateTime<Utc>) -> Result<PurgeSummary, StoreError> {
        let raw_cutoff = now - Duration::hours(i64::from(self.config.raw_event_retention_hours));
        let hourly_cutoff = now - Duration::days(i64::from(self.config.hourly_retention_days));

        let result: Result<PurgeSummary, StoreError> = async {
            let mut tx = self.db.begin_write().await?;
            let mut summary = PurgeSummary::default();

            summary.raw_events = sqlx::query("DELETE FROM analytics_events WHERE timestamp < ?")
                .bind(timestamp(raw_cutoff))
                .execute(tx.conn())
                .await?
                .rows_affected();

            if self.config.hourly_retention_days > 0 {
                summary.hourly = sqlx::query("DELETE FROM analytics_hourly WHERE hour < ?")
                    .bind(hour_key(hourly_cutoff))
                    .execute(tx.conn())
                    .await?
                    .rows_affected();
            }

            if self.config.daily_retention_days > 0 {
                let daily_cutoff =
                    now - Duration::days(i64::from(self.config.daily_retention_days));
                summary.daily = sqlx::query("DELETE FROM analytics_daily WHERE date < ?")
                    .bind(daily_cutoff.format("%Y-%m-%d").to_string())
                    .execute(tx.conn())
                    .await?
                    .rows_affected();
            }

            tx.commit().await?;
            Ok(summary)
        }
        .await;

        match result {
            Ok(summary) => {
                tracing::info!(
                    raw_events = summary.raw_events,
                    hourly = summary.hourly,
                    daily = summary.daily,
                    "Analytics retention applied"
                );
                Ok(summary)
            }
            Err(error) if error.is_retryable() => Err(error),
            Err(error) => {
                RETENTION_PRUNE_FAILURES_TOTAL
                    .with_label_values(&["analytics"])
                    .inc();
                Err(StoreError::RetentionPrune(error.to_string()))
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Hourly buckets at or after `since`, oldest first.
    pub async fn hourly_stats(&self, since: DateTime<Utc>) -> Result<Vec<HourlyStat>, StoreError> {
        let stats = sqlx::query_as::<_, HourlyStat>(
            "SELECT hour, path, content_id, content_type, pageviews, unique_sessions, \
             avg_response_time_ms, error_count FROM analytics_hourly WHERE hour >= ? \
             ORDER BY hour, path",
        )
        .bind(hour_key(since))
        .fetch_all(self.db.pool())
        .await?;
        Ok(stats)
    }

    /// Most recent daily roll-ups, newest first.
    pub async fn daily_stats(&self, limit: i64) -> Result<Vec<DailyStat>, StoreError> {
        let stats = sqlx::query_as::<_, DailyStat>(
            "SELECT * FROM analytics_daily ORDER BY date DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(stats)
    }

    /// `(date, pageviews, unique_sessions)` for one content row, newest first.
    pub async fn content_daily(
        &self,
        content_id: i64,
        limit: i64,
    ) -> Result<Vec<(String, i64, i64)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT date, pageviews, unique_sessions FROM analytics_content \
             WHERE content_id = ? ORDER BY date DESC LIMIT ?",
        )
        .bind(content_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }
}
