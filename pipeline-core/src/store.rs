use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::aggregates::{MetricSet, WindowStats};
use crate::channels::Channel;
use crate::envelope::Payload;
use crate::metrics_consts::{
    AGGREGATES_SAVED, STORE_BATCH_ITEMS_FAILED, STORE_BATCH_WRITE_TIME,
};
use crate::PipelineError;

const BATCH_MAX_RETRY_ATTEMPTS: u64 = 3;
const BATCH_RETRY_DELAY_MS: u64 = 50;

/// Result of one batch persist: items that made it and items that did not,
/// each failed item paired with its error. A failed item never blocks its
/// siblings.
#[derive(Debug, Default)]
pub struct PersistOutcome {
    pub success: usize,
    pub failed: Vec<(Payload, String)>,
}

/// The relational store, seen from the pipeline. The schema itself is an
/// external collaborator; this trait is the whole downstream contract.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert a batch of enriched items of one data type in a single
    /// transaction-scoped call.
    async fn persist_batch(
        &self,
        data_type: Channel,
        items: Vec<Payload>,
    ) -> Result<PersistOutcome, PipelineError>;

    /// Raw sums for one tutor over a lookback window.
    async fn window_stats(
        &self,
        tutor_id: &str,
        window_days: u32,
    ) -> Result<WindowStats, PipelineError>;

    /// Upsert one aggregate record, keyed on (tutor, window, run date).
    /// Re-saving for the same key is expected; last write wins.
    async fn save_aggregate(
        &self,
        tutor_id: &str,
        window_days: u32,
        metrics: &MetricSet,
    ) -> Result<Uuid, PipelineError>;

    async fn active_tutor_ids(&self, include_inactive: bool) -> Result<Vec<String>, PipelineError>;

    /// Retention cleanup; returns the number of aggregate records deleted.
    async fn delete_aggregates_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, PipelineError>;
}

fn id_field(data_type: Channel) -> &'static str {
    match data_type {
        Channel::Tutors => "tutor_id",
        Channel::Sessions => "session_id",
        Channel::Feedback => "feedback_id",
    }
}

fn text(item: &Payload, key: &str) -> Option<String> {
    item.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn number(item: &Payload, key: &str) -> Option<f64> {
    item.get(key).and_then(|v| v.as_f64())
}

fn flag(item: &Payload, key: &str) -> bool {
    item.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    async fn upsert_tutors(&self, ids: &[String], items: &[Payload]) -> Result<(), sqlx::Error> {
        let names: Vec<Option<String>> = items.iter().map(|i| text(i, "name")).collect();
        let emails: Vec<Option<String>> = items.iter().map(|i| text(i, "email")).collect();
        let rates: Vec<Option<f64>> = items.iter().map(|i| number(i, "hourly_rate")).collect();
        let completeness: Vec<Option<f64>> = items
            .iter()
            .map(|i| number(i, "profile_completeness"))
            .collect();
        let subjects_counts: Vec<Option<f64>> =
            items.iter().map(|i| number(i, "subjects_count")).collect();

        sqlx::query(
            r#"
            INSERT INTO tutors (id, name, email, hourly_rate, profile_completeness, subjects_count, updated_at)
            SELECT *, NOW() FROM UNNEST($1::text[], $2::text[], $3::text[], $4::float8[], $5::float8[], $6::float8[])
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                email = EXCLUDED.email,
                hourly_rate = EXCLUDED.hourly_rate,
                profile_completeness = EXCLUDED.profile_completeness,
                subjects_count = EXCLUDED.subjects_count,
                updated_at = NOW()
            "#,
        )
        .bind(ids)
        .bind(&names)
        .bind(&emails)
        .bind(&rates)
        .bind(&completeness)
        .bind(&subjects_counts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_sessions(&self, ids: &[String], items: &[Payload]) -> Result<(), sqlx::Error> {
        let tutor_ids: Vec<Option<String>> = items.iter().map(|i| text(i, "tutor_id")).collect();
        let student_ids: Vec<Option<String>> =
            items.iter().map(|i| text(i, "student_id")).collect();
        let statuses: Vec<Option<String>> = items.iter().map(|i| text(i, "status")).collect();
        let minutes: Vec<Option<f64>> =
            items.iter().map(|i| number(i, "duration_minutes")).collect();
        let hours: Vec<Option<f64>> = items.iter().map(|i| number(i, "duration_hours")).collect();
        let revenues: Vec<Option<f64>> = items.iter().map(|i| number(i, "revenue")).collect();
        let ratings: Vec<Option<f64>> = items.iter().map(|i| number(i, "rating")).collect();
        let completed: Vec<bool> = items.iter().map(|i| flag(i, "is_completed")).collect();
        let days: Vec<Option<String>> = items.iter().map(|i| text(i, "day_of_week")).collect();

        sqlx::query(
            r#"
            INSERT INTO sessions (id, tutor_id, student_id, status, duration_minutes, duration_hours,
                                  revenue, rating, is_completed, day_of_week, updated_at)
            SELECT *, NOW() FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::float8[],
                                        $6::float8[], $7::float8[], $8::float8[], $9::bool[], $10::text[])
            ON CONFLICT (id) DO UPDATE SET
                tutor_id = EXCLUDED.tutor_id,
                student_id = EXCLUDED.student_id,
                status = EXCLUDED.status,
                duration_minutes = EXCLUDED.duration_minutes,
                duration_hours = EXCLUDED.duration_hours,
                revenue = EXCLUDED.revenue,
                rating = EXCLUDED.rating,
                is_completed = EXCLUDED.is_completed,
                day_of_week = EXCLUDED.day_of_week,
                updated_at = NOW()
            "#,
        )
        .bind(ids)
        .bind(&tutor_ids)
        .bind(&student_ids)
        .bind(&statuses)
        .bind(&minutes)
        .bind(&hours)
        .bind(&revenues)
        .bind(&ratings)
        .bind(&completed)
        .bind(&days)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_feedback(&self, ids: &[String], items: &[Payload]) -> Result<(), sqlx::Error> {
        let session_ids: Vec<Option<String>> =
            items.iter().map(|i| text(i, "session_id")).collect();
        let tutor_ids: Vec<Option<String>> = items.iter().map(|i| text(i, "tutor_id")).collect();
        let ratings: Vec<Option<f64>> = items.iter().map(|i| number(i, "rating")).collect();
        let sentiments: Vec<Option<String>> = items.iter().map(|i| text(i, "sentiment")).collect();
        let comments: Vec<Option<String>> = items.iter().map(|i| text(i, "comment")).collect();
        let has_comments: Vec<bool> = items.iter().map(|i| flag(i, "has_comment")).collect();

        sqlx::query(
            r#"
            INSERT INTO feedback (id, session_id, tutor_id, rating, sentiment, comment, has_comment, updated_at)
            SELECT *, NOW() FROM UNNEST($1::text[], $2::text[], $3::text[], $4::float8[], $5::text[],
                                        $6::text[], $7::bool[])
            ON CONFLICT (id) DO UPDATE SET
                session_id = EXCLUDED.session_id,
                tutor_id = EXCLUDED.tutor_id,
                rating = EXCLUDED.rating,
                sentiment = EXCLUDED.sentiment,
                comment = EXCLUDED.comment,
                has_comment = EXCLUDED.has_comment,
                updated_at = NOW()
            "#,
        )
        .bind(ids)
        .bind(&session_ids)
        .bind(&tutor_ids)
        .bind(&ratings)
        .bind(&sentiments)
        .bind(&comments)
        .bind(&has_comments)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn persist_batch(
        &self,
        data_type: Channel,
        items: Vec<Payload>,
    ) -> Result<PersistOutcome, PipelineError> {
        let mut outcome = PersistOutcome::default();
        let key = id_field(data_type);

        // Items without their natural key can never be upserted; fail them
        // up front instead of poisoning the batch statement.
        let mut ids = Vec::with_capacity(items.len());
        let mut writable = Vec::with_capacity(items.len());
        for item in items {
            match text(&item, key) {
                Some(id) => {
                    ids.push(id);
                    writable.push(item);
                }
                None => outcome.failed.push((item, format!("missing {key}"))),
            }
        }
        if writable.is_empty() {
            return Ok(outcome);
        }

        let start = Instant::now();
        let mut last_error = None;
        for attempt in 1..=BATCH_MAX_RETRY_ATTEMPTS {
            let result = match data_type {
                Channel::Tutors => self.upsert_tutors(&ids, &writable).await,
                Channel::Sessions => self.upsert_sessions(&ids, &writable).await,
                Channel::Feedback => self.upsert_feedback(&ids, &writable).await,
            };
            match result {
                Ok(()) => {
                    outcome.success = writable.len();
                    last_error = None;
                    break;
                }
                Err(err) => {
                    warn!(
                        data_type = data_type.as_str(),
                        attempt,
                        error = %err,
                        "batch upsert attempt failed"
                    );
                    last_error = Some(err.to_string());
                    tokio::time::sleep(Duration::from_millis(BATCH_RETRY_DELAY_MS)).await;
                }
            }
        }
        metrics::histogram!(STORE_BATCH_WRITE_TIME, "data_type" => data_type.as_str())
            .record(start.elapsed().as_millis() as f64);

        if let Some(error) = last_error {
            // The statement is all-or-nothing; every writable item shares
            // the final error.
            outcome
                .failed
                .extend(writable.into_iter().map(|item| (item, error.clone())));
        }
        if !outcome.failed.is_empty() {
            metrics::counter!(STORE_BATCH_ITEMS_FAILED, "data_type" => data_type.as_str())
                .increment(outcome.failed.len() as u64);
        }
        Ok(outcome)
    }

    async fn window_stats(
        &self,
        tutor_id: &str,
        window_days: u32,
    ) -> Result<WindowStats, PipelineError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS sessions_count,
                   COUNT(*) FILTER (WHERE is_completed) AS completed_sessions,
                   COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled_sessions,
                   COALESCE(SUM(duration_minutes), 0)::bigint AS total_minutes,
                   COUNT(DISTINCT student_id) AS unique_students,
                   COALESCE(SUM(rating), 0)::float8 AS rating_sum,
                   COUNT(rating) AS rating_count
            FROM sessions
            WHERE tutor_id = $1
              AND updated_at >= NOW() - make_interval(days => $2)
            "#,
        )
        .bind(tutor_id)
        .bind(window_days as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PipelineError::Persistence(e.to_string()))?;

        Ok(WindowStats {
            sessions_count: row.get("sessions_count"),
            completed_sessions: row.get("completed_sessions"),
            cancelled_sessions: row.get("cancelled_sessions"),
            total_minutes: row.get("total_minutes"),
            unique_students: row.get("unique_students"),
            rating_sum: row.get("rating_sum"),
            rating_count: row.get("rating_count"),
        })
    }

    async fn save_aggregate(
        &self,
        tutor_id: &str,
        window_days: u32,
        metrics: &MetricSet,
    ) -> Result<Uuid, PipelineError> {
        let values = serde_json::to_value(metrics)?;
        let row = sqlx::query(
            r#"
            INSERT INTO tutor_metrics (id, tutor_id, window_days, run_date, metrics, computed_at)
            VALUES ($1, $2, $3, CURRENT_DATE, $4, NOW())
            ON CONFLICT (tutor_id, window_days, run_date) DO UPDATE SET
                metrics = EXCLUDED.metrics,
                computed_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(tutor_id)
        .bind(window_days as i32)
        .bind(values)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PipelineError::Persistence(e.to_string()))?;
        metrics::counter!(AGGREGATES_SAVED).increment(1);
        Ok(row.get("id"))
    }

    async fn active_tutor_ids(&self, include_inactive: bool) -> Result<Vec<String>, PipelineError> {
        let rows = sqlx::query("SELECT id FROM tutors WHERE active OR $1 ORDER BY id")
            .bind(include_inactive)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::Persistence(e.to_string()))?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn delete_aggregates_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, PipelineError> {
        let result = sqlx::query("DELETE FROM tutor_metrics WHERE computed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::Persistence(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

/// In-memory store for tests: seeded window stats, injectable failures,
/// inspectable writes.
#[derive(Default)]
pub struct MemoryStore {
    inner: std::sync::Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    items: HashMap<(Channel, String), Payload>,
    stats: HashMap<(String, u32), WindowStats>,
    aggregates: HashMap<(String, u32), MetricSet>,
    aggregate_saves: u64,
    retention_sweeps: u64,
    active: Vec<String>,
    inactive: Vec<String>,
    reject_ids: HashSet<String>,
    fail_saves_for: HashSet<String>,
    fail_selection: bool,
    fail_batches: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_window_stats(&self, tutor_id: &str, window_days: u32, stats: WindowStats) {
        self.inner
            .lock()
            .unwrap()
            .stats
            .insert((tutor_id.to_string(), window_days), stats);
    }

    pub fn seed_tutors(&self, active: &[&str], inactive: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        inner.active = active.iter().map(|s| s.to_string()).collect();
        inner.inactive = inactive.iter().map(|s| s.to_string()).collect();
    }

    /// Make the next `n` persist_batch calls fail outright, as a store
    /// outage would.
    pub fn fail_next_batches(&self, n: u32) {
        self.inner.lock().unwrap().fail_batches = n;
    }

    /// Make persist_batch fail items with this natural id.
    pub fn reject_id(&self, id: &str) {
        self.inner.lock().unwrap().reject_ids.insert(id.to_string());
    }

    /// Make save_aggregate fail for this tutor.
    pub fn fail_saves_for(&self, tutor_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_saves_for
            .insert(tutor_id.to_string());
    }

    pub fn fail_selection(&self) {
        self.inner.lock().unwrap().fail_selection = true;
    }

    pub fn item(&self, data_type: Channel, id: &str) -> Option<Payload> {
        self.inner
            .lock()
            .unwrap()
            .items
            .get(&(data_type, id.to_string()))
            .cloned()
    }

    pub fn item_count(&self, data_type: Channel) -> usize {
        self.inner
            .lock()
            .unwrap()
            .items
            .keys()
            .filter(|(dt, _)| *dt == data_type)
            .count()
    }

    pub fn aggregate(&self, tutor_id: &str, window_days: u32) -> Option<MetricSet> {
        self.inner
            .lock()
            .unwrap()
            .aggregates
            .get(&(tutor_id.to_string(), window_days))
            .cloned()
    }

    /// Total save_aggregate calls, counting overwrites.
    pub fn aggregate_saves(&self) -> u64 {
        self.inner.lock().unwrap().aggregate_saves
    }

    /// How many times delete_aggregates_before was called.
    pub fn retention_sweeps(&self) -> u64 {
        self.inner.lock().unwrap().retention_sweeps
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn persist_batch(
        &self,
        data_type: Channel,
        items: Vec<Payload>,
    ) -> Result<PersistOutcome, PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_batches > 0 {
            inner.fail_batches -= 1;
            return Err(PipelineError::Persistence(
                "batch write unavailable".to_string(),
            ));
        }
        let key = id_field(data_type);
        let mut outcome = PersistOutcome::default();
        for item in items {
            let Some(id) = text(&item, key) else {
                outcome.failed.push((item, format!("missing {key}")));
                continue;
            };
            if inner.reject_ids.contains(&id) {
                outcome.failed.push((item, "write rejected".to_string()));
                continue;
            }
            inner.items.insert((data_type, id), item);
            outcome.success += 1;
        }
        Ok(outcome)
    }

    async fn window_stats(
        &self,
        tutor_id: &str,
        window_days: u32,
    ) -> Result<WindowStats, PipelineError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .stats
            .get(&(tutor_id.to_string(), window_days))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_aggregate(
        &self,
        tutor_id: &str,
        window_days: u32,
        metrics: &MetricSet,
    ) -> Result<Uuid, PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_saves_for.contains(tutor_id) {
            return Err(PipelineError::Persistence(format!(
                "save rejected for {tutor_id}"
            )));
        }
        inner
            .aggregates
            .insert((tutor_id.to_string(), window_days), metrics.clone());
        inner.aggregate_saves += 1;
        Ok(Uuid::new_v4())
    }

    async fn active_tutor_ids(&self, include_inactive: bool) -> Result<Vec<String>, PipelineError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_selection {
            return Err(PipelineError::Persistence("selection query failed".into()));
        }
        let mut ids = inner.active.clone();
        if include_inactive {
            ids.extend(inner.inactive.iter().cloned());
        }
        Ok(ids)
    }

    async fn delete_aggregates_before(
        &self,
        _cutoff: DateTime<Utc>,
    ) -> Result<u64, PipelineError> {
        // The memory store does not track timestamps; report a full sweep.
        let mut inner = self.inner.lock().unwrap();
        inner.retention_sweeps += 1;
        Ok(inner.aggregates.len() as u64)
    }
}
