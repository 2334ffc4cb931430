use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use pipeline_core::{compute_metrics, AggregationWindow, ScoringStrategy, Store};
use tracing::{debug, error, info, warn};

use crate::metrics_consts::{
    ENTITIES_FAILED, ENTITIES_SKIPPED, ENTITIES_SUCCEEDED, METRICS_SAVED, RETENTION_DELETED,
    RUNS_COMPLETED, RUN_TIME,
};

/// Marker entity id for a run that died before any tutor was processed.
const SELECTION_FAILURE_ID: &str = "(selection)";

#[derive(Debug, Clone)]
pub struct EntityError {
    pub tutor_id: String,
    pub error: String,
}

/// Built up while a run executes, frozen when it returns.
#[derive(Debug, Clone)]
pub struct AggregationRunSummary {
    pub run_date: NaiveDate,
    pub total_entities: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_metrics_saved: usize,
    pub total_runtime: Duration,
    pub errors: Vec<EntityError>,
}

impl AggregationRunSummary {
    fn new(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            total_entities: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            total_metrics_saved: 0,
            total_runtime: Duration::ZERO,
            errors: Vec::new(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_entities == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total_entities as f64 * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub retention_days: Option<u64>,
    /// Explicit tutor ids to process. Empty means select from the store.
    pub tutor_ids: Vec<String>,
    pub include_inactive: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            retention_days: Some(365),
            tutor_ids: Vec::new(),
            include_inactive: false,
        }
    }
}

enum EntityOutcome {
    Saved(usize),
    Skipped,
    Failed(String),
}

/// The nightly full recomputation. Unlike the real-time updater this walks
/// every selected tutor, so one bad entity must never sink the run.
pub struct BatchRunner {
    store: Arc<dyn Store>,
    scorer: Box<dyn ScoringStrategy>,
    windows: Vec<AggregationWindow>,
    options: RunOptions,
}

impl BatchRunner {
    pub fn new(
        store: Arc<dyn Store>,
        scorer: Box<dyn ScoringStrategy>,
        windows: Vec<AggregationWindow>,
        options: RunOptions,
    ) -> Self {
        Self {
            store,
            scorer,
            windows,
            options,
        }
    }

    pub async fn run(&self) -> AggregationRunSummary {
        let started = Instant::now();
        let mut summary = AggregationRunSummary::new(Utc::now().date_naive());

        let tutor_ids = if self.options.tutor_ids.is_empty() {
            match self
                .store
                .active_tutor_ids(self.options.include_inactive)
                .await
            {
                Ok(ids) => ids,
                Err(err) => {
                    // Nothing was processed; the run is over.
                    error!(error = %err, "tutor selection failed, aborting run");
                    summary.total_entities = 1;
                    summary.failed = 1;
                    summary.errors.push(EntityError {
                        tutor_id: SELECTION_FAILURE_ID.to_string(),
                        error: err.to_string(),
                    });
                    summary.total_runtime = started.elapsed();
                    return summary;
                }
            }
        } else {
            self.options.tutor_ids.clone()
        };
        summary.total_entities = tutor_ids.len();
        info!(
            entities = summary.total_entities,
            run_date = %summary.run_date,
            "aggregation run starting"
        );

        // Entities are processed in fixed-size batches so a long run emits
        // progress at a readable cadence; each window save still commits on
        // its own, keeping partial entity work valid after a crash.
        let batch_count = tutor_ids.chunks(self.options.batch_size).len();
        for (batch_index, batch) in tutor_ids.chunks(self.options.batch_size).enumerate() {
            for tutor_id in batch {
                match self.process_entity(tutor_id).await {
                    EntityOutcome::Saved(saved) => {
                        summary.successful += 1;
                        summary.total_metrics_saved += saved;
                    }
                    EntityOutcome::Skipped => summary.skipped += 1,
                    EntityOutcome::Failed(error) => {
                        summary.failed += 1;
                        summary.errors.push(EntityError {
                            tutor_id: tutor_id.clone(),
                            error,
                        });
                    }
                }
            }
            debug!(
                batch = batch_index + 1,
                of = batch_count,
                successful = summary.successful,
                failed = summary.failed,
                skipped = summary.skipped,
                "aggregation batch complete"
            );
        }

        if summary.successful > 0 {
            self.retention_cleanup().await;
        }

        summary.total_runtime = started.elapsed();
        metrics::counter!(RUNS_COMPLETED).increment(1);
        metrics::counter!(ENTITIES_SUCCEEDED).increment(summary.successful as u64);
        metrics::counter!(ENTITIES_FAILED).increment(summary.failed as u64);
        metrics::counter!(ENTITIES_SKIPPED).increment(summary.skipped as u64);
        metrics::counter!(METRICS_SAVED).increment(summary.total_metrics_saved as u64);
        metrics::histogram!(RUN_TIME).record(summary.total_runtime.as_secs_f64());
        info!(
            successful = summary.successful,
            failed = summary.failed,
            skipped = summary.skipped,
            metrics_saved = summary.total_metrics_saved,
            success_rate = summary.success_rate(),
            runtime_ms = summary.total_runtime.as_millis() as u64,
            "aggregation run finished"
        );
        summary
    }

    /// All windows for one tutor, with a bounded number of whole-entity
    /// attempts. Windows with no sessions write nothing; a tutor with no
    /// sessions anywhere is skipped rather than counted as a success.
    async fn process_entity(&self, tutor_id: &str) -> EntityOutcome {
        let mut last_error = String::new();
        for attempt in 1..=self.options.max_attempts {
            match self.aggregate_entity(tutor_id).await {
                Ok(0) => return EntityOutcome::Skipped,
                Ok(saved) => return EntityOutcome::Saved(saved),
                Err(error) => {
                    warn!(tutor_id, attempt, error, "entity aggregation failed");
                    last_error = error;
                    if attempt < self.options.max_attempts {
                        tokio::time::sleep(self.options.retry_delay).await;
                    }
                }
            }
        }
        EntityOutcome::Failed(last_error)
    }

    async fn aggregate_entity(&self, tutor_id: &str) -> Result<usize, String> {
        let mut saved = 0;
        for window in &self.windows {
            let stats = self
                .store
                .window_stats(tutor_id, window.days)
                .await
                .map_err(|err| err.to_string())?;
            if stats.sessions_count == 0 {
                continue;
            }
            let metric_set = compute_metrics(&stats, self.scorer.as_ref());
            self.store
                .save_aggregate(tutor_id, window.days, &metric_set)
                .await
                .map_err(|err| err.to_string())?;
            saved += 1;
        }
        Ok(saved)
    }

    async fn retention_cleanup(&self) {
        let Some(days) = self.options.retention_days else {
            return;
        };
        let Some(cutoff) = Utc::now().checked_sub_days(Days::new(days)) else {
            return;
        };
        match self.store.delete_aggregates_before(cutoff).await {
            Ok(deleted) => {
                metrics::counter!(RETENTION_DELETED).increment(deleted);
                info!(deleted, retention_days = days, "retention cleanup done");
            }
            Err(err) => warn!(error = %err, "retention cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::test_support::MemoryStore;
    use pipeline_core::{WeightedScoring, WindowStats, DEFAULT_WINDOWS};

    fn stats(sessions: i64) -> WindowStats {
        WindowStats {
            sessions_count: sessions,
            completed_sessions: sessions,
            cancelled_sessions: 0,
            total_minutes: sessions * 60,
            unique_students: sessions,
            rating_sum: sessions as f64 * 5.0,
            rating_count: sessions,
        }
    }

    fn runner(store: Arc<MemoryStore>, options: RunOptions) -> BatchRunner {
        BatchRunner::new(
            store,
            Box::new(WeightedScoring),
            DEFAULT_WINDOWS.to_vec(),
            options,
        )
    }

    fn fast_options() -> RunOptions {
        RunOptions {
            max_attempts: 2,
            retry_delay: Duration::from_millis(1),
            batch_size: 2,
            ..RunOptions::default()
        }
    }

    #[tokio::test]
    async fn summary_arithmetic_holds_with_mixed_outcomes() {
        let store = Arc::new(MemoryStore::new());
        store.seed_tutors(&["T1", "T2", "T3"], &[]);
        // T1 has data in one window, T2 has data but a failing store,
        // T3 has no sessions at all.
        store.seed_window_stats("T1", 7, stats(5));
        store.seed_window_stats("T2", 7, stats(2));
        store.fail_saves_for("T2");

        let summary = runner(store.clone(), fast_options()).run().await;

        assert_eq!(summary.total_entities, 3);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            summary.successful + summary.failed + summary.skipped,
            summary.total_entities
        );
        assert_eq!(summary.total_metrics_saved, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].tutor_id, "T2");
        assert!(store.aggregate("T1", 7).is_some());
    }

    #[tokio::test]
    async fn empty_run_reports_zero_success_rate() {
        let store = Arc::new(MemoryStore::new());
        let summary = runner(store, fast_options()).run().await;
        assert_eq!(summary.total_entities, 0);
        assert_eq!(summary.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn selection_failure_is_one_synthetic_entry() {
        let store = Arc::new(MemoryStore::new());
        store.fail_selection();

        let summary = runner(store.clone(), fast_options()).run().await;

        assert_eq!(summary.total_entities, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].tutor_id, SELECTION_FAILURE_ID);
        assert_eq!(store.retention_sweeps(), 0);
    }

    #[tokio::test]
    async fn explicit_id_list_bypasses_selection() {
        let store = Arc::new(MemoryStore::new());
        store.fail_selection();
        store.seed_window_stats("T9", 30, stats(3));

        let options = RunOptions {
            tutor_ids: vec!["T9".to_string()],
            ..fast_options()
        };
        let summary = runner(store.clone(), options).run().await;

        assert_eq!(summary.total_entities, 1);
        assert_eq!(summary.successful, 1);
        assert!(store.aggregate("T9", 30).is_some());
    }

    #[tokio::test]
    async fn retention_runs_only_after_a_successful_entity() {
        let store = Arc::new(MemoryStore::new());
        store.seed_tutors(&["T1"], &[]);
        store.seed_window_stats("T1", 7, stats(1));
        store.fail_saves_for("T1");

        let failing = runner(store.clone(), fast_options());
        let summary = failing.run().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(store.retention_sweeps(), 0);

        let fresh = Arc::new(MemoryStore::new());
        fresh.seed_tutors(&["T1"], &[]);
        fresh.seed_window_stats("T1", 7, stats(1));
        runner(fresh.clone(), fast_options()).run().await;
        assert_eq!(fresh.retention_sweeps(), 1);
    }

    #[tokio::test]
    async fn inactive_tutors_included_on_request() {
        let store = Arc::new(MemoryStore::new());
        store.seed_tutors(&["T1"], &["T2"]);

        let summary = runner(store.clone(), fast_options()).run().await;
        assert_eq!(summary.total_entities, 1);

        let options = RunOptions {
            include_inactive: true,
            ..fast_options()
        };
        let summary = runner(store, options).run().await;
        assert_eq!(summary.total_entities, 2);
    }
}
