use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pipeline_core::{
    compute_metrics, AggregationWindow, Envelope, Handler, HandlerOutcome, PeriodicTimer,
    ScoringStrategy, Store,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics_consts::{
    AGGREGATES_COMPUTED, AGGREGATES_PERSISTED, EVENTS_CONSUMED, PENDING_ENTRIES, TUTORS_UPDATED,
    UPDATE_ERRORS,
};

/// Lifetime totals, readable without locking the debounce map.
#[derive(Default)]
pub struct UpdaterCounters {
    pub events_consumed: AtomicU64,
    pub aggregates_computed: AtomicU64,
    pub aggregates_persisted: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Default)]
struct DebounceState {
    /// tutor_id to the arrival time of its most recent completion event.
    pending: HashMap<String, Instant>,
    updated_tutors: HashSet<String>,
}

/// Recomputes a tutor's aggregates shortly after their sessions complete.
///
/// Completion events within the debounce window collapse onto one entry in
/// the pending map, so a tutor finishing a burst of sessions costs a single
/// recomputation. The flush task owns the clock; the handler only records
/// arrivals.
pub struct MetricsUpdater {
    store: Arc<dyn Store>,
    scorer: Box<dyn ScoringStrategy>,
    windows: Vec<AggregationWindow>,
    /// None disables debouncing; events recompute inline.
    debounce_window: Option<Duration>,
    state: Mutex<DebounceState>,
    pub counters: UpdaterCounters,
}

impl MetricsUpdater {
    pub fn new(
        store: Arc<dyn Store>,
        scorer: Box<dyn ScoringStrategy>,
        windows: Vec<AggregationWindow>,
        debounce_window: Option<Duration>,
    ) -> Self {
        Self {
            store,
            scorer,
            windows,
            debounce_window,
            state: Mutex::new(DebounceState::default()),
            counters: UpdaterCounters::default(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn tutors_updated(&self) -> usize {
        self.state.lock().unwrap().updated_tutors.len()
    }

    fn completed_tutor_id(envelope: &Envelope) -> Option<String> {
        let completed = envelope.data.get("status").and_then(Value::as_str) == Some("completed");
        if !completed {
            return None;
        }
        envelope
            .data
            .get("tutor_id")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Recompute and persist every configured window for one tutor. A
    /// window failing does not block the remaining windows.
    async fn recompute(&self, tutor_id: &str) {
        for window in &self.windows {
            let stats = match self.store.window_stats(tutor_id, window.days).await {
                Ok(stats) => stats,
                Err(err) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(UPDATE_ERRORS).increment(1);
                    warn!(tutor_id, days = window.days, error = %err, "window stats query failed");
                    continue;
                }
            };
            let metric_set = compute_metrics(&stats, self.scorer.as_ref());
            self.counters
                .aggregates_computed
                .fetch_add(1, Ordering::Relaxed);
            metrics::counter!(AGGREGATES_COMPUTED).increment(1);

            match self
                .store
                .save_aggregate(tutor_id, window.days, &metric_set)
                .await
            {
                Ok(_) => {
                    self.counters
                        .aggregates_persisted
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(AGGREGATES_PERSISTED).increment(1);
                }
                Err(err) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(UPDATE_ERRORS).increment(1);
                    warn!(tutor_id, days = window.days, error = %err, "aggregate save failed");
                }
            }
        }
        let distinct = {
            let mut state = self.state.lock().unwrap();
            state.updated_tutors.insert(tutor_id.to_string());
            state.updated_tutors.len()
        };
        metrics::gauge!(TUTORS_UPDATED).set(distinct as f64);
        debug!(tutor_id, "aggregates recomputed");
    }

    /// Flush pending entries older than the debounce window. Returns how
    /// many tutors were recomputed.
    pub async fn flush_due(&self) -> usize {
        let Some(window) = self.debounce_window else {
            return 0;
        };
        self.flush_where(|queued_at| queued_at.elapsed() >= window)
            .await
    }

    /// Flush everything regardless of age. Used on shutdown.
    pub async fn flush_all(&self) -> usize {
        self.flush_where(|_| true).await
    }

    async fn flush_where(&self, due: impl Fn(&Instant) -> bool) -> usize {
        let ready: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            let ready: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, queued_at)| due(queued_at))
                .map(|(tutor_id, _)| tutor_id.clone())
                .collect();
            for tutor_id in &ready {
                state.pending.remove(tutor_id);
            }
            metrics::gauge!(PENDING_ENTRIES).set(state.pending.len() as f64);
            ready
        };
        for tutor_id in &ready {
            self.recompute(tutor_id).await;
        }
        ready.len()
    }

    /// Drive periodic flushes until shutdown, then force out the remainder
    /// so no queued update is lost to a restart.
    pub async fn run_flush_loop(self: Arc<Self>, mut timer: PeriodicTimer) {
        while timer.tick().await {
            self.flush_due().await;
        }
        let flushed = self.flush_all().await;
        info!(flushed, "final debounce flush complete");
    }
}

#[async_trait]
impl Handler for MetricsUpdater {
    async fn handle_batch(&self, _channel: &str, batch: &[Envelope]) -> Vec<HandlerOutcome> {
        self.counters
            .events_consumed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        metrics::counter!(EVENTS_CONSUMED).increment(batch.len() as u64);

        for envelope in batch {
            let Some(tutor_id) = Self::completed_tutor_id(envelope) else {
                continue;
            };
            if self.debounce_window.is_some() {
                let pending = {
                    let mut state = self.state.lock().unwrap();
                    state.pending.insert(tutor_id, Instant::now());
                    state.pending.len()
                };
                metrics::gauge!(PENDING_ENTRIES).set(pending as f64);
            } else {
                self.recompute(&tutor_id).await;
            }
        }
        // Aggregates are derived data and re-derivable by the nightly run,
        // so events are acknowledged even when a recompute failed.
        batch.iter().map(|_| HandlerOutcome::Handled).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::test_support::MemoryStore;
    use pipeline_core::{decode, encode, Payload, WeightedScoring, DEFAULT_WINDOWS};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn completion_event(tutor_id: &str) -> Envelope {
        let data: Payload = [
            ("session_id".to_string(), json!("S1")),
            ("tutor_id".to_string(), json!(tutor_id)),
            ("status".to_string(), json!("completed")),
            ("duration_minutes".to_string(), json!(60)),
        ]
        .into_iter()
        .collect();
        decode(&encode("sessions:validated", data, Payload::new()).unwrap()).unwrap()
    }

    fn updater(store: Arc<MemoryStore>, debounce: Option<Duration>) -> MetricsUpdater {
        MetricsUpdater::new(
            store,
            Box::new(WeightedScoring),
            DEFAULT_WINDOWS.to_vec(),
            debounce,
        )
    }

    #[tokio::test]
    async fn repeated_completions_collapse_to_one_recomputation() {
        let store = Arc::new(MemoryStore::new());
        let updater = updater(store.clone(), Some(Duration::from_millis(20)));

        let batch: Vec<Envelope> = (0..5).map(|_| completion_event("T1")).collect();
        updater.handle_batch("sessions:validated", &batch).await;
        assert_eq!(updater.pending_count(), 1);

        // Nothing has aged past the window yet.
        assert_eq!(updater.flush_due().await, 0);
        assert_eq!(store.aggregate_saves(), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(updater.flush_due().await, 1);
        assert_eq!(store.aggregate_saves(), DEFAULT_WINDOWS.len() as u64);
        assert_eq!(updater.pending_count(), 0);
        assert_eq!(updater.tutors_updated(), 1);
    }

    #[tokio::test]
    async fn disabled_debounce_recomputes_inline() {
        let store = Arc::new(MemoryStore::new());
        let updater = updater(store.clone(), None);

        let batch: Vec<Envelope> = (0..2).map(|_| completion_event("T1")).collect();
        updater.handle_batch("sessions:validated", &batch).await;

        // Each event triggers its own full recomputation.
        assert_eq!(store.aggregate_saves(), 2 * DEFAULT_WINDOWS.len() as u64);
        assert_eq!(updater.pending_count(), 0);
    }

    #[tokio::test]
    async fn non_completed_sessions_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let updater = updater(store.clone(), Some(Duration::from_millis(5)));

        let mut cancelled = completion_event("T1");
        cancelled
            .data
            .insert("status".to_string(), json!("cancelled"));
        let outcomes = updater
            .handle_batch("sessions:validated", &[cancelled])
            .await;

        assert_eq!(outcomes, vec![HandlerOutcome::Handled]);
        assert_eq!(updater.pending_count(), 0);
        assert_eq!(updater.flush_all().await, 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_entries() {
        let store = Arc::new(MemoryStore::new());
        let updater = Arc::new(updater(store.clone(), Some(Duration::from_secs(60))));
        updater
            .handle_batch("sessions:validated", &[completion_event("T1")])
            .await;

        let shutdown = CancellationToken::new();
        let timer = PeriodicTimer::new(Duration::from_secs(60), shutdown.clone());
        let flusher = tokio::spawn(updater.clone().run_flush_loop(timer));

        shutdown.cancel();
        flusher.await.unwrap();
        assert_eq!(store.aggregate_saves(), DEFAULT_WINDOWS.len() as u64);
        assert_eq!(updater.pending_count(), 0);
    }

    #[tokio::test]
    async fn one_window_failure_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        store.fail_saves_for("T1");
        let updater = updater(store.clone(), None);

        updater
            .handle_batch("sessions:validated", &[completion_event("T1")])
            .await;

        // Saves failed but every window was still attempted and counted.
        assert_eq!(
            updater.counters.aggregates_computed.load(Ordering::Relaxed),
            DEFAULT_WINDOWS.len() as u64
        );
        assert_eq!(
            updater.counters.errors.load(Ordering::Relaxed),
            DEFAULT_WINDOWS.len() as u64
        );
        assert_eq!(store.aggregate_saves(), 0);
    }
}
