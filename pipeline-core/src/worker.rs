use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::consume::Consumer;
use crate::envelope::Envelope;
use crate::metrics_consts::{
    WORKER_BACKEND_ERRORS, WORKER_EMPTY_PASSES, WORKER_HANDLER_FAILURES, WORKER_PASSES,
    WORKER_PASS_TIME,
};
use crate::PipelineError;

/// Per-message verdict from a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Fully processed (including the terminal dead-letter routings a stage
    /// performs itself); the loop acknowledges the delivery.
    Handled,
    /// Unexpected failure; the loop retries the message and, once the retry
    /// budget is spent, dead-letters it.
    Failed(String),
}

/// A per-channel stage. Handlers receive the whole consumed batch so stages
/// that persist once per pass (enrichment) can do so before anything is
/// acknowledged; the returned outcomes are positional, one per envelope.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle_batch(&self, channel: &str, batch: &[Envelope]) -> Vec<HandlerOutcome>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Bounded wait passed to the blocking read while the loop runs.
    pub block_timeout: Duration,
    pub max_retries: u32,
    /// How often the running loop attempts to claim abandoned deliveries.
    pub claim_interval: Duration,
    /// A delivery pending longer than this is considered abandoned by its
    /// original consumer and eligible for reclaim.
    pub claim_min_idle: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            block_timeout: Duration::from_secs(2),
            max_retries: 3,
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(60),
        }
    }
}

/// Generic polling driver: consume a batch per registered channel, dispatch
/// to that channel's handler, acknowledge successes, retry-then-dead-letter
/// failures. Runs either as one bounded pass (`run_once`) or as a daemon
/// (`run`) until the cancellation token fires; the in-flight pass always
/// completes before exit.
pub struct StreamWorker {
    consumer: Consumer,
    handlers: HashMap<String, Arc<dyn Handler>>,
    config: WorkerConfig,
    pass_hook: Option<Box<dyn Fn() + Send + Sync>>,
}

impl StreamWorker {
    pub fn new(consumer: Consumer, config: WorkerConfig) -> Self {
        Self {
            consumer,
            handlers: HashMap::new(),
            config,
            pass_hook: None,
        }
    }

    pub fn register(&mut self, channel: &str, handler: Arc<dyn Handler>) {
        self.handlers.insert(channel.to_string(), handler);
    }

    /// Invoked after every pass; used by binaries to report liveness.
    pub fn set_pass_hook(&mut self, hook: Box<dyn Fn() + Send + Sync>) {
        self.pass_hook = Some(hook);
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Create this worker's consumer group on every registered channel.
    pub async fn ensure_groups(&self, start_id: &str) -> Result<(), PipelineError> {
        for channel in self.handlers.keys() {
            self.consumer.ensure_group(channel, start_id).await?;
        }
        Ok(())
    }

    /// One bounded pass over every registered channel; returns the number
    /// of messages processed (acked, retried or dead-lettered).
    pub async fn run_once(&self) -> Result<usize, PipelineError> {
        self.pass(None).await
    }

    async fn pass(&self, block: Option<Duration>) -> Result<usize, PipelineError> {
        let start = Instant::now();
        let mut processed = 0;
        for (channel, handler) in &self.handlers {
            let batch = self
                .consumer
                .consume(channel, self.config.batch_size, block)
                .await?;
            if batch.is_empty() {
                continue;
            }
            processed += self.dispatch(channel, handler.as_ref(), batch).await;
        }
        metrics::counter!(WORKER_PASSES).increment(1);
        metrics::histogram!(WORKER_PASS_TIME).record(start.elapsed().as_millis() as f64);
        Ok(processed)
    }

    async fn dispatch(&self, channel: &str, handler: &dyn Handler, batch: Vec<Envelope>) -> usize {
        let mut outcomes = match std::panic::AssertUnwindSafe(handler.handle_batch(channel, &batch))
            .catch_unwind()
            .await
        {
            Ok(outcomes) => outcomes,
            Err(_) => {
                error!(channel, "handler panicked; failing the whole batch");
                Vec::new()
            }
        };
        // A short outcome vector is a handler bug; the uncovered tail is
        // treated as failed so nothing is silently left pending.
        while outcomes.len() < batch.len() {
            outcomes.push(HandlerOutcome::Failed("handler returned no outcome".into()));
        }

        let mut processed = 0;
        for (envelope, outcome) in batch.iter().zip(outcomes) {
            let Some(stream_id) = envelope.stream_id().map(str::to_string) else {
                warn!(channel, id = %envelope.id, "envelope without stream id; skipping");
                continue;
            };
            if let Err(err) = self
                .settle(channel, envelope, &stream_id, outcome)
                .await
            {
                // Ack/retry hit the backend; the delivery stays pending and
                // will be redelivered or claimed later. At-least-once holds.
                warn!(channel, id = %envelope.id, error = %err, "failed to settle message");
                metrics::counter!(WORKER_BACKEND_ERRORS).increment(1);
                continue;
            }
            processed += 1;
        }
        processed
    }

    async fn settle(
        &self,
        channel: &str,
        envelope: &Envelope,
        stream_id: &str,
        outcome: HandlerOutcome,
    ) -> Result<(), PipelineError> {
        if let HandlerOutcome::Failed(reason) = outcome {
            metrics::counter!(WORKER_HANDLER_FAILURES, "channel" => channel.to_string())
                .increment(1);
            warn!(channel, id = %envelope.id, reason, "handler failed; retrying message");
            self.consumer
                .retry(channel, envelope, self.config.max_retries)
                .await?;
        }
        // The original delivery is always acknowledged: retries and
        // dead-letterings republish their own copy.
        self.consumer.acknowledge(channel, stream_id).await?;
        Ok(())
    }

    /// Claim deliveries abandoned past the idle threshold on every
    /// registered channel and run them through the normal dispatch path.
    /// Returns the number of messages recovered.
    pub async fn run_claims(&self) -> usize {
        let mut recovered = 0;
        for (channel, handler) in &self.handlers {
            let claimed = match self
                .consumer
                .claim_idle(channel, self.config.claim_min_idle, self.config.batch_size)
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    warn!(channel, error = %err, "idle claim failed");
                    metrics::counter!(WORKER_BACKEND_ERRORS).increment(1);
                    continue;
                }
            };
            if claimed.is_empty() {
                continue;
            }
            info!(channel, count = claimed.len(), "recovered abandoned deliveries");
            recovered += self.dispatch(channel, handler.as_ref(), claimed).await;
        }
        recovered
    }

    /// Poll continuously until the token is cancelled. Sleeps the poll
    /// interval only after an empty pass; backend errors are logged and
    /// polling continues.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            group = self.consumer.group(),
            channels = ?self.handlers.keys().collect::<Vec<_>>(),
            "worker loop starting"
        );
        let mut last_claim = Instant::now();
        while !shutdown.is_cancelled() {
            let processed = match self.pass(Some(self.config.block_timeout)).await {
                Ok(processed) => processed,
                Err(err) => {
                    error!(error = %err, "worker pass failed; continuing to poll");
                    metrics::counter!(WORKER_BACKEND_ERRORS).increment(1);
                    0
                }
            };
            if let Some(hook) = &self.pass_hook {
                hook();
            }
            if last_claim.elapsed() >= self.config.claim_interval {
                self.run_claims().await;
                last_claim = Instant::now();
            }
            if processed == 0 {
                metrics::counter!(WORKER_EMPTY_PASSES).increment(1);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        info!(group = self.consumer.group(), "worker loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{decode, encode, payload, Payload};
    use crate::DEAD_LETTER_CHANNEL;
    use common_redis::{Client, MockRedisClient};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for FlakyHandler {
        async fn handle_batch(&self, _channel: &str, batch: &[Envelope]) -> Vec<HandlerOutcome> {
            batch
                .iter()
                .map(|envelope| {
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    if envelope.data.contains_key("poison") {
                        HandlerOutcome::Failed("poison pill".into())
                    } else {
                        HandlerOutcome::Handled
                    }
                })
                .collect()
        }
    }

    async fn seed(client: &MockRedisClient, channel: &str, data: &[(&str, serde_json::Value)]) {
        let raw = encode(channel, payload(data), Payload::new()).unwrap();
        client.xadd(channel, raw, None, None).await.unwrap();
    }

    fn worker(client: &MockRedisClient, handler: Arc<dyn Handler>) -> StreamWorker {
        let consumer = Consumer::new(Arc::new(client.clone()), "workers", "worker-1");
        let mut worker = StreamWorker::new(
            consumer,
            WorkerConfig {
                batch_size: 10,
                poll_interval: Duration::from_millis(5),
                block_timeout: Duration::from_millis(5),
                max_retries: 1,
                ..WorkerConfig::default()
            },
        );
        worker.register("sessions", handler);
        worker
    }

    #[tokio::test]
    async fn run_once_acks_successes_and_retries_failures() {
        let client = MockRedisClient::new();
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
        });
        let worker = worker(&client, handler.clone());
        worker.ensure_groups("0").await.unwrap();

        seed(&client, "sessions", &[("session_id", json!("S1"))]).await;
        seed(&client, "sessions", &[("poison", json!(true))]).await;

        let processed = worker.run_once().await.unwrap();
        assert_eq!(processed, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        // One bad message does not abort the batch: the good one is gone,
        // the bad one sits on the retry channel with its count bumped.
        assert!(worker
            .consumer()
            .pending_entries("sessions", 10)
            .await
            .unwrap()
            .is_empty());
        let retries = client.stream_payloads("sessions:retry");
        assert_eq!(retries.len(), 1);
        assert_eq!(decode(&retries[0]).unwrap().retry_count(), 1);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_dead_letters_through_the_loop() {
        let client = MockRedisClient::new();
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
        });
        let consumer = Consumer::new(Arc::new(client.clone()), "workers", "worker-1");
        let mut worker = StreamWorker::new(
            consumer,
            WorkerConfig {
                batch_size: 10,
                poll_interval: Duration::from_millis(5),
                block_timeout: Duration::from_millis(5),
                max_retries: 1,
                ..WorkerConfig::default()
            },
        );
        // Serve the retry channel through the same loop, as the deployed
        // validation worker does.
        worker.register("sessions", handler.clone());
        worker.register("sessions:retry", handler);
        worker.ensure_groups("0").await.unwrap();

        seed(&client, "sessions", &[("poison", json!(true))]).await;

        // Pass 1 moves it to retry, pass 2 exhausts the budget.
        worker.run_once().await.unwrap();
        worker.run_once().await.unwrap();

        assert!(client.stream_payloads(DEAD_LETTER_CHANNEL).len() == 1);
        let dead = decode(&client.stream_payloads(DEAD_LETTER_CHANNEL)[0]).unwrap();
        assert_eq!(dead.metadata.get("reason"), Some(&json!("max retries exceeded")));
        assert_eq!(dead.retry_count(), 2);
    }

    #[tokio::test]
    async fn abandoned_deliveries_are_claimed_and_processed() {
        let client = MockRedisClient::new();
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
        });
        let worker = worker(&client, handler.clone());
        worker.ensure_groups("0").await.unwrap();

        seed(&client, "sessions", &[("session_id", json!("S1"))]).await;

        // Another consumer in the same group reads the message and dies
        // before acknowledging it.
        let crashed = Consumer::new(Arc::new(client.clone()), "workers", "worker-crashed");
        assert_eq!(crashed.consume("sessions", 10, None).await.unwrap().len(), 1);
        assert_eq!(worker.run_once().await.unwrap(), 0);

        // Not idle long enough yet.
        assert_eq!(worker.run_claims().await, 0);

        client.age_pending("sessions", "workers", Duration::from_secs(120));
        assert_eq!(worker.run_claims().await, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(worker
            .consumer()
            .pending_entries("sessions", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let client = MockRedisClient::new();
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
        });
        let worker = worker(&client, handler);
        worker.ensure_groups("0").await.unwrap();

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let task = tokio::spawn(async move { worker.run(stop).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("worker did not stop after cancellation")
            .unwrap();
    }
}
