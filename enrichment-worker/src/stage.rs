use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pipeline_core::{
    Channel, Envelope, Handler, HandlerOutcome, Payload, Publisher, Store, DEAD_LETTER_CHANNEL,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::enrich::enrich;
use crate::metrics_consts::{
    ENRICHMENT_FAILURES, ITEMS_PERSISTED, MESSAGES_ENRICHED, PERSIST_FAILURES,
};

fn natural_key(channel: Channel) -> &'static str {
    match channel {
        Channel::Tutors => "tutor_id",
        Channel::Sessions => "session_id",
        Channel::Feedback => "feedback_id",
    }
}

fn natural_id(channel: Channel, data: &Payload) -> Option<String> {
    data.get(natural_key(channel))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// The enrichment stage: derive fields, project to the store's field set,
/// persist the whole pass as one batch, acknowledge afterwards. Failures
/// (enrichment or per-item persistence) are terminal here - they go to the
/// dead-letter stream and the original is acknowledged; retries happen
/// upstream only where explicitly wired.
pub struct EnrichmentHandler {
    store: Arc<dyn Store>,
    publisher: Publisher,
}

impl EnrichmentHandler {
    pub fn new(store: Arc<dyn Store>, publisher: Publisher) -> Self {
        Self { store, publisher }
    }

    /// `<channel>:validated` and its retry stream both carry the data type
    /// of the base channel.
    fn logical_channel(channel: &str) -> Option<Channel> {
        let base = channel.strip_suffix(":retry").unwrap_or(channel);
        base.strip_suffix(":validated").unwrap_or(base).parse().ok()
    }

    async fn dead_letter(
        &self,
        source_queue: &str,
        envelope: &Envelope,
        errors: Vec<String>,
    ) -> HandlerOutcome {
        let mut metadata = envelope.metadata.clone();
        metadata.remove("stream_id");
        metadata.insert("enrichment_errors".to_string(), json!(errors));
        metadata.insert("enrichment_failed_at".to_string(), json!(Utc::now()));
        metadata.insert("source_queue".to_string(), json!(source_queue));

        match self
            .publisher
            .publish(DEAD_LETTER_CHANNEL, envelope.data.clone(), metadata)
            .await
        {
            Ok(_) => {
                warn!(channel = source_queue, id = %envelope.id, "message dead-lettered by enrichment");
                HandlerOutcome::Handled
            }
            Err(err) => HandlerOutcome::Failed(format!("dead-letter failed: {err}")),
        }
    }
}

#[async_trait]
impl Handler for EnrichmentHandler {
    async fn handle_batch(&self, channel: &str, batch: &[Envelope]) -> Vec<HandlerOutcome> {
        let Some(logical) = Self::logical_channel(channel) else {
            warn!(channel, "batch on unmapped channel; acknowledging");
            return batch.iter().map(|_| HandlerOutcome::Handled).collect();
        };

        let mut outcomes: Vec<Option<HandlerOutcome>> = Vec::with_capacity(batch.len());
        outcomes.resize_with(batch.len(), || None);

        // Enrich everything first; only clean items enter the batch write.
        // An item without its natural key could never be matched back to a
        // store failure, so it is dead-lettered here instead of persisted.
        let mut to_persist = Vec::new();
        for (idx, envelope) in batch.iter().enumerate() {
            match enrich(logical, &envelope.data) {
                Ok(enriched) if natural_id(logical, &enriched).is_some() => {
                    to_persist.push((idx, enriched));
                }
                Ok(_) => {
                    metrics::counter!(ENRICHMENT_FAILURES, "channel" => logical.as_str())
                        .increment(1);
                    let errors = vec![format!("missing {}", natural_key(logical))];
                    outcomes[idx] = Some(self.dead_letter(channel, envelope, errors).await);
                }
                Err(errors) => {
                    metrics::counter!(ENRICHMENT_FAILURES, "channel" => logical.as_str())
                        .increment(1);
                    outcomes[idx] = Some(self.dead_letter(channel, envelope, errors).await);
                }
            }
        }
        metrics::counter!(MESSAGES_ENRICHED, "channel" => logical.as_str())
            .increment(to_persist.len() as u64);

        // One store call per pass; members are settled only afterwards.
        if !to_persist.is_empty() {
            let items: Vec<Payload> = to_persist.iter().map(|(_, item)| item.clone()).collect();
            match self.store.persist_batch(logical, items).await {
                Ok(outcome) => {
                    metrics::counter!(ITEMS_PERSISTED, "channel" => logical.as_str())
                        .increment(outcome.success as u64);
                    let failed_by_id: HashMap<String, String> = outcome
                        .failed
                        .into_iter()
                        .filter_map(|(item, error)| {
                            natural_id(logical, &item).map(|id| (id, error))
                        })
                        .collect();
                    if !failed_by_id.is_empty() {
                        metrics::counter!(PERSIST_FAILURES, "channel" => logical.as_str())
                            .increment(failed_by_id.len() as u64);
                    }
                    for (idx, item) in to_persist {
                        let failed = natural_id(logical, &item)
                            .and_then(|id| failed_by_id.get(&id).cloned());
                        outcomes[idx] = Some(match failed {
                            Some(error) => {
                                self.dead_letter(
                                    channel,
                                    &batch[idx],
                                    vec![format!("persistence_error: {error}")],
                                )
                                .await
                            }
                            None => HandlerOutcome::Handled,
                        });
                    }
                }
                Err(err) => {
                    // The whole write failed; leave these to the retry path.
                    warn!(channel, error = %err, "batch persist failed");
                    for (idx, _) in to_persist {
                        outcomes[idx] =
                            Some(HandlerOutcome::Failed(format!("persist failed: {err}")));
                    }
                }
            }
        }

        debug!(channel, batch = batch.len(), "enrichment pass settled");
        outcomes
            .into_iter()
            .map(|o| o.unwrap_or(HandlerOutcome::Handled))
            .collect()
    }
}
