use async_trait::async_trait;
use chrono::Utc;
use pipeline_core::{
    Channel, Envelope, Handler, HandlerOutcome, Publisher, DEAD_LETTER_CHANNEL,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::metrics_consts::{
    MESSAGES_INVALID, MESSAGES_UNKNOWN_CHANNEL, MESSAGES_VALID, WARNINGS_RAISED,
};
use crate::rules::{validate, ValidationOutcome};

/// The validation stage: every message is either forwarded to its type's
/// enrichment-input channel or dead-lettered with structured errors. Nothing
/// is silently dropped.
pub struct ValidationHandler {
    publisher: Publisher,
}

impl ValidationHandler {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    /// Retry channels carry the same data type as their base channel.
    fn logical_channel(channel: &str) -> Option<Channel> {
        channel
            .strip_suffix(":retry")
            .unwrap_or(channel)
            .parse()
            .ok()
    }

    async fn forward_valid(
        &self,
        channel: Channel,
        envelope: &Envelope,
        outcome: &ValidationOutcome,
    ) -> HandlerOutcome {
        let mut metadata = envelope.metadata.clone();
        metadata.remove("stream_id");
        metadata.insert("validated_at".to_string(), json!(Utc::now()));
        metadata.insert("warning_count".to_string(), json!(outcome.warnings.len()));

        match self
            .publisher
            .publish(&channel.validated(), envelope.data.clone(), metadata)
            .await
        {
            Ok(_) => {
                metrics::counter!(MESSAGES_VALID, "channel" => channel.as_str()).increment(1);
                if !outcome.warnings.is_empty() {
                    metrics::counter!(WARNINGS_RAISED, "channel" => channel.as_str())
                        .increment(outcome.warnings.len() as u64);
                }
                HandlerOutcome::Handled
            }
            // Forwarding failed: leave the message to the retry path so it
            // is not lost.
            Err(err) => HandlerOutcome::Failed(format!("forward failed: {err}")),
        }
    }

    async fn dead_letter_invalid(
        &self,
        source_channel: &str,
        envelope: &Envelope,
        outcome: &ValidationOutcome,
    ) -> HandlerOutcome {
        let errors: Vec<_> = outcome
            .errors
            .iter()
            .map(|e| json!({"field": e.field, "message": e.message}))
            .collect();
        let mut metadata = envelope.metadata.clone();
        metadata.remove("stream_id");
        metadata.insert("validation_errors".to_string(), json!(errors));
        metadata.insert("source_channel".to_string(), json!(source_channel));
        metadata.insert("failed_at".to_string(), json!(Utc::now()));

        match self
            .publisher
            .publish(DEAD_LETTER_CHANNEL, envelope.data.clone(), metadata)
            .await
        {
            Ok(_) => {
                metrics::counter!(MESSAGES_INVALID, "channel" => source_channel.to_string())
                    .increment(1);
                warn!(
                    channel = source_channel,
                    id = %envelope.id,
                    errors = outcome.errors.len(),
                    "message failed validation"
                );
                HandlerOutcome::Handled
            }
            Err(err) => HandlerOutcome::Failed(format!("dead-letter failed: {err}")),
        }
    }
}

#[async_trait]
impl Handler for ValidationHandler {
    async fn handle_batch(&self, channel: &str, batch: &[Envelope]) -> Vec<HandlerOutcome> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let logical = Self::logical_channel(channel);
        for envelope in batch {
            let Some(logical) = logical else {
                // Should be unreachable with static channel wiring; ack so
                // a bad registration cannot wedge the stream.
                metrics::counter!(MESSAGES_UNKNOWN_CHANNEL).increment(1);
                warn!(channel, id = %envelope.id, "message on unmapped channel; acknowledging");
                outcomes.push(HandlerOutcome::Handled);
                continue;
            };
            let outcome = validate(logical, &envelope.data);
            debug!(
                channel,
                id = %envelope.id,
                valid = outcome.is_valid(),
                warnings = outcome.warnings.len(),
                "validated message"
            );
            let handled = if outcome.is_valid() {
                self.forward_valid(logical, envelope, &outcome).await
            } else {
                self.dead_letter_invalid(channel, envelope, &outcome).await
            };
            outcomes.push(handled);
        }
        outcomes
    }
}
