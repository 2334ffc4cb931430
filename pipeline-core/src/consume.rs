use std::sync::Arc;
use std::time::Duration;

use common_redis::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::envelope::{decode, encode_envelope, Envelope};
use crate::metrics_consts::{
    DECODE_FAILURES, MESSAGES_ACKED, MESSAGES_CLAIMED, MESSAGES_CONSUMED, MESSAGES_DEAD_LETTERED,
    MESSAGES_RETRIED,
};
use crate::publish::PublisherConfig;
use crate::{PipelineError, DEAD_LETTER_CHANNEL};

/// One unacknowledged delivery, as reported by the streaming primitive.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub consumer: String,
    pub delivery_count: u64,
    pub idle: Duration,
}

/// Reads envelopes from a channel under a `(group, consumer name)` pair.
///
/// Delivery state lives entirely in the streaming primitive and is only
/// mutated through acknowledge/claim; the consumer never rewrites offsets
/// directly. Decode failures (checksum mismatch, bad JSON) are acked on the
/// spot so a corrupt entry cannot be redelivered forever, and are never
/// handed to a handler.
pub struct Consumer {
    client: Arc<dyn Client>,
    group: String,
    name: String,
    limits: PublisherConfig,
}

impl Consumer {
    pub fn new(client: Arc<dyn Client>, group: &str, name: &str) -> Self {
        Self {
            client,
            group: group.to_string(),
            name: name.to_string(),
            limits: PublisherConfig::default(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Create the consumer group at `start_id` ("0" replays the stream,
    /// "$" starts at new entries). Creating an existing group is a no-op.
    pub async fn ensure_group(&self, channel: &str, start_id: &str) -> Result<(), PipelineError> {
        let created = self
            .client
            .xgroup_create(channel, &self.group, start_id)
            .await?;
        if created {
            debug!(channel, group = %self.group, start_id, "created consumer group");
        }
        Ok(())
    }

    /// Read up to `count` undelivered envelopes for this group.
    pub async fn consume(
        &self,
        channel: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Envelope>, PipelineError> {
        let entries = self
            .client
            .xread_group(channel, &self.group, &self.name, count, block)
            .await?;
        self.decode_entries(channel, entries).await
    }

    /// Mark one delivery fully processed. Returns false when the entry was
    /// not pending for this group (e.g. already acknowledged).
    pub async fn acknowledge(&self, channel: &str, stream_id: &str) -> Result<bool, PipelineError> {
        let acked = self.client.xack(channel, &self.group, stream_id).await?;
        if acked > 0 {
            metrics::counter!(MESSAGES_ACKED, "channel" => channel.to_string()).increment(acked);
        }
        Ok(acked > 0)
    }

    /// Republish a failed envelope. While `retry_count` stays within
    /// `max_retries` it goes to `<channel>:retry` and this returns true;
    /// past the limit it goes to the dead-letter stream with a terminal
    /// reason and this returns false. Either way the caller must still
    /// acknowledge the original delivery.
    pub async fn retry(
        &self,
        channel: &str,
        envelope: &Envelope,
        max_retries: u32,
    ) -> Result<bool, PipelineError> {
        let mut retried = envelope.clone();
        let retry_count = envelope.retry_count() + 1;
        retried
            .metadata
            .insert("retry_count".to_string(), json!(retry_count));
        retried
            .metadata
            .entry("original_channel".to_string())
            .or_insert_with(|| json!(channel));

        if retry_count <= max_retries {
            let payload = encode_envelope(&retried)?;
            // A message failing on its retry channel stays on that channel.
            let retry_channel = if channel.ends_with(":retry") {
                channel.to_string()
            } else {
                format!("{channel}:retry")
            };
            self.append(&retry_channel, payload).await?;
            metrics::counter!(MESSAGES_RETRIED, "channel" => channel.to_string()).increment(1);
            debug!(channel, id = %envelope.id, retry_count, "republished for retry");
            Ok(true)
        } else {
            retried
                .metadata
                .insert("reason".to_string(), json!("max retries exceeded"));
            self.dead_letter_envelope(channel, &retried).await?;
            Ok(false)
        }
    }

    /// Route an envelope to the dead-letter stream, recording the channel
    /// it came from. Terminal; the message will not be processed again.
    pub async fn dead_letter(
        &self,
        source_channel: &str,
        envelope: &Envelope,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let mut dead = envelope.clone();
        dead.metadata.insert("reason".to_string(), json!(reason));
        self.dead_letter_envelope(source_channel, &dead).await
    }

    async fn dead_letter_envelope(
        &self,
        source_channel: &str,
        envelope: &Envelope,
    ) -> Result<(), PipelineError> {
        let mut dead = envelope.clone();
        dead.metadata
            .entry("source_channel".to_string())
            .or_insert_with(|| json!(source_channel));
        let payload = encode_envelope(&dead)?;
        self.append(DEAD_LETTER_CHANNEL, payload).await?;
        metrics::counter!(MESSAGES_DEAD_LETTERED, "channel" => source_channel.to_string())
            .increment(1);
        warn!(channel = source_channel, id = %envelope.id, "message dead-lettered");
        Ok(())
    }

    /// List unacknowledged deliveries for operational visibility.
    pub async fn pending_entries(
        &self,
        channel: &str,
        count: usize,
    ) -> Result<Vec<DeliveryRecord>, PipelineError> {
        let pending = self.client.xpending(channel, &self.group, count).await?;
        Ok(pending
            .into_iter()
            .map(|p| DeliveryRecord {
                message_id: p.id,
                consumer: p.consumer,
                delivery_count: p.delivery_count,
                idle: p.idle,
            })
            .collect())
    }

    /// Reassign deliveries idle longer than `min_idle` to this consumer.
    /// This is how messages abandoned by a crashed consumer get recovered.
    pub async fn claim_idle(
        &self,
        channel: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Envelope>, PipelineError> {
        let entries = self
            .client
            .xautoclaim(channel, &self.group, &self.name, min_idle, count)
            .await?;
        if !entries.is_empty() {
            metrics::counter!(MESSAGES_CLAIMED, "channel" => channel.to_string())
                .increment(entries.len() as u64);
        }
        self.decode_entries(channel, entries).await
    }

    async fn append(&self, channel: &str, payload: String) -> Result<(), PipelineError> {
        self.client
            .xadd(
                channel,
                payload,
                Some(self.limits.max_stream_length),
                Some(self.limits.stream_ttl),
            )
            .await?;
        Ok(())
    }

    async fn decode_entries(
        &self,
        channel: &str,
        entries: Vec<common_redis::StreamEntry>,
    ) -> Result<Vec<Envelope>, PipelineError> {
        let mut envelopes = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode(&entry.payload) {
                Ok(mut envelope) => {
                    envelope.set_stream_id(&entry.id);
                    envelopes.push(envelope);
                }
                Err(err) => {
                    // Ack immediately: a corrupt entry can never become
                    // processable, redelivering it would loop forever.
                    metrics::counter!(DECODE_FAILURES, "channel" => channel.to_string())
                        .increment(1);
                    warn!(channel, stream_id = %entry.id, error = %err, "dropping undecodable entry");
                    self.client.xack(channel, &self.group, &entry.id).await?;
                }
            }
        }
        if !envelopes.is_empty() {
            metrics::counter!(MESSAGES_CONSUMED, "channel" => channel.to_string())
                .increment(envelopes.len() as u64);
        }
        Ok(envelopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{encode, payload};
    use crate::envelope::Payload;
    use common_redis::MockRedisClient;
    use serde_json::json;

    fn consumer(client: &MockRedisClient) -> Consumer {
        Consumer::new(Arc::new(client.clone()), "workers", "worker-1")
    }

    async fn seed(client: &MockRedisClient, channel: &str, data: &[(&str, serde_json::Value)]) {
        let raw = encode(channel, payload(data), Payload::new()).unwrap();
        client.xadd(channel, raw, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let client = MockRedisClient::new();
        let consumer = consumer(&client);
        consumer.ensure_group("tutors", "0").await.unwrap();
        consumer.ensure_group("tutors", "0").await.unwrap();
    }

    #[tokio::test]
    async fn acked_messages_never_reappear_and_double_ack_is_a_noop() {
        let client = MockRedisClient::new();
        let consumer = consumer(&client);
        consumer.ensure_group("tutors", "0").await.unwrap();
        seed(&client, "tutors", &[("tutor_id", json!("T1"))]).await;

        let batch = consumer.consume("tutors", 10, None).await.unwrap();
        assert_eq!(batch.len(), 1);
        let stream_id = batch[0].stream_id().unwrap().to_string();

        assert!(consumer.acknowledge("tutors", &stream_id).await.unwrap());
        assert!(!consumer.acknowledge("tutors", &stream_id).await.unwrap());
        assert!(consumer.consume("tutors", 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_entries_are_acked_and_skipped() {
        let client = MockRedisClient::new();
        let consumer = consumer(&client);
        consumer.ensure_group("tutors", "0").await.unwrap();

        let raw = encode("tutors", payload(&[("rating", json!(5))]), Payload::new()).unwrap();
        let tampered = raw.replace("\"rating\":5", "\"rating\":1");
        client.xadd("tutors", tampered, None, None).await.unwrap();

        assert!(consumer.consume("tutors", 10, None).await.unwrap().is_empty());
        // Acked at decode time, so nothing stays pending.
        assert!(consumer.pending_entries("tutors", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_bound_terminates_in_dead_letter() {
        let client = MockRedisClient::new();
        let consumer = consumer(&client);
        consumer.ensure_group("sessions", "0").await.unwrap();
        consumer.ensure_group("sessions:retry", "0").await.unwrap();
        seed(&client, "sessions", &[("session_id", json!("S1"))]).await;

        let max_retries = 2;
        let mut envelope = consumer.consume("sessions", 10, None).await.unwrap().remove(0);
        consumer
            .acknowledge("sessions", &envelope.stream_id().unwrap().to_string())
            .await
            .unwrap();

        // Two retries stay on the retry channel.
        for expected_count in 1..=max_retries {
            assert!(consumer.retry("sessions", &envelope, max_retries).await.unwrap());
            envelope = consumer
                .consume("sessions:retry", 10, None)
                .await
                .unwrap()
                .remove(0);
            assert_eq!(envelope.retry_count(), expected_count);
            consumer
                .acknowledge("sessions:retry", &envelope.stream_id().unwrap().to_string())
                .await
                .unwrap();
        }

        // The third attempt is terminal.
        assert!(!consumer.retry("sessions", &envelope, max_retries).await.unwrap());
        assert!(consumer
            .consume("sessions:retry", 10, None)
            .await
            .unwrap()
            .is_empty());

        let dead = client.stream_payloads(DEAD_LETTER_CHANNEL);
        assert_eq!(dead.len(), 1);
        let dead = decode(&dead[0]).unwrap();
        assert_eq!(dead.retry_count(), max_retries + 1);
        assert_eq!(dead.metadata.get("reason"), Some(&json!("max retries exceeded")));
        assert_eq!(dead.metadata.get("original_channel"), Some(&json!("sessions")));
    }

    #[tokio::test]
    async fn idle_deliveries_can_be_claimed_by_another_consumer() {
        let client = MockRedisClient::new();
        let crashed = Consumer::new(Arc::new(client.clone()), "workers", "crashed");
        crashed.ensure_group("feedback", "0").await.unwrap();
        seed(&client, "feedback", &[("feedback_id", json!("F1"))]).await;
        let original = crashed.consume("feedback", 10, None).await.unwrap();
        assert_eq!(original.len(), 1);

        let rescuer = Consumer::new(Arc::new(client.clone()), "workers", "rescuer");
        assert!(rescuer
            .claim_idle("feedback", Duration::from_secs(60), 10)
            .await
            .unwrap()
            .is_empty());

        client.age_pending("feedback", "workers", Duration::from_secs(120));
        let claimed = rescuer
            .claim_idle("feedback", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].data, original[0].data);

        let pending = rescuer.pending_entries("feedback", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "rescuer");
        assert_eq!(pending[0].delivery_count, 2);
    }
}
