use std::sync::Arc;
use std::time::Duration;

use common_redis::{Client, StreamSummary};
use tracing::debug;

use crate::envelope::{encode, Payload};
use crate::metrics_consts::{BATCHES_PUBLISHED, MESSAGES_PUBLISHED};
use crate::PipelineError;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Approximate maximum stream length; older entries get trimmed.
    pub max_stream_length: u64,
    /// TTL refreshed on the stream key at every append.
    pub stream_ttl: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_stream_length: 100_000,
            stream_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Appends envelopes to streams, enforcing the length bound and TTL.
///
/// The client is injected at construction; there is no global connection.
/// A `BackendUnavailable` error means delivery failed - the caller still
/// owns its copy of the data.
pub struct Publisher {
    client: Arc<dyn Client>,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(client: Arc<dyn Client>, config: PublisherConfig) -> Self {
        Self { client, config }
    }

    /// Encode and append one envelope; returns the stream-assigned id.
    pub async fn publish(
        &self,
        channel: &str,
        data: Payload,
        metadata: Payload,
    ) -> Result<String, PipelineError> {
        let payload = encode(channel, data, metadata)?;
        let id = self
            .client
            .xadd(
                channel,
                payload,
                Some(self.config.max_stream_length),
                Some(self.config.stream_ttl),
            )
            .await?;
        metrics::counter!(MESSAGES_PUBLISHED, "channel" => channel.to_string()).increment(1);
        debug!(channel, stream_id = %id, "published message");
        Ok(id)
    }

    /// Append a batch of envelopes in one atomic pipeline. Partial failure
    /// fails the whole batch; no subset of ids is returned.
    pub async fn publish_batch(
        &self,
        channel: &str,
        items: Vec<Payload>,
        metadata: Payload,
    ) -> Result<Vec<String>, PipelineError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let payloads = items
            .into_iter()
            .map(|data| encode(channel, data, metadata.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let count = payloads.len();
        let ids = self
            .client
            .xadd_batch(
                channel,
                payloads,
                Some(self.config.max_stream_length),
                Some(self.config.stream_ttl),
            )
            .await?;
        metrics::counter!(MESSAGES_PUBLISHED, "channel" => channel.to_string())
            .increment(count as u64);
        metrics::counter!(BATCHES_PUBLISHED, "channel" => channel.to_string()).increment(1);
        Ok(ids)
    }

    pub async fn stream_length(&self, channel: &str) -> Result<u64, PipelineError> {
        Ok(self.client.xlen(channel).await?)
    }

    pub async fn stream_info(&self, channel: &str) -> Result<StreamSummary, PipelineError> {
        Ok(self.client.xinfo_stream(channel).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{decode, payload};
    use common_redis::MockRedisClient;
    use serde_json::json;

    fn publisher(client: &MockRedisClient) -> Publisher {
        Publisher::new(
            Arc::new(client.clone()),
            PublisherConfig {
                max_stream_length: 3,
                stream_ttl: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn publish_appends_a_decodable_envelope() {
        let client = MockRedisClient::new();
        let data = payload(&[("tutor_id", json!("T1"))]);
        publisher(&client)
            .publish("tutors", data.clone(), Payload::new())
            .await
            .unwrap();

        let payloads = client.stream_payloads("tutors");
        assert_eq!(payloads.len(), 1);
        assert_eq!(decode(&payloads[0]).unwrap().data, data);
    }

    #[tokio::test]
    async fn stream_length_is_bounded() {
        let client = MockRedisClient::new();
        let publisher = publisher(&client);
        for i in 0..5 {
            publisher
                .publish("tutors", payload(&[("i", json!(i))]), Payload::new())
                .await
                .unwrap();
        }
        assert_eq!(publisher.stream_length("tutors").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn batch_publish_is_all_or_nothing() {
        let client = MockRedisClient::new();
        let publisher = publisher(&client);
        let items = vec![payload(&[("i", json!(1))]), payload(&[("i", json!(2))])];
        let ids = publisher
            .publish_batch("sessions", items, Payload::new())
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        client.set_unavailable(true);
        let err = publisher
            .publish_batch("sessions", vec![payload(&[("i", json!(3))])], Payload::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BackendUnavailable(_)));
        client.set_unavailable(false);
        assert_eq!(publisher.stream_length("sessions").await.unwrap(), 2);
    }
}
