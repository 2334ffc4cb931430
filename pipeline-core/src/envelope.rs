use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::PipelineError;

/// Opaque string-keyed payload. `serde_json::Map` keeps keys sorted, which
/// gives the canonical serialization the checksum is computed over.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// The wrapped, checksummed unit of data flowing through every stream.
///
/// Immutable once published; `checksum` is the hex SHA-256 of the canonical
/// serialization of `data`, computed at encode time and verified at decode
/// time. A mismatch means the message is corrupt and must never reach a
/// handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub data: Payload,
    pub metadata: Payload,
    pub checksum: String,
}

impl Envelope {
    /// The delivery id assigned by the stream, carried out-of-band from the
    /// serialized form so acknowledge/retry can reference it.
    pub fn stream_id(&self) -> Option<&str> {
        self.metadata.get("stream_id").and_then(|v| v.as_str())
    }

    pub(crate) fn set_stream_id(&mut self, stream_id: &str) {
        self.metadata
            .insert("stream_id".to_string(), stream_id.into());
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata
            .get("retry_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }
}

fn checksum_of(data: &Payload) -> String {
    // Map keys are ordered, so this serialization is stable for equal data.
    let canonical = serde_json::to_string(data).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{digest:x}")
}

/// Wrap `data` in a fresh envelope for `channel` and serialize it.
pub fn encode(channel: &str, data: Payload, metadata: Payload) -> Result<String, PipelineError> {
    let envelope = Envelope {
        id: Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        channel: channel.to_string(),
        checksum: checksum_of(&data),
        data,
        metadata,
    };
    encode_envelope(&envelope)
}

/// Serialize an existing envelope, refreshing its checksum. Used when
/// republishing to retry/dead-letter streams with amended metadata.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, PipelineError> {
    let mut envelope = envelope.clone();
    envelope.checksum = checksum_of(&envelope.data);
    // The stream id belongs to the old delivery, not the new entry.
    envelope.metadata.remove("stream_id");
    Ok(serde_json::to_string(&envelope)?)
}

/// Parse and verify a wire envelope. Fails with `CorruptMessage` when the
/// stored checksum does not match the recomputed hash of `data`.
pub fn decode(raw: &str) -> Result<Envelope, PipelineError> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    if checksum_of(&envelope.data) != envelope.checksum {
        return Err(PipelineError::CorruptMessage {
            id: envelope.id.clone(),
        });
    }
    Ok(envelope)
}

#[cfg(test)]
pub(crate) fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
