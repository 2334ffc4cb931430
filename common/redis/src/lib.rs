use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod client;
mod mock;

pub use client::RedisClient;
pub use mock::MockRedisClient;

// Re-export ErrorKind so consumers can construct CustomRedisError in tests.
pub use redis::ErrorKind as RedisErrorKind;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl CustomRedisError {
    /// Create a Redis error from an ErrorKind (primarily for testing)
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        CustomRedisError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }
}

/// A single stream entry as stored in Redis: the stream-assigned id plus the
/// envelope payload (we publish a single `envelope` field per entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

/// One row of XPENDING detail for a consumer group.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// XINFO STREAM summary, trimmed to what monitoring needs.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub length: u64,
    pub groups: u64,
    pub first_entry_id: Option<String>,
    pub last_entry_id: Option<String>,
}

/// Async client over the Redis Streams operations the pipeline uses.
///
/// Implemented by `RedisClient` (a real connection) and `MockRedisClient`
/// (an in-memory stream engine for tests). Consumer-group offsets are only
/// ever mutated through `xack` / `xautoclaim`, never read-modify-written.
#[async_trait]
pub trait Client: Send + Sync {
    /// Append one entry, trimming the stream to roughly `maxlen` entries
    /// and refreshing the key TTL when given.
    async fn xadd(
        &self,
        stream: &str,
        payload: String,
        maxlen: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<String, CustomRedisError>;

    /// Append several entries atomically (one pipeline); partial failure
    /// fails the whole batch.
    async fn xadd_batch(
        &self,
        stream: &str,
        payloads: Vec<String>,
        maxlen: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<Vec<String>, CustomRedisError>;

    /// Create a consumer group (MKSTREAM). Returns false when the group
    /// already existed; that is not an error.
    async fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<bool, CustomRedisError>;

    /// Read up to `count` undelivered entries for this group/consumer,
    /// blocking up to `block` for new data.
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, CustomRedisError>;

    /// Acknowledge one entry for the group. Returns the number of entries
    /// actually removed from the pending list (0 or 1).
    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<u64, CustomRedisError>;

    /// List up to `count` pending (delivered, unacknowledged) entries.
    async fn xpending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, CustomRedisError>;

    /// Claim entries idle for at least `min_idle`, reassigning them to
    /// `consumer` and bumping their delivery count.
    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, CustomRedisError>;

    async fn xlen(&self, stream: &str) -> Result<u64, CustomRedisError>;

    async fn xinfo_stream(&self, stream: &str) -> Result<StreamSummary, CustomRedisError>;
}
