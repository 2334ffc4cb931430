use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamInfoStreamReply, StreamMaxlen,
    StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::time::Duration;

use crate::{Client, CustomRedisError, PendingEntry, StreamEntry, StreamSummary};

/// Field name under which the serialized envelope is stored in every
/// stream entry.
pub const ENVELOPE_FIELD: &str = "envelope";

pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    /// Connect with no response/connection timeouts (blocks indefinitely).
    pub async fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        Self::with_config(addr, None, None).await
    }

    /// Connect with optional response and connection timeouts. Passing
    /// `Some(Duration::ZERO)` is a configuration error - use `None` for no
    /// timeout instead.
    pub async fn with_config(
        addr: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisClient, CustomRedisError> {
        for (name, timeout) in [
            ("response", response_timeout),
            ("connection", connection_timeout),
        ] {
            if let Some(timeout) = timeout {
                if timeout.is_zero() {
                    return Err(CustomRedisError::InvalidConfiguration(format!(
                        "Redis {name} timeout cannot be Duration::ZERO - use None for no timeout"
                    )));
                }
            }
        }

        let client = redis::Client::open(addr)?;

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }
        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisClient { connection })
    }

    fn entry_from_stream_id(id: &StreamId) -> Option<StreamEntry> {
        let payload: String = id.get(ENVELOPE_FIELD)?;
        Some(StreamEntry {
            id: id.id.clone(),
            payload,
        })
    }

    fn entries_from_ids(ids: &[StreamId]) -> Vec<StreamEntry> {
        // Entries missing the envelope field were not written by us; skip
        // them rather than fail the whole read.
        ids.iter().filter_map(Self::entry_from_stream_id).collect()
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn xadd(
        &self,
        stream: &str,
        payload: String,
        maxlen: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();
        let fields = [(ENVELOPE_FIELD, payload)];
        let id: String = match maxlen {
            Some(n) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(n as usize), "*", &fields)
                    .await?
            }
            None => conn.xadd(stream, "*", &fields).await?,
        };
        if let Some(ttl) = ttl {
            let _: bool = conn.expire(stream, ttl.as_secs() as i64).await?;
        }
        Ok(id)
    }

    async fn xadd_batch(
        &self,
        stream: &str,
        payloads: Vec<String>,
        maxlen: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for payload in &payloads {
            match maxlen {
                Some(n) => {
                    pipe.cmd("XADD")
                        .arg(stream)
                        .arg("MAXLEN")
                        .arg("~")
                        .arg(n)
                        .arg("*")
                        .arg(ENVELOPE_FIELD)
                        .arg(payload);
                }
                None => {
                    pipe.cmd("XADD")
                        .arg(stream)
                        .arg("*")
                        .arg(ENVELOPE_FIELD)
                        .arg(payload);
                }
            }
        }
        if let Some(ttl) = ttl {
            pipe.cmd("EXPIRE")
                .arg(stream)
                .arg(ttl.as_secs())
                .ignore();
        }
        let ids: Vec<String> = pipe.query_async(&mut conn).await?;
        Ok(ids)
    }

    async fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, start_id).await;
        match created {
            Ok(_) => Ok(true),
            // BUSYGROUP means the group already exists, which is fine.
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }
        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &options).await?;
        let entries = reply
            .keys
            .iter()
            .flat_map(|key| Self::entries_from_ids(&key.ids))
            .collect();
        Ok(entries)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection.clone();
        let acked: u64 = conn.xack(stream, group, &[id]).await?;
        Ok(acked)
    }

    async fn xpending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let reply: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;
        let entries = reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            })
            .collect();
        Ok(entries)
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let options = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream,
                group,
                consumer,
                min_idle.as_millis() as usize,
                "0-0",
                options,
            )
            .await?;
        Ok(Self::entries_from_ids(&reply.claimed))
    }

    async fn xlen(&self, stream: &str) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection.clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn xinfo_stream(&self, stream: &str) -> Result<StreamSummary, CustomRedisError> {
        let mut conn = self.connection.clone();
        let reply: StreamInfoStreamReply = conn.xinfo_stream(stream).await?;
        let entry_id = |entry: &StreamId| {
            if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.clone())
            }
        };
        Ok(StreamSummary {
            length: reply.length as u64,
            groups: reply.groups as u64,
            first_entry_id: entry_id(&reply.first_entry),
            last_entry_id: entry_id(&reply.last_entry),
        })
    }
}
