use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{Client, CustomRedisError, PendingEntry, StreamEntry, StreamSummary};

#[derive(Clone)]
struct MockEntry {
    seq: u64,
    id: String,
    payload: String,
}

struct MockPending {
    consumer: String,
    delivery_count: u64,
    last_delivery: Instant,
}

#[derive(Default)]
struct MockGroup {
    /// Highest entry seq this group has ever delivered.
    last_delivered_seq: u64,
    /// Pending entry list, keyed by entry id.
    pending: HashMap<String, MockPending>,
}

#[derive(Default)]
struct MockStream {
    entries: Vec<MockEntry>,
    groups: HashMap<String, MockGroup>,
}

#[derive(Default)]
struct MockState {
    streams: HashMap<String, MockStream>,
    next_seq: u64,
    unavailable: bool,
}

/// An in-memory Redis Streams double for tests.
///
/// Unlike a stub that returns canned values, this mock actually implements
/// consumer-group semantics (per-group cursors, pending entry lists,
/// delivery counts, idle-based reclaim), since those semantics are exactly
/// what the pipeline's consumer tests need to exercise.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Numeric ordering for "{seq}-0" ids; lexicographic comparison would
    /// put "10-0" before "9-0".
    fn id_seq(id: &str) -> u64 {
        id.split('-')
            .next()
            .and_then(|seq| seq.parse().ok())
            .unwrap_or(0)
    }

    fn check_available(state: &MockState) -> Result<(), CustomRedisError> {
        if state.unavailable {
            return Err(CustomRedisError::from_redis_kind(
                redis::ErrorKind::IoError,
                "mock redis unavailable",
            ));
        }
        Ok(())
    }

    fn append(state: &mut MockState, stream: &str, payload: String, maxlen: Option<u64>) -> String {
        state.next_seq += 1;
        let seq = state.next_seq;
        let id = format!("{seq}-0");
        let entries = &mut state.streams.entry(stream.to_string()).or_default().entries;
        entries.push(MockEntry {
            seq,
            id: id.clone(),
            payload,
        });
        if let Some(maxlen) = maxlen {
            let excess = entries.len().saturating_sub(maxlen as usize);
            if excess > 0 {
                entries.drain(..excess);
            }
        }
        id
    }

    /// Make every subsequent call fail as if the backend were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Shift every pending delivery in the group back in time, so tests can
    /// exercise idle-based claiming without sleeping.
    pub fn age_pending(&self, stream: &str, group: &str, by: Duration) {
        let mut state = self.lock();
        if let Some(group) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            for pending in group.pending.values_mut() {
                if let Some(shifted) = pending.last_delivery.checked_sub(by) {
                    pending.last_delivery = shifted;
                }
            }
        }
    }

    /// Raw payloads currently in a stream, oldest first.
    pub fn stream_payloads(&self, stream: &str) -> Vec<String> {
        self.lock()
            .streams
            .get(stream)
            .map(|s| s.entries.iter().map(|e| e.payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn xadd(
        &self,
        stream: &str,
        payload: String,
        maxlen: Option<u64>,
        _ttl: Option<Duration>,
    ) -> Result<String, CustomRedisError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        Ok(Self::append(&mut state, stream, payload, maxlen))
    }

    async fn xadd_batch(
        &self,
        stream: &str,
        payloads: Vec<String>,
        maxlen: Option<u64>,
        _ttl: Option<Duration>,
    ) -> Result<Vec<String>, CustomRedisError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        Ok(payloads
            .into_iter()
            .map(|payload| Self::append(&mut state, stream, payload, maxlen))
            .collect())
    }

    async fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<bool, CustomRedisError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if stream_state.groups.contains_key(group) {
            return Ok(false);
        }
        let last_delivered_seq = match start_id {
            "$" => stream_state.entries.last().map(|e| e.seq).unwrap_or(0),
            _ => 0,
        };
        stream_state.groups.insert(
            group.to_string(),
            MockGroup {
                last_delivered_seq,
                pending: HashMap::new(),
            },
        );
        Ok(true)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        _block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, CustomRedisError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = stream_state.groups.get_mut(group) else {
            return Err(CustomRedisError::from_redis_kind(
                redis::ErrorKind::ResponseError,
                "NOGROUP no such consumer group",
            ));
        };
        let now = Instant::now();
        let mut delivered = Vec::new();
        for entry in &stream_state.entries {
            if delivered.len() >= count {
                break;
            }
            if entry.seq <= group_state.last_delivered_seq {
                continue;
            }
            group_state.last_delivered_seq = entry.seq;
            group_state.pending.insert(
                entry.id.clone(),
                MockPending {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    last_delivery: now,
                },
            );
            delivered.push(StreamEntry {
                id: entry.id.clone(),
                payload: entry.payload.clone(),
            });
        }
        Ok(delivered)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<u64, CustomRedisError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(id).is_some())
            .unwrap_or(false);
        Ok(u64::from(removed))
    }

    async fn xpending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, CustomRedisError> {
        let state = self.lock();
        Self::check_available(&state)?;
        let Some(group_state) = state.streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut entries: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .map(|(id, p)| PendingEntry {
                id: id.clone(),
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.last_delivery),
                delivery_count: p.delivery_count,
            })
            .collect();
        entries.sort_by_key(|e| Self::id_seq(&e.id));
        entries.truncate(count);
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
        let mut state = self.lock();
        Self::check_available(&state)?;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let payloads: HashMap<String, String> = stream_state
            .entries
            .iter()
            .map(|e| (e.id.clone(), e.payload.clone()))
            .collect();
        let Some(group_state) = stream_state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut eligible: Vec<String> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_delivery) >= min_idle)
            .map(|(id, _)| id.clone())
            .collect();
        eligible.sort_by_key(|id| Self::id_seq(id));
        eligible.truncate(count);

        let mut claimed = Vec::new();
        for id in eligible {
            let Some(pending) = group_state.pending.get_mut(&id) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivery_count += 1;
            pending.last_delivery = now;
            // Entries trimmed out of the stream can no longer be served.
            if let Some(payload) = payloads.get(&id) {
                claimed.push(StreamEntry {
                    id,
                    payload: payload.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn xlen(&self, stream: &str) -> Result<u64, CustomRedisError> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn xinfo_stream(&self, stream: &str) -> Result<StreamSummary, CustomRedisError> {
        let state = self.lock();
        Self::check_available(&state)?;
        let Some(stream_state) = state.streams.get(stream) else {
            return Ok(StreamSummary::default());
        };
        Ok(StreamSummary {
            length: stream_state.entries.len() as u64,
            groups: stream_state.groups.len() as u64,
            first_entry_id: stream_state.entries.first().map(|e| e.id.clone()),
            last_entry_id: stream_state.entries.last().map(|e| e.id.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn group_cursor_and_pending_lifecycle() {
        let client = MockRedisClient::new();
        client.xgroup_create("s", "g", "0").await.unwrap();
        client.xadd("s", "a".into(), None, None).await.unwrap();
        client.xadd("s", "b".into(), None, None).await.unwrap();

        let read = client.xread_group("s", "g", "c1", 10, None).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(client.xpending("s", "g", 10).await.unwrap().len(), 2);

        assert_eq!(client.xack("s", "g", &read[0].id).await.unwrap(), 1);
        assert_eq!(client.xack("s", "g", &read[0].id).await.unwrap(), 0);
        assert_eq!(client.xpending("s", "g", 10).await.unwrap().len(), 1);

        // Already-delivered entries are not re-read by the same group.
        assert!(client
            .xread_group("s", "g", "c1", 10, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn new_only_group_skips_existing_entries() {
        let client = MockRedisClient::new();
        client.xadd("s", "old".into(), None, None).await.unwrap();
        client.xgroup_create("s", "g", "$").await.unwrap();
        client.xadd("s", "new".into(), None, None).await.unwrap();

        let read = client.xread_group("s", "g", "c1", 10, None).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].payload, "new");
    }

    #[tokio::test]
    async fn pending_order_is_numeric_past_nine_entries() {
        let client = MockRedisClient::new();
        client.xgroup_create("s", "g", "0").await.unwrap();
        for n in 1..=12 {
            client.xadd("s", format!("p{n}"), None, None).await.unwrap();
        }
        client.xread_group("s", "g", "c1", 20, None).await.unwrap();

        // "10-0" must not sort before "9-0".
        let pending = client.xpending("s", "g", 20).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids[8], "9-0");
        assert_eq!(ids[9], "10-0");

        client.age_pending("s", "g", Duration::from_secs(120));
        let claimed = client
            .xautoclaim("s", "g", "rescuer", Duration::from_secs(60), 20)
            .await
            .unwrap();
        assert_eq!(claimed[8].payload, "p9");
        assert_eq!(claimed[9].payload, "p10");
    }

    #[tokio::test]
    async fn autoclaim_reassigns_idle_deliveries() {
        let client = MockRedisClient::new();
        client.xgroup_create("s", "g", "0").await.unwrap();
        client.xadd("s", "a".into(), None, None).await.unwrap();
        client.xread_group("s", "g", "crashed", 10, None).await.unwrap();

        // Nothing is idle enough yet.
        let claimed = client
            .xautoclaim("s", "g", "rescuer", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());

        client.age_pending("s", "g", Duration::from_secs(120));
        let claimed = client
            .xautoclaim("s", "g", "rescuer", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let pending = client.xpending("s", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "rescuer");
        assert_eq!(pending[0].delivery_count, 2);
    }
}
