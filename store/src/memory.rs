//! In-process [`Store`] used by unit tests across every crate that
//! depends on `frame-store`, so those tests never require a live Redis.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::{GroupInfo, Pipeline, PipelineValue, PendingEntry, Store, StreamInfo, StreamMessage};

#[derive(Default)]
struct StreamEntry {
    id: String,
    fields: BTreeMap<String, String>,
}

#[derive(Default)]
struct ConsumerGroup {
    /// Index into the stream's entry log of the next unseen entry.
    cursor: usize,
    /// id -> (consumer, delivery_count), entries not yet acked.
    pending: BTreeMap<String, (String, u64)>,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<StreamEntry>,
    groups: BTreeMap<String, ConsumerGroup>,
}

#[derive(Default)]
struct Inner {
    hashes: BTreeMap<String, BTreeMap<String, String>>,
    sets: BTreeMap<String, BTreeSet<String>>,
    streams: BTreeMap<String, StreamState>,
}

/// A deterministic, non-blocking stand-in for Redis. `read_group` never
/// actually blocks: it returns whatever is immediately available, which
/// is sufficient for driving consumer-loop logic under test.
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
    seq: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            inner: Arc::new(Mutex::new(Inner::default())),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_id(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("{}-0", n)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        Ok(inner
            .hashes
            .get_mut(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .hashes
            .get(key)
            .map(|h| h.contains_key(field))
            .unwrap_or(false))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.sets.get(key).cloned().unwrap_or_default())
    }

    async fn append(
        &self,
        stream: &str,
        fields: BTreeMap<String, String>,
        maxlen: Option<u64>,
    ) -> Result<String, StoreError> {
        let id = self.next_id();
        let mut inner = self.inner.lock();
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.entries.push_back(StreamEntry {
            id: id.clone(),
            fields,
        });
        if let Some(maxlen) = maxlen {
            while state.entries.len() as u64 > maxlen {
                state.entries.pop_front();
            }
        }
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if !inner.streams.contains_key(stream) {
            if !mkstream {
                return Err(StoreError::NoSuchKey(stream.to_string()));
            }
            inner.streams.insert(stream.to_string(), StreamState::default());
        }
        let state = inner.streams.get_mut(stream).unwrap();
        if state.groups.contains_key(group) {
            return Ok(false);
        }
        let cursor = if start_id == "$" { state.entries.len() } else { 0 };
        state.groups.insert(
            group.to_string(),
            ConsumerGroup {
                cursor,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: u64,
        _block_ms: Option<u64>,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let mut inner = self.inner.lock();
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::NoSuchKey(stream.to_string()))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| StoreError::NoSuchKey(group.to_string()))?;
        let mut out = Vec::new();
        while (out.len() as u64) < count && group_state.cursor < state.entries.len() {
            let entry = &state.entries[group_state.cursor];
            group_state
                .pending
                .insert(entry.id.clone(), (consumer.to_string(), 1));
            out.push(StreamMessage {
                id: entry.id.clone(),
                fields: entry.fields.clone(),
            });
            group_state.cursor += 1;
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(0);
        };
        let mut acked = 0u64;
        for id in ids {
            if group_state.pending.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        count: u64,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let inner = self.inner.lock();
        let Some(state) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get(group) else {
            return Ok(Vec::new());
        };
        Ok(group_state
            .pending
            .iter()
            .take(count as usize)
            .map(|(id, (consumer, delivery_count))| PendingEntry {
                id: id.clone(),
                consumer: consumer.clone(),
                idle_ms: 0,
                delivery_count: *delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        _min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let entries_by_id: BTreeMap<String, BTreeMap<String, String>> = state
            .entries
            .iter()
            .map(|e| (e.id.clone(), e.fields.clone()))
            .collect();
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for id in ids {
            if let Some((owner, delivery_count)) = group_state.pending.get_mut(id) {
                *owner = consumer.to_string();
                *delivery_count += 1;
                if let Some(fields) = entries_by_id.get(id) {
                    out.push(StreamMessage {
                        id: id.clone(),
                        fields: fields.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn xlen(&self, stream: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn xinfo(&self, stream: &str) -> Result<StreamInfo, StoreError> {
        let inner = self.inner.lock();
        let Some(state) = inner.streams.get(stream) else {
            return Ok(StreamInfo::default());
        };
        Ok(StreamInfo {
            length: state.entries.len() as u64,
            first_id: state.entries.front().map(|e| e.id.clone()),
            last_id: state.entries.back().map(|e| e.id.clone()),
            groups: state
                .groups
                .iter()
                .map(|(name, g)| GroupInfo {
                    name: name.clone(),
                    pending: g.pending.len() as u64,
                    consumers: g
                        .pending
                        .values()
                        .map(|(c, _)| c.clone())
                        .collect::<BTreeSet<_>>()
                        .len() as u64,
                })
                .collect(),
        })
    }

    fn pipeline(&self) -> Box<dyn Pipeline> {
        Box::new(MemoryPipeline {
            inner: self.inner.clone(),
            seq: self.seq.clone(),
            ops: Vec::new(),
        })
    }
}

enum Op {
    HSet(String, String, String),
    HDel(String, String),
    SAdd(String, String),
    SRem(String, String),
    Append(String, BTreeMap<String, String>, Option<u64>),
}

struct MemoryPipeline {
    inner: Arc<Mutex<Inner>>,
    seq: Arc<AtomicU64>,
    ops: Vec<Op>,
}

#[async_trait]
impl Pipeline for MemoryPipeline {
    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.ops.push(Op::HSet(key.to_string(), field.to_string(), value.to_string()));
    }

    fn hdel(&mut self, key: &str, field: &str) {
        self.ops.push(Op::HDel(key.to_string(), field.to_string()));
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.ops.push(Op::SAdd(key.to_string(), member.to_string()));
    }

    fn srem(&mut self, key: &str, member: &str) {
        self.ops.push(Op::SRem(key.to_string(), member.to_string()));
    }

    fn append(&mut self, stream: &str, fields: BTreeMap<String, String>, maxlen: Option<u64>) {
        self.ops.push(Op::Append(stream.to_string(), fields, maxlen));
    }

    async fn execute(self: Box<Self>) -> Result<Vec<PipelineValue>, StoreError> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(self.ops.len());
        for op in self.ops {
            match op {
                Op::HSet(key, field, value) => {
                    inner.hashes.entry(key).or_default().insert(field, value);
                    out.push(PipelineValue::Unit);
                }
                Op::HDel(key, field) => {
                    if let Some(h) = inner.hashes.get_mut(&key) {
                        h.remove(&field);
                    }
                    out.push(PipelineValue::Unit);
                }
                Op::SAdd(key, member) => {
                    inner.sets.entry(key).or_default().insert(member);
                    out.push(PipelineValue::Unit);
                }
                Op::SRem(key, member) => {
                    if let Some(s) = inner.sets.get_mut(&key) {
                        s.remove(&member);
                    }
                    out.push(PipelineValue::Unit);
                }
                Op::Append(stream, fields, maxlen) => {
                    let n = self.seq.fetch_add(1, Ordering::SeqCst);
                    let id = format!("{}-0", n);
                    let state = inner.streams.entry(stream).or_default();
                    state.entries.push_back(StreamEntry {
                        id: id.clone(),
                        fields,
                    });
                    if let Some(maxlen) = maxlen {
                        while state.entries.len() as u64 > maxlen {
                            state.entries.pop_front();
                        }
                    }
                    out.push(PipelineValue::StreamId(Some(id)));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_roundtrip() {
        let store = InMemoryStore::new();
        store.hset("k", "f", "v").await.unwrap();
        assert_eq!(store.hget("k", "f").await.unwrap(), Some("v".to_string()));
        assert!(store.hexists("k", "f").await.unwrap());
        assert!(store.hdel("k", "f").await.unwrap());
        assert_eq!(store.hget("k", "f").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_roundtrip() {
        let store = InMemoryStore::new();
        store.sadd("s", "a").await.unwrap();
        store.sadd("s", "b").await.unwrap();
        let members = store.smembers("s").await.unwrap();
        assert_eq!(members.len(), 2);
        store.srem("s", "a").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_group_consume_and_ack() {
        let store = InMemoryStore::new();
        store
            .create_group("st", "g", "$", true)
            .await
            .unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("frame_id".to_string(), "f1".to_string());
        let id = store.append("st", fields, None).await.unwrap();

        let msgs = store.read_group("st", "g", "c1", 10, None).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id, id);

        let pending = store.pending_range("st", "g", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "c1");

        let acked = store.ack("st", "g", &[id.clone()]).await.unwrap();
        assert_eq!(acked, 1);
        assert!(store.pending_range("st", "g", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_group_reports_existing_without_error() {
        let store = InMemoryStore::new();
        assert!(store.create_group("st", "g", "$", true).await.unwrap());
        assert!(!store.create_group("st", "g", "$", true).await.unwrap());
    }

    #[tokio::test]
    async fn maxlen_trims_oldest() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            let mut fields = BTreeMap::new();
            fields.insert("n".to_string(), i.to_string());
            store.append("st", fields, Some(3)).await.unwrap();
        }
        assert_eq!(store.xlen("st").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn pipeline_applies_queued_ops_on_execute() {
        let store = InMemoryStore::new();
        let mut pipeline = store.pipeline();
        pipeline.hset("k", "f", "v");
        pipeline.sadd("s", "m");
        pipeline.append("st", BTreeMap::new(), None);
        let results = pipeline.execute().await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(store.hget("k", "f").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.smembers("s").await.unwrap().len(), 1);
        assert_eq!(store.xlen("st").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_reassigns_pending_entry() {
        let store = InMemoryStore::new();
        store.create_group("st", "g", "$", true).await.unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("frame_id".to_string(), "f1".to_string());
        let id = store.append("st", fields, None).await.unwrap();
        store.read_group("st", "g", "c1", 10, None).await.unwrap();

        let claimed = store.claim("st", "g", "c2", 0, &[id.clone()]).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let pending = store.pending_range("st", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].delivery_count, 2);
    }
}
