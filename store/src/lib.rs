//! Store Client (C2): a thin capability contract over the external
//! key/stream substrate (spec.md §4.1). Any backend providing hash, set,
//! and stream operations with the stated semantics is acceptable; this
//! crate ships [`RedisStore`] (production) and [`InMemoryStore`] (the
//! in-process stand-in every other crate's unit tests use, so component
//! tests never require a live Redis).

mod error;
mod memory;
mod redis_store;
pub mod retry;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use retry::BackoffPolicy;

/// One entry read from a stream via a consumer group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

/// One row of `XPENDING` output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct GroupInfo {
    pub name: String,
    pub pending: u64,
    pub consumers: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StreamInfo {
    pub length: u64,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
    pub groups: Vec<GroupInfo>,
}

/// A value produced by one queued operation inside a [`Pipeline`], in
/// submission order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineValue {
    Unit,
    StreamId(Option<String>),
}

/// Builder for a batch of writes applied atomically from the client's
/// perspective (spec.md §4.1 "Batched writes"). Not necessarily
/// serializable across the substrate; callers that need read-modify-write
/// atomicity must not rely on it for that.
#[async_trait]
pub trait Pipeline: Send {
    fn hset(&mut self, key: &str, field: &str, value: &str);
    fn hdel(&mut self, key: &str, field: &str);
    fn sadd(&mut self, key: &str, member: &str);
    fn srem(&mut self, key: &str, member: &str);
    fn append(&mut self, stream: &str, fields: BTreeMap<String, String>, maxlen: Option<u64>);

    /// Executes every queued operation as one round trip, returning a
    /// [`PipelineValue`] per operation in submission order.
    async fn execute(self: Box<Self>) -> Result<Vec<PipelineValue>, StoreError>;
}

/// The capability set the core consumes (spec.md §4.1).
#[async_trait]
pub trait Store: Send + Sync {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    /// Sets `field` to `value` only if it does not already exist, in one
    /// round trip (`HSETNX`). Returns `true` if the write happened. The
    /// Store's own conditional-write primitive, so at most one concurrent
    /// caller racing on the same `(key, field)` sees `true` (spec.md §4.2:
    /// "the Store's conditional write decides the winner").
    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError>;
    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Appends to `stream`, trimming to approximately `maxlen` entries when
    /// set. Returns the new entry's id.
    async fn append(
        &self,
        stream: &str,
        fields: BTreeMap<String, String>,
        maxlen: Option<u64>,
    ) -> Result<String, StoreError>;

    /// Creates `group` on `stream` starting at `start_id`, creating the
    /// stream itself when `mkstream` is set. Returns `Ok(false)` rather
    /// than an error when the group already exists.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> Result<bool, StoreError>;

    /// Reads up to `count` new (`">"`) entries for `consumer` in `group`,
    /// blocking up to `block_ms` (`None` blocks indefinitely).
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: u64,
        block_ms: Option<u64>,
    ) -> Result<Vec<StreamMessage>, StoreError>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError>;

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        count: u64,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    /// Reassigns pending entries idle at least `min_idle_ms` to `consumer`.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StoreError>;

    async fn xlen(&self, stream: &str) -> Result<u64, StoreError>;

    async fn xinfo(&self, stream: &str) -> Result<StreamInfo, StoreError>;

    /// A fresh pipeline builder bound to this store.
    fn pipeline(&self) -> Box<dyn Pipeline>;
}
