//! Production [`Store`] backed by Redis (hashes, sets, streams with
//! consumer groups), via the `redis` crate's async connection manager.

use std::collections::BTreeMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, RedisResult};

use frame_logger::warn_target;

use crate::error::StoreError;
use crate::retry::{retry, BackoffPolicy};
use crate::{GroupInfo, Pipeline, PipelineValue, PendingEntry, Store, StreamInfo, StreamMessage};

const LOG_TARGET: &str = "frame_store::redis";

fn classify(err: RedisError) -> StoreError {
    if err.is_connection_dropped() || err.is_timeout() || err.is_connection_refusal() {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

pub struct RedisStore {
    conn: ConnectionManager,
    backoff: BackoffPolicy,
}

impl RedisStore {
    /// Connects to `url`, eagerly establishing the connection manager so
    /// startup fails fast on a misconfigured address.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(classify)?;
        let conn = client.get_connection_manager().await.map_err(classify)?;
        Ok(RedisStore {
            conn,
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            conn.hset::<_, _, _, ()>(key, field, value).await.map_err(classify)
        })
        .await
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            conn.hset_nx(key, field, value).await.map_err(classify)
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            conn.hget(key, field).await.map_err(classify)
        })
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            let removed: u64 = conn.hdel(key, field).await.map_err(classify)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            conn.hgetall(key).await.map_err(classify)
        })
        .await
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            conn.hexists(key, field).await.map_err(classify)
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            conn.sadd::<_, _, ()>(key, member).await.map_err(classify)
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            conn.srem::<_, _, ()>(key, member).await.map_err(classify)
        })
        .await
    }

    async fn smembers(&self, key: &str) -> Result<std::collections::BTreeSet<String>, StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            conn.smembers(key).await.map_err(classify)
        })
        .await
    }

    async fn append(
        &self,
        stream: &str,
        fields: BTreeMap<String, String>,
        maxlen: Option<u64>,
    ) -> Result<String, StoreError> {
        retry(&self.backoff, || {
            let fields = fields.clone();
            async move {
                let mut conn = self.conn();
                let kv: Vec<(&str, &str)> =
                    fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                let id: String = match maxlen {
                    Some(maxlen) => {
                        conn.xadd_maxlen(
                            stream,
                            redis::streams::StreamMaxlen::Approx(maxlen as usize),
                            "*",
                            &kv,
                        )
                        .await
                    }
                    None => conn.xadd(stream, "*", &kv).await,
                }
                .map_err(classify)?;
                Ok(id)
            }
        })
        .await
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> Result<bool, StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            let result: RedisResult<()> = if mkstream {
                redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(stream)
                    .arg(group)
                    .arg(start_id)
                    .arg("MKSTREAM")
                    .query_async(&mut conn)
                    .await
            } else {
                conn.xgroup_create(stream, group, start_id).await
            };
            match result {
                Ok(()) => Ok(true),
                Err(err) if err.to_string().contains("BUSYGROUP") => Ok(false),
                Err(err) => Err(classify(err)),
            }
        })
        .await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: u64,
        block_ms: Option<u64>,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let mut conn = self.conn();
        let mut opts = StreamReadOptions::default().group(group, consumer).count(count as usize);
        if let Some(block_ms) = block_ms {
            opts = opts.block(block_ms as usize);
        }
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(classify)?;
        let mut out = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = BTreeMap::new();
                for (field, value) in id.map {
                    if let redis::Value::BulkString(bytes) = value {
                        fields.insert(field, String::from_utf8_lossy(&bytes).into_owned());
                    }
                }
                out.push(StreamMessage { id: id.id, fields });
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            conn.xack(stream, group, ids).await.map_err(classify)
        })
        .await
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        count: u64,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let mut conn = self.conn();
        let reply: redis::streams::StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count as usize)
            .await
            .map_err(classify)?;
        Ok(reply
            .ids
            .into_iter()
            .map(|entry| PendingEntry {
                id: entry.id,
                consumer: entry.consumer,
                idle_ms: entry.time_since_delivered as u64,
                delivery_count: entry.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let reply: StreamReadReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, ids)
            .await
            .map_err(classify)?;
        let mut out = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = BTreeMap::new();
                for (field, value) in id.map {
                    if let redis::Value::BulkString(bytes) = value {
                        fields.insert(field, String::from_utf8_lossy(&bytes).into_owned());
                    }
                }
                out.push(StreamMessage { id: id.id, fields });
            }
        }
        Ok(out)
    }

    async fn xlen(&self, stream: &str) -> Result<u64, StoreError> {
        retry(&self.backoff, || async {
            let mut conn = self.conn();
            let len: u64 = conn.xlen(stream).await.map_err(classify)?;
            Ok(len)
        })
        .await
    }

    async fn xinfo(&self, stream: &str) -> Result<StreamInfo, StoreError> {
        let mut conn = self.conn();
        let len: u64 = conn.xlen(stream).await.map_err(classify)?;
        let groups: Vec<redis::streams::StreamGroupInfo> = match conn.xinfo_groups(stream).await {
            Ok(groups) => groups,
            Err(err) => {
                warn_target!(LOG_TARGET, "xinfo_groups failed for {}: {}", stream, err);
                Vec::new()
            }
        };
        Ok(StreamInfo {
            length: len,
            first_id: None,
            last_id: None,
            groups: groups
                .into_iter()
                .map(|g| GroupInfo {
                    name: g.name,
                    pending: g.pending as u64,
                    consumers: g.consumers as u64,
                })
                .collect(),
        })
    }

    fn pipeline(&self) -> Box<dyn Pipeline> {
        Box::new(RedisPipeline {
            conn: self.conn(),
            pipe: redis::pipe(),
            kinds: Vec::new(),
        })
    }
}

enum OpKind {
    Unit,
    StreamId,
}

struct RedisPipeline {
    conn: ConnectionManager,
    pipe: redis::Pipeline,
    kinds: Vec<OpKind>,
}

#[async_trait]
impl Pipeline for RedisPipeline {
    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.pipe.hset(key, field, value).ignore();
        self.kinds.push(OpKind::Unit);
    }

    fn hdel(&mut self, key: &str, field: &str) {
        self.pipe.hdel(key, field).ignore();
        self.kinds.push(OpKind::Unit);
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.pipe.sadd(key, member).ignore();
        self.kinds.push(OpKind::Unit);
    }

    fn srem(&mut self, key: &str, member: &str) {
        self.pipe.srem(key, member).ignore();
        self.kinds.push(OpKind::Unit);
    }

    fn append(&mut self, stream: &str, fields: BTreeMap<String, String>, maxlen: Option<u64>) {
        let kv: Vec<(String, String)> = fields.into_iter().collect();
        match maxlen {
            Some(maxlen) => {
                self.pipe.xadd_maxlen(
                    stream,
                    redis::streams::StreamMaxlen::Approx(maxlen as usize),
                    "*",
                    &kv,
                );
            }
            None => {
                self.pipe.xadd(stream, "*", &kv);
            }
        }
        self.kinds.push(OpKind::StreamId);
    }

    async fn execute(mut self: Box<Self>) -> Result<Vec<PipelineValue>, StoreError> {
        let results: Vec<redis::Value> = self
            .pipe
            .query_async(&mut self.conn)
            .await
            .map_err(classify)?;
        let mut out = Vec::with_capacity(self.kinds.len());
        let mut results = results.into_iter();
        for kind in &self.kinds {
            match kind {
                OpKind::Unit => {
                    out.push(PipelineValue::Unit);
                }
                OpKind::StreamId => {
                    let id = results.next().and_then(|v| match v {
                        redis::Value::BulkString(bytes) => {
                            Some(String::from_utf8_lossy(&bytes).into_owned())
                        }
                        _ => None,
                    });
                    out.push(PipelineValue::StreamId(id));
                }
            }
        }
        Ok(out)
    }
}
