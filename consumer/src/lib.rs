//! Stream Consumer (spec.md §4.4): membership in the input stream's
//! consumer group, blocking reads with a soft timeout and capped backoff,
//! pending-entry reclaim, and ack forwarding.

use std::time::Duration;

use frame_store::{BackoffPolicy, PendingEntry, Store, StoreError, StreamMessage};
use tokio_util::sync::CancellationToken;

use frame_logger::{info_target, warn_target};

const LOG_TARGET: &str = "frame_consumer";

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A pending-entry reclaim paired with how many times the Store has now
/// delivered it (spec.md §4.4/§7: the bounded per-frame retry counter),
/// so the caller can stamp `retry_count` on the frame it reconstructs
/// instead of trusting the (immutable) stream entry's own fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedMessage {
    pub message: StreamMessage,
    /// Total number of deliveries of this entry, including the one just
    /// performed by the claim (first normal delivery = 1).
    pub delivery_count: u64,
}

/// A member of a consumer group on one input stream (spec.md §4.4).
pub struct StreamConsumer {
    store: std::sync::Arc<dyn Store>,
    stream: String,
    group: String,
    consumer_name: String,
    backoff: BackoffPolicy,
}

impl StreamConsumer {
    /// Ensures `group` exists on `stream` (`start_id = "0"`, `mkstream =
    /// true`; "already exists" is success per spec.md §4.1) and returns a
    /// consumer bound to it.
    pub async fn init(
        store: std::sync::Arc<dyn Store>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Result<Self, ConsumerError> {
        let stream = stream.into();
        let group = group.into();
        store.create_group(&stream, &group, "0", true).await?;
        Ok(StreamConsumer {
            store,
            stream,
            group,
            consumer_name: consumer_name.into(),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// One blocking read of up to `count` new (`">"`) entries, with a soft
    /// timeout of `block_ms/1000 + 5s` (spec.md §4.4): on timeout, the read
    /// is simply reissued; on a transient connectivity error, sleeps per
    /// the capped backoff policy and retries; a logic/protocol error is
    /// surfaced. Returns `Ok(vec![])` if `stop` fires first.
    pub async fn consume(
        &self,
        count: u64,
        block_ms: u64,
        stop: &CancellationToken,
    ) -> Result<Vec<StreamMessage>, ConsumerError> {
        let soft_timeout = Duration::from_millis(block_ms) + Duration::from_secs(5);
        let mut attempt = 0u32;
        loop {
            if stop.is_cancelled() {
                return Ok(Vec::new());
            }
            let read = self.store.read_group(
                &self.stream,
                &self.group,
                &self.consumer_name,
                count,
                Some(block_ms),
            );
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(Vec::new()),
                outcome = tokio::time::timeout(soft_timeout, read) => {
                    match outcome {
                        Err(_elapsed) => {
                            // Soft timeout: the blocking read simply took longer
                            // than expected. Reissue rather than treating it as
                            // an error.
                            continue;
                        }
                        Ok(Ok(messages)) if messages.is_empty() => continue,
                        Ok(Ok(messages)) => return Ok(messages),
                        Ok(Err(err)) if err.is_transient() => {
                            warn_target!(
                                LOG_TARGET,
                                "transient error reading {}: {} (retry {})",
                                self.stream,
                                err,
                                attempt
                            );
                            tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                            attempt = attempt.saturating_add(1);
                        }
                        Ok(Err(err)) => return Err(err.into()),
                    }
                }
            }
        }
    }

    /// Scans group-pending messages and reassigns to this consumer those
    /// idle at least `min_idle_ms`, recovering work from crashed consumers
    /// (spec.md §4.4). Used at startup and on a periodic timer.
    ///
    /// Each reclaimed entry is paired with its delivery count as tracked by
    /// the Store's own pending list (`XPENDING`'s delivery counter plus the
    /// one this claim performs), since the stream entry itself is immutable
    /// and never carries a redelivery counter (spec.md §7's bounded retry
    /// requirement is tracked by the Store, not by the frame payload).
    pub async fn claim_pending(
        &self,
        min_idle_ms: u64,
        count: u64,
    ) -> Result<Vec<ReclaimedMessage>, ConsumerError> {
        let pending = self.store.pending_range(&self.stream, &self.group, count).await?;
        let mut delivery_counts: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        let mut stale: Vec<String> = Vec::new();
        for entry in pending.into_iter().filter(|e: &PendingEntry| e.idle_ms >= min_idle_ms) {
            delivery_counts.insert(entry.id.clone(), entry.delivery_count + 1);
            stale.push(entry.id);
        }
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        let claimed = self
            .store
            .claim(&self.stream, &self.group, &self.consumer_name, min_idle_ms, &stale)
            .await?;
        if !claimed.is_empty() {
            info_target!(
                LOG_TARGET,
                "claimed {} stale pending entries on {} for {}",
                claimed.len(),
                self.stream,
                self.consumer_name
            );
        }
        Ok(claimed
            .into_iter()
            .map(|message| {
                let delivery_count = delivery_counts.get(&message.id).copied().unwrap_or(1);
                ReclaimedMessage { message, delivery_count }
            })
            .collect())
    }

    pub async fn ack(&self, id: &str) -> Result<(), ConsumerError> {
        self.store.ack(&self.stream, &self.group, &[id.to_string()]).await?;
        Ok(())
    }

    pub async fn ack_many(&self, ids: &[String]) -> Result<(), ConsumerError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.store.ack(&self.stream, &self.group, ids).await?;
        Ok(())
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    pub fn group_name(&self) -> &str {
        &self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_store::InMemoryStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn push_frame(store: &InMemoryStore, stream: &str, frame_id: &str) -> String {
        let mut fields = BTreeMap::new();
        fields.insert("frame_id".to_string(), frame_id.to_string());
        store.append(stream, fields, None).await.unwrap()
    }

    #[tokio::test]
    async fn consume_returns_newly_appended_messages() {
        let store = Arc::new(InMemoryStore::new());
        push_frame(&store, "frames:captured", "f1").await;
        let consumer = StreamConsumer::init(store, "frames:captured", "g1", "c1")
            .await
            .unwrap();
        let stop = CancellationToken::new();
        let messages = consumer.consume(10, 50, &stop).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].fields.get("frame_id").unwrap(), "f1");
    }

    #[tokio::test]
    async fn consume_returns_empty_when_stopped() {
        let store = Arc::new(InMemoryStore::new());
        let consumer = StreamConsumer::init(store, "frames:captured", "g1", "c1")
            .await
            .unwrap();
        let stop = CancellationToken::new();
        stop.cancel();
        let messages = consumer.consume(10, 50, &stop).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn claim_pending_reassigns_idle_entries() {
        let store = Arc::new(InMemoryStore::new());
        push_frame(&store, "frames:captured", "f1").await;
        let consumer_a = StreamConsumer::init(store.clone(), "frames:captured", "g1", "a")
            .await
            .unwrap();
        let stop = CancellationToken::new();
        consumer_a.consume(10, 50, &stop).await.unwrap();

        let consumer_b = StreamConsumer::init(store, "frames:captured", "g1", "b")
            .await
            .unwrap();
        let claimed = consumer_b.claim_pending(0, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_count, 2);
        consumer_b.ack(&claimed[0].message.id).await.unwrap();
    }

    #[tokio::test]
    async fn ack_many_is_a_noop_on_empty_input() {
        let store = Arc::new(InMemoryStore::new());
        let consumer = StreamConsumer::init(store, "frames:captured", "g1", "c1")
            .await
            .unwrap();
        consumer.ack_many(&[]).await.unwrap();
    }
}
