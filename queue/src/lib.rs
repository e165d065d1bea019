//! Work Queue Manager (spec.md §4.3): per-processor ready queues backed by
//! Store streams with consumer groups.
//!
//! Naming, creation, enqueue (single/batched), consume, ack, and stats all
//! live here so the router and the processor-facing consume path agree on
//! one wire format — `FrameEvent::to_fields` plus `enqueued_at`, resolving
//! Open Question #2 in spec.md §9 in favor of this crate's format.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use frame_metrics::Metrics;
use frame_store::{PipelineValue, Store, StoreError, StreamMessage};
use frame_types::{FrameEvent, ProcessorDescriptor, QueueStats, DEFAULT_QUEUE_MAXLEN};

use frame_logger::warn_target;

const LOG_TARGET: &str = "frame_queue";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a frame never made it onto a processor's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The append itself failed (store error); the caller already has the
    /// underlying [`QueueError`], this variant exists for the metrics label.
    Error,
}

impl DropReason {
    fn as_label(self) -> &'static str {
        match self {
            DropReason::Error => "error",
        }
    }
}

/// `min(descriptor.metadata.queue_maxlen, system max)` per spec.md §3
/// "Work queue"; falls back to the system default entirely when the
/// descriptor sets none.
fn maxlen_for(descriptor: &ProcessorDescriptor, system_default: u64) -> u64 {
    match descriptor.queue_maxlen() {
        Some(override_len) => override_len.min(system_default),
        None => system_default,
    }
}

/// Projects a frame to the queue wire format: [`FrameEvent::to_fields`] plus
/// `enqueued_at` (spec.md §6 "per-processor queues").
fn fields_with_enqueued_at(frame: &FrameEvent) -> BTreeMap<String, String> {
    let mut fields = frame.to_fields();
    fields.insert("enqueued_at".to_string(), Utc::now().to_rfc3339());
    fields
}

/// Naming, bounded-length enqueue, consumer-group consume/ack, and stats for
/// per-processor ready queues.
pub struct QueueManager {
    store: Arc<dyn Store>,
    metrics: Arc<dyn Metrics>,
    /// System-wide cap (spec.md §4.3 "else system default, e.g. 10 000"),
    /// used when a descriptor sets no `queue_maxlen` of its own.
    system_default_maxlen: u64,
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<dyn Metrics>) -> Self {
        QueueManager {
            store,
            metrics,
            system_default_maxlen: DEFAULT_QUEUE_MAXLEN,
        }
    }

    pub fn with_system_default_maxlen(mut self, maxlen: u64) -> Self {
        self.system_default_maxlen = maxlen;
        self
    }

    /// Ensures a consumer group exists on `descriptor`'s queue. Idempotent:
    /// "group already exists" is success (spec.md §4.1).
    pub async fn ensure_group(
        &self,
        descriptor: &ProcessorDescriptor,
        group: &str,
    ) -> Result<(), QueueError> {
        self.store
            .create_group(&descriptor.queue, group, "0", true)
            .await?;
        Ok(())
    }

    /// Appends `frame` to `descriptor`'s queue, trimmed to approximately
    /// `min(descriptor.metadata.queue_maxlen, system default)` entries
    /// (spec.md §3 "Work queue"). Updates the queue-depth gauge once after
    /// the append succeeds.
    pub async fn enqueue(
        &self,
        descriptor: &ProcessorDescriptor,
        frame: &FrameEvent,
    ) -> Result<String, QueueError> {
        let maxlen = maxlen_for(descriptor, self.system_default_maxlen);
        let fields = fields_with_enqueued_at(frame);
        match self.store.append(&descriptor.queue, fields, Some(maxlen)).await {
            Ok(id) => {
                self.metrics
                    .frames_enqueued_total(&descriptor.id, &frame.camera_id);
                if let Ok(depth) = self.store.xlen(&descriptor.queue).await {
                    self.metrics.queue_depth_set(&descriptor.id, depth as i64);
                }
                Ok(id)
            }
            Err(err) => {
                warn_target!(
                    LOG_TARGET,
                    "enqueue to {} failed: {}",
                    descriptor.id,
                    err
                );
                self.metrics
                    .frames_dropped_total(&descriptor.id, DropReason::Error.as_label());
                Err(err.into())
            }
        }
    }

    /// Pipelined append of every frame in `frames`, one entry of the result
    /// per input frame: `Some(id)` on success, `None` on a per-frame
    /// failure. A single queue-depth gauge update after the whole batch
    /// (spec.md §4.3 "Single depth gauge update after the batch").
    pub async fn enqueue_batch(
        &self,
        descriptor: &ProcessorDescriptor,
        frames: &[FrameEvent],
    ) -> Result<Vec<Option<String>>, QueueError> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }
        let maxlen = maxlen_for(descriptor, self.system_default_maxlen);
        let mut pipeline = self.store.pipeline();
        for frame in frames {
            pipeline.append(&descriptor.queue, fields_with_enqueued_at(frame), Some(maxlen));
        }
        let results = pipeline.execute().await?;

        let mut out = Vec::with_capacity(frames.len());
        for (frame, value) in frames.iter().zip(results.into_iter()) {
            match value {
                PipelineValue::StreamId(Some(id)) => {
                    self.metrics
                        .frames_enqueued_total(&descriptor.id, &frame.camera_id);
                    out.push(Some(id));
                }
                _ => {
                    self.metrics
                        .frames_dropped_total(&descriptor.id, DropReason::Error.as_label());
                    out.push(None);
                }
            }
        }
        if let Ok(depth) = self.store.xlen(&descriptor.queue).await {
            self.metrics.queue_depth_set(&descriptor.id, depth as i64);
        }
        Ok(out)
    }

    /// Reads up to `count` new (`">"`) entries for `consumer` in `group`,
    /// blocking up to `block_ms`, optionally acking immediately.
    /// `block_ms` must be representable as `u64`; the caller is expected to
    /// have already validated non-negativity (spec.md §4.3).
    pub async fn consume(
        &self,
        descriptor: &ProcessorDescriptor,
        group: &str,
        consumer: &str,
        count: u64,
        block_ms: Option<u64>,
        auto_ack: bool,
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let messages = self
            .store
            .read_group(&descriptor.queue, group, consumer, count, block_ms)
            .await?;
        if auto_ack && !messages.is_empty() {
            let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
            self.ack(descriptor, group, &ids).await?;
        }
        Ok(messages)
    }

    /// Best-effort ack: logs and continues on a failure rather than
    /// propagating it (spec.md §4.3 "ack... best-effort").
    pub async fn ack(
        &self,
        descriptor: &ProcessorDescriptor,
        group: &str,
        ids: &[String],
    ) -> Result<(), QueueError> {
        if let Err(err) = self.store.ack(&descriptor.queue, group, ids).await {
            warn_target!(
                LOG_TARGET,
                "ack on {} ({} ids) failed: {}",
                descriptor.id,
                ids.len(),
                err
            );
        }
        Ok(())
    }

    /// Length, pending count across all groups, existence, consumer count,
    /// first/last id (spec.md §4.3 `stats`).
    pub async fn stats(&self, descriptor: &ProcessorDescriptor) -> Result<QueueStats, QueueError> {
        let info = self.store.xinfo(&descriptor.queue).await?;
        let pending: u64 = info.groups.iter().map(|g| g.pending).sum();
        let consumers: u64 = info.groups.iter().map(|g| g.consumers).sum();
        Ok(QueueStats {
            queue_name: descriptor.queue.clone(),
            processor_id: descriptor.id.clone(),
            length: info.length,
            pending,
            exists: info.length > 0 || !info.groups.is_empty(),
            consumers,
            first_id: info.first_id,
            last_id: info.last_id,
        })
    }

    /// Current depth of `descriptor`'s queue, used by the router's
    /// load-aware selection (spec.md §4.6).
    pub async fn depth(&self, descriptor: &ProcessorDescriptor) -> Result<u64, QueueError> {
        Ok(self.store.xlen(&descriptor.queue).await?)
    }
}
