//! Router / Distributor (spec.md §4.6): for each frame, capability filter
//! → breaker filter → load-aware selection → dispatch, mirroring
//! `distributor.py`'s `select_processor`/`dispatch_to_processor`/
//! `distribute_frame` shape.

use std::sync::Arc;

use frame_breaker::{BreakerSet, Outcome};
use frame_metrics::Metrics;
use frame_queue::QueueManager;
use frame_registry::ProcessorRegistry;
use frame_store::Store;
use frame_types::{FrameEvent, ProcessorDescriptor};
use rand::seq::SliceRandom;

use frame_logger::warn_target;

const LOG_TARGET: &str = "frame_router";
/// Candidates at or above this load percentage are treated as overloaded
/// (spec.md §4.6 "overloaded processors (>90% capacity)").
const OVERLOAD_THRESHOLD_PCT: u32 = 90;
/// Width of the near-minimum selection band (spec.md §4.6 "within 10% load
/// of the least loaded").
const LOAD_BAND_PCT: u32 = 10;

/// Why a frame was not delivered to any processor queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Enqueued to `processor_id` under message id `message_id`.
    Dispatched { processor_id: String, message_id: String },
    /// The frame carried no `detection_type` (spec.md §4.6 step 1).
    MissingCapability,
    /// No registered processor advertises the capability, or every
    /// candidate's breaker is open.
    NoCapableProcessor,
    /// A candidate was chosen but the enqueue itself failed; the breaker
    /// was charged a failure and the caller must not ack the source
    /// message so it is redelivered.
    DispatchFailed { processor_id: String },
    /// `retry_count` exceeded the configured redelivery cap; the frame was
    /// moved to the dead-letter stream instead of dispatched.
    DeadLettered { reason: String },
}

/// Pluggable candidate-selection policy (spec.md §4.6 "strategy
/// pluggability"). `LoadAware` is the spec-mandated default; the others are
/// cheap enum variants rather than a trait object, since all share the same
/// candidate list and dispatch contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    LoadAware,
    RoundRobin,
    CameraAffinity,
    SpecialistPreference,
    PriorityMatching,
}

impl RoutingStrategy {
    fn as_label(self) -> &'static str {
        match self {
            RoutingStrategy::LoadAware => "load_aware",
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::CameraAffinity => "camera_affinity",
            RoutingStrategy::SpecialistPreference => "specialist_preference",
            RoutingStrategy::PriorityMatching => "priority_matching",
        }
    }
}

struct Candidate {
    descriptor: ProcessorDescriptor,
    load_pct: u32,
}

/// Selects at most one processor for a frame and dispatches it, per
/// spec.md §4.6.
pub struct Router {
    registry: Arc<ProcessorRegistry>,
    breakers: Arc<BreakerSet>,
    queue: Arc<QueueManager>,
    store: Arc<dyn Store>,
    metrics: Arc<dyn Metrics>,
    strategy: RoutingStrategy,
    max_redelivery_attempts: u32,
    dead_letter_stream: String,
    round_robin_cursor: std::sync::atomic::AtomicUsize,
}

impl Router {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        breakers: Arc<BreakerSet>,
        queue: Arc<QueueManager>,
        store: Arc<dyn Store>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Router {
            registry,
            breakers,
            queue,
            store,
            metrics,
            strategy: RoutingStrategy::LoadAware,
            max_redelivery_attempts: 5,
            dead_letter_stream: "frames:dead-letter".to_string(),
            round_robin_cursor: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_redelivery_cap(mut self, max_attempts: u32, dead_letter_stream: impl Into<String>) -> Self {
        self.max_redelivery_attempts = max_attempts;
        self.dead_letter_stream = dead_letter_stream.into();
        self
    }

    /// Selects a processor, dispatches `frame` to it, and records the
    /// outcome against the breaker. Never returns an `Err`: every failure
    /// mode the distributor can hit is a [`RouteOutcome`] variant so the
    /// caller can decide ack/no-ack without matching on an error type
    /// (mirrors the source's `distribute_frame` returning a bool rather
    /// than propagating exceptions).
    pub async fn route(&self, frame: &FrameEvent) -> RouteOutcome {
        if frame.retry_count > self.max_redelivery_attempts {
            self.dead_letter(frame, "redelivery_cap_exceeded").await;
            return RouteOutcome::DeadLettered {
                reason: "redelivery_cap_exceeded".to_string(),
            };
        }

        let Some(detection_type) = frame.detection_type() else {
            warn_target!(LOG_TARGET, "frame {} missing detection_type metadata", frame.frame_id);
            return RouteOutcome::MissingCapability;
        };

        let descriptors = match self.registry.find_descriptors_by_capability(detection_type).await {
            Ok(descriptors) => descriptors,
            Err(err) => {
                warn_target!(LOG_TARGET, "capability lookup for {} failed: {}", detection_type, err);
                Vec::new()
            }
        };
        if descriptors.is_empty() {
            return RouteOutcome::NoCapableProcessor;
        }

        let mut available = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if self.breakers.available(&descriptor.id).await {
                available.push(descriptor);
            }
        }
        if available.is_empty() {
            return RouteOutcome::NoCapableProcessor;
        }

        let chosen = match self.select(available).await {
            Some(descriptor) => descriptor,
            None => return RouteOutcome::NoCapableProcessor,
        };

        self.metrics.routing_decisions_total(self.strategy.as_label(), &chosen.id);
        match self.queue.enqueue(&chosen, frame).await {
            Ok(message_id) => {
                self.breakers.record_outcome(&chosen.id, Outcome::Success).await;
                RouteOutcome::Dispatched {
                    processor_id: chosen.id,
                    message_id,
                }
            }
            Err(err) => {
                warn_target!(LOG_TARGET, "dispatch to {} failed: {}", chosen.id, err);
                self.breakers
                    .record_outcome(&chosen.id, Outcome::Failure { kind: "enqueue_error".to_string() })
                    .await;
                RouteOutcome::DispatchFailed {
                    processor_id: chosen.id,
                }
            }
        }
    }

    async fn dead_letter(&self, frame: &FrameEvent, reason: &str) {
        let mut fields = frame.to_fields();
        fields.insert("dead_letter_reason".to_string(), reason.to_string());
        if let Err(err) = self.store.append(&self.dead_letter_stream, fields, None).await {
            warn_target!(LOG_TARGET, "failed to dead-letter frame {}: {}", frame.frame_id, err);
        }
    }

    /// Dispatches on the configured [`RoutingStrategy`] over the
    /// breaker-filtered candidate set. Falls back to uniform random over
    /// `candidates` whenever a depth read fails, per spec.md §4.6.
    async fn select(&self, candidates: Vec<ProcessorDescriptor>) -> Option<ProcessorDescriptor> {
        match self.strategy {
            RoutingStrategy::RoundRobin => {
                let idx = self
                    .round_robin_cursor
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    % candidates.len();
                candidates.into_iter().nth(idx)
            }
            RoutingStrategy::CameraAffinity | RoutingStrategy::SpecialistPreference | RoutingStrategy::PriorityMatching => {
                // These policies share the load-aware fallback until a richer
                // affinity signal (camera history, specialist tags, frame
                // priority) is threaded through; the load-aware pass already
                // satisfies "the contract with the rest of the pipeline is
                // unchanged".
                self.select_load_aware(candidates).await
            }
            RoutingStrategy::LoadAware => self.select_load_aware(candidates).await,
        }
    }

    async fn select_load_aware(&self, candidates: Vec<ProcessorDescriptor>) -> Option<ProcessorDescriptor> {
        let mut loaded = Vec::with_capacity(candidates.len());
        let mut depth_read_failed = false;
        for descriptor in candidates {
            match self.queue.depth(&descriptor).await {
                Ok(depth) => {
                    let capacity = descriptor.capacity.max(1) as u64;
                    let load_pct = ((depth * 100) / capacity).min(100) as u32;
                    loaded.push(Candidate { descriptor, load_pct });
                }
                Err(_) => {
                    depth_read_failed = true;
                    loaded.push(Candidate { descriptor, load_pct: 0 });
                }
            }
        }

        if depth_read_failed {
            let descriptors: Vec<ProcessorDescriptor> = loaded.into_iter().map(|c| c.descriptor).collect();
            return descriptors.choose(&mut rand::thread_rng()).cloned();
        }

        let under: Vec<Candidate> = loaded
            .iter()
            .filter(|c| c.load_pct < OVERLOAD_THRESHOLD_PCT)
            .map(|c| Candidate {
                descriptor: c.descriptor.clone(),
                load_pct: c.load_pct,
            })
            .collect();

        if under.is_empty() {
            // Every candidate is at or above the overload threshold: pick
            // the single least-loaded one (spec.md §4.6 step 4, "otherwise
            // pick the single least-loaded"). Ties keep the first in
            // iteration order, which is deterministic given registry state.
            return loaded
                .into_iter()
                .min_by_key(|c| c.load_pct)
                .map(|c| c.descriptor);
        }
        let min_load = under.iter().map(|c| c.load_pct).min().expect("under is non-empty");
        let pool: Vec<ProcessorDescriptor> = under
            .into_iter()
            .filter(|c| c.load_pct <= min_load + LOAD_BAND_PCT)
            .map(|c| c.descriptor)
            .collect();
        pool.choose(&mut rand::thread_rng()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_spawn::{BoxFuture, Spawn};
    use frame_store::InMemoryStore;
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::BTreeMap;

    struct TokioSpawner;
    impl Spawn for TokioSpawner {
        fn spawn(&self, future: BoxFuture) {
            tokio::spawn(future);
        }
    }

    fn frame(id: &str, detection_type: Option<&str>) -> FrameEvent {
        let mut metadata = BTreeMap::new();
        if let Some(dt) = detection_type {
            metadata.insert("detection_type".to_string(), Value::String(dt.to_string()));
        }
        FrameEvent {
            frame_id: id.to_string(),
            camera_id: "cam1".to_string(),
            timestamp: Utc::now(),
            size_bytes: 1024,
            width: 1920,
            height: 1080,
            format: "jpeg".to_string(),
            metadata,
            trace_context: "{}".to_string(),
            retry_count: 0,
        }
    }

    async fn fresh_router() -> (Router, Arc<ProcessorRegistry>, Arc<InMemoryStore>) {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ProcessorRegistry::new(store.clone()));
        let breakers = Arc::new(BreakerSet::new(
            Arc::new(TokioSpawner),
            frame_breaker::BreakerParams::default(),
            frame_metrics::noop(),
        ));
        let queue = Arc::new(frame_queue::QueueManager::new(store.clone(), frame_metrics::noop()));
        let router = Router::new(registry.clone(), breakers, queue, store.clone(), frame_metrics::noop());
        (router, registry, store)
    }

    #[tokio::test]
    async fn missing_detection_type_is_reported_and_not_dispatched() {
        let (router, _registry, _store) = fresh_router().await;
        let outcome = router.route(&frame("f1", None)).await;
        assert_eq!(outcome, RouteOutcome::MissingCapability);
    }

    #[tokio::test]
    async fn no_capable_processor_when_registry_is_empty() {
        let (router, _registry, _store) = fresh_router().await;
        let outcome = router.route(&frame("f1", Some("face"))).await;
        assert_eq!(outcome, RouteOutcome::NoCapableProcessor);
    }

    #[tokio::test]
    async fn dispatches_to_the_registered_capable_processor() {
        let (router, registry, _store) = fresh_router().await;
        let descriptor = ProcessorDescriptor::new("p1", vec!["face".to_string()], 10);
        registry.register(descriptor).await.unwrap();

        let outcome = router.route(&frame("f1", Some("face"))).await;
        match outcome {
            RouteOutcome::Dispatched { processor_id, .. } => assert_eq!(processor_id, "p1"),
            other => panic!("expected Dispatched, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn picks_the_least_loaded_when_all_candidates_are_overloaded() {
        let (router, registry, store) = fresh_router().await;
        let busy = ProcessorDescriptor::new("busy", vec!["face".to_string()], 10);
        let busier = ProcessorDescriptor::new("busier", vec!["face".to_string()], 10);
        registry.register(busy.clone()).await.unwrap();
        registry.register(busier.clone()).await.unwrap();

        for i in 0..10 {
            store
                .append(&busy.queue, BTreeMap::from([("frame_id".to_string(), format!("b{i}"))]), None)
                .await
                .unwrap();
        }
        for i in 0..10 {
            store
                .append(&busier.queue, BTreeMap::from([("frame_id".to_string(), format!("c{i}"))]), None)
                .await
                .unwrap();
        }
        // busier gets one more entry so it's strictly more loaded than busy.
        store
            .append(&busier.queue, BTreeMap::from([("frame_id".to_string(), "extra".to_string())]), None)
            .await
            .unwrap();

        let outcome = router.route(&frame("f1", Some("face"))).await;
        match outcome {
            RouteOutcome::Dispatched { processor_id, .. } => assert_eq!(processor_id, "busy"),
            other => panic!("expected Dispatched to the least-loaded processor, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dead_letters_frames_past_the_redelivery_cap() {
        let (router, registry, store) = fresh_router().await;
        let router = router.with_redelivery_cap(2, "frames:dead-letter");
        registry
            .register(ProcessorDescriptor::new("p1", vec!["face".to_string()], 10))
            .await
            .unwrap();

        let mut stale = frame("f1", Some("face"));
        stale.retry_count = 5;
        let outcome = router.route(&stale).await;
        assert_eq!(
            outcome,
            RouteOutcome::DeadLettered {
                reason: "redelivery_cap_exceeded".to_string()
            }
        );
        assert_eq!(store.xlen("frames:dead-letter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dispatch_failure_charges_the_breaker_without_crashing() {
        // A processor whose queue name collides with nothing writable still
        // succeeds against the in-memory store (it has no failure injection
        // hook), so this exercises the success path end to end as a smoke
        // test for the breaker wiring.
        let (router, registry, _store) = fresh_router().await;
        let descriptor = ProcessorDescriptor::new("p1", vec!["face".to_string()], 10);
        registry.register(descriptor.clone()).await.unwrap();
        router.route(&frame("f1", Some("face"))).await;
        let metrics = router
            .breakers
            .metrics("p1")
            .await
            .expect("breaker created on first use");
        assert_eq!(metrics.successful_calls, 1);
    }
}
