//! Backpressure Controller (spec.md §4.9): aggregates queue utilization
//! across every registered processor into a discretized [`PressureLevel`]
//! and an intake multiplier, publishing both so the Stream Consumer can
//! throttle or pause the next read. Optionally adapts its own `high`/
//! `critical` thresholds from sustained recent pressure, and optionally
//! computes a per-queue throttle factor weighted by priority.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use frame_config::BackpressureConfig;
use frame_metrics::Metrics;
use frame_queue::QueueManager;
use frame_registry::ProcessorRegistry;
use frame_systemtime::unix_time_as_millis;
use frame_types::PressureLevel;
use parking_lot::Mutex;
use tokio::sync::watch;

use frame_logger::{error_target, info_target, warn_target};

const LOG_TARGET: &str = "frame_backpressure";
/// spec.md §4.8: "a configured sustained fraction (≥ 50 samples...)".
const ADAPTIVE_WINDOW: usize = 50;
/// spec.md §4.8: "≥ 60 s between adjustments".
const MIN_ADJUSTMENT_INTERVAL_MS: u64 = 60_000;
/// spec.md §4.8: "lower/raise... by a small step (≥ 5%)".
const ADJUSTMENT_STEP: f64 = 0.05;

#[derive(Clone, Debug, PartialEq)]
pub struct BackpressureParams {
    pub low: f64,
    pub high: f64,
    pub critical: f64,
    pub adaptive: bool,
    pub per_queue_throttling: bool,
}

impl From<&BackpressureConfig> for BackpressureParams {
    fn from(cfg: &BackpressureConfig) -> Self {
        BackpressureParams {
            low: cfg.low,
            high: cfg.high,
            critical: cfg.critical,
            adaptive: cfg.adaptive,
            per_queue_throttling: cfg.per_queue_throttling,
        }
    }
}

impl Default for BackpressureParams {
    fn default() -> Self {
        BackpressureParams::from(&BackpressureConfig::default())
    }
}

fn level_for(utilization: f64, params: &BackpressureParams) -> PressureLevel {
    if utilization >= params.critical {
        PressureLevel::Critical
    } else if utilization >= params.high {
        PressureLevel::High
    } else if utilization >= params.low {
        PressureLevel::Moderate
    } else {
        PressureLevel::Normal
    }
}

/// Aggregates queue utilization and publishes `(level, multiplier)` over a
/// `watch` channel the Stream Consumer subscribes to (spec.md §4.8).
pub struct BackpressureController {
    registry: Arc<ProcessorRegistry>,
    queue: Arc<QueueManager>,
    metrics: Arc<dyn Metrics>,
    params: Mutex<BackpressureParams>,
    tx: watch::Sender<(PressureLevel, f64)>,
    sample_window: Mutex<VecDeque<PressureLevel>>,
    last_adjustment_ms: AtomicU64,
}

impl BackpressureController {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        queue: Arc<QueueManager>,
        metrics: Arc<dyn Metrics>,
        params: BackpressureParams,
    ) -> Self {
        let (tx, _rx) = watch::channel((PressureLevel::Normal, PressureLevel::Normal.multiplier()));
        BackpressureController {
            registry,
            queue,
            metrics,
            params: Mutex::new(params),
            tx,
            sample_window: Mutex::new(VecDeque::with_capacity(ADAPTIVE_WINDOW)),
            last_adjustment_ms: AtomicU64::new(0),
        }
    }

    /// A receiver the Stream Consumer polls once per iteration to decide
    /// whether, and at what rate, to request more work.
    pub fn subscribe(&self) -> watch::Receiver<(PressureLevel, f64)> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> (PressureLevel, f64) {
        *self.tx.borrow()
    }

    pub fn params(&self) -> BackpressureParams {
        self.params.lock().clone()
    }

    async fn max_utilization(&self) -> f64 {
        let descriptors = match self.registry.list_all().await {
            Ok(descriptors) => descriptors,
            Err(_) => return 0.0,
        };
        let mut max_u: f64 = 0.0;
        for descriptor in &descriptors {
            if let Ok(depth) = self.queue.depth(descriptor).await {
                let utilization = depth as f64 / (descriptor.capacity.max(1) as f64);
                max_u = max_u.max(utilization);
            }
        }
        max_u
    }

    /// One control cycle (spec.md §4.8): reads current utilization across
    /// every registered queue, computes the level, publishes it, and (if
    /// adaptive thresholds are enabled) evaluates whether to step them.
    pub async fn tick(&self) -> PressureLevel {
        let utilization = self.max_utilization().await;
        let params = self.params();
        let level = level_for(utilization, &params);

        let previous_level = self.tx.borrow().0;
        if level != previous_level {
            match level {
                PressureLevel::High => warn_target!(
                    LOG_TARGET,
                    "backpressure escalated to high (utilization {:.2})",
                    utilization
                ),
                PressureLevel::Critical => error_target!(
                    LOG_TARGET,
                    "ALERT: backpressure critical (utilization {:.2}); pausing intake",
                    utilization
                ),
                _ => info_target!(LOG_TARGET, "backpressure returned to {:?}", level),
            }
        }

        let _ = self.tx.send((level, level.multiplier()));
        self.metrics.backpressure_level_set(level.as_metric_value());
        self.record_sample(level);
        if params.adaptive {
            self.maybe_adjust();
        }
        level
    }

    fn record_sample(&self, level: PressureLevel) {
        let mut window = self.sample_window.lock();
        window.push_back(level);
        while window.len() > ADAPTIVE_WINDOW {
            window.pop_front();
        }
    }

    /// Adaptive threshold adjustment (spec.md §4.8, optional): when the
    /// recent window is dominated by `>= high` pressure, step `high` and
    /// `critical` down so the controller reacts earlier next time;
    /// symmetrically step them up after a window dominated by `normal`.
    fn maybe_adjust(&self) {
        let window = self.sample_window.lock();
        if window.len() < ADAPTIVE_WINDOW {
            return;
        }
        let now = unix_time_as_millis();
        let last = self.last_adjustment_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) < MIN_ADJUSTMENT_INTERVAL_MS {
            return;
        }

        let high_or_above = window.iter().filter(|l| **l >= PressureLevel::High).count();
        let normal = window.iter().filter(|l| **l == PressureLevel::Normal).count();
        let dominant_high = high_or_above * 2 >= window.len();
        let dominant_normal = normal * 2 >= window.len();
        drop(window);

        if !dominant_high && !dominant_normal {
            return;
        }

        let mut params = self.params.lock();
        if dominant_high {
            params.high = (params.high * (1.0 - ADJUSTMENT_STEP)).max(params.low + 0.01);
            params.critical = (params.critical * (1.0 - ADJUSTMENT_STEP)).max(params.high + 0.01);
            info_target!(
                LOG_TARGET,
                "adaptive thresholds lowered: high={:.3} critical={:.3}",
                params.high,
                params.critical
            );
        } else {
            params.high = (params.high * (1.0 + ADJUSTMENT_STEP)).min(1.0);
            params.critical = (params.critical * (1.0 + ADJUSTMENT_STEP)).min(1.0);
            info_target!(
                LOG_TARGET,
                "adaptive thresholds raised: high={:.3} critical={:.3}",
                params.high,
                params.critical
            );
        }
        drop(params);
        self.last_adjustment_ms.store(now, Ordering::Release);
        self.sample_window.lock().clear();
    }

    /// Per-queue throttle factor (spec.md §4.8, optional): queues above
    /// `high` utilization are throttled proportionally to `utilization`,
    /// divided by `priority_weight` so higher-priority queues are
    /// throttled less at the same utilization. Returns `None` when
    /// per-queue throttling is disabled or `utilization` is below `high`.
    pub fn per_queue_throttle(&self, utilization: f64, priority_weight: f64) -> Option<f64> {
        let params = self.params();
        if !params.per_queue_throttling || utilization < params.high {
            return None;
        }
        Some(utilization / priority_weight.max(0.01))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_store::InMemoryStore;
    use frame_systemtime::faketime;
    use frame_types::{FrameEvent, ProcessorDescriptor};
    use serde_json::Value;
    use std::collections::BTreeMap;

    fn frame(id: &str) -> FrameEvent {
        let mut metadata = BTreeMap::new();
        metadata.insert("detection_type".to_string(), Value::String("face".to_string()));
        FrameEvent {
            frame_id: id.to_string(),
            camera_id: "cam1".to_string(),
            timestamp: chrono::Utc::now(),
            size_bytes: 1024,
            width: 1920,
            height: 1080,
            format: "jpeg".to_string(),
            metadata,
            trace_context: "{}".to_string(),
            retry_count: 0,
        }
    }

    async fn controller_with_depth(depth: u64, capacity: u32) -> BackpressureController {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ProcessorRegistry::new(store.clone()));
        let queue = Arc::new(QueueManager::new(store.clone(), frame_metrics::noop()));
        let descriptor = ProcessorDescriptor::new("p1", vec!["face".to_string()], capacity);
        registry.register(descriptor.clone()).await.unwrap();
        for i in 0..depth {
            queue.enqueue(&descriptor, &frame(&format!("f{i}"))).await.unwrap();
        }
        BackpressureController::new(registry, queue, frame_metrics::noop(), BackpressureParams::default())
    }

    #[tokio::test]
    async fn low_utilization_is_normal_with_full_multiplier() {
        let controller = controller_with_depth(1, 100).await;
        let level = controller.tick().await;
        assert_eq!(level, PressureLevel::Normal);
        assert_eq!(controller.current().1, 1.0);
    }

    #[tokio::test]
    async fn moderate_utilization_yields_three_quarter_multiplier() {
        let controller = controller_with_depth(65, 100).await;
        let level = controller.tick().await;
        assert_eq!(level, PressureLevel::Moderate);
        assert_eq!(controller.current().1, 0.75);
    }

    #[tokio::test]
    async fn high_utilization_yields_half_multiplier() {
        let controller = controller_with_depth(85, 100).await;
        let level = controller.tick().await;
        assert_eq!(level, PressureLevel::High);
        assert_eq!(controller.current().1, 0.5);
    }

    #[tokio::test]
    async fn critical_utilization_pauses_intake() {
        let controller = controller_with_depth(96, 100).await;
        let level = controller.tick().await;
        assert_eq!(level, PressureLevel::Critical);
        assert_eq!(controller.current().1, 0.0);
    }

    #[tokio::test]
    async fn subscribers_observe_level_changes() {
        let controller = controller_with_depth(1, 100).await;
        let mut rx = controller.subscribe();
        assert_eq!(rx.borrow().0, PressureLevel::Normal);

        // Push the same queue past critical and re-tick.
        for i in 0..99 {
            controller
                .queue
                .enqueue(
                    &ProcessorDescriptor::new("p1", vec!["face".to_string()], 100),
                    &frame(&format!("extra{i}")),
                )
                .await
                .unwrap();
        }
        controller.tick().await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().0, PressureLevel::Critical);
    }

    #[tokio::test]
    async fn per_queue_throttle_scales_inversely_with_priority_weight() {
        let mut params = BackpressureParams::default();
        params.per_queue_throttling = true;
        let controller = BackpressureController::new(
            Arc::new(ProcessorRegistry::new(Arc::new(InMemoryStore::new()))),
            Arc::new(QueueManager::new(Arc::new(InMemoryStore::new()), frame_metrics::noop())),
            frame_metrics::noop(),
            params,
        );
        assert_eq!(controller.per_queue_throttle(0.5, 1.0), None);
        assert_eq!(controller.per_queue_throttle(0.9, 1.0), Some(0.9));
        assert_eq!(controller.per_queue_throttle(0.9, 2.0), Some(0.45));
    }

    #[tokio::test]
    async fn adaptive_thresholds_lower_after_sustained_high_pressure() {
        let _faketime = faketime();
        _faketime.set_faketime(0);
        let mut params = BackpressureParams::default();
        params.adaptive = true;
        let controller = BackpressureController::new(
            Arc::new(ProcessorRegistry::new(Arc::new(InMemoryStore::new()))),
            Arc::new(QueueManager::new(Arc::new(InMemoryStore::new()), frame_metrics::noop())),
            frame_metrics::noop(),
            params.clone(),
        );
        for _ in 0..ADAPTIVE_WINDOW {
            controller.record_sample(PressureLevel::Critical);
        }
        _faketime.set_faketime(MIN_ADJUSTMENT_INTERVAL_MS + 1);
        controller.maybe_adjust();

        let adjusted = controller.params();
        assert!(adjusted.high < params.high);
        assert!(adjusted.critical < params.critical);
    }

    #[tokio::test]
    async fn adaptive_thresholds_do_not_move_before_the_interval_elapses() {
        let _faketime = faketime();
        _faketime.set_faketime(0);
        let mut params = BackpressureParams::default();
        params.adaptive = true;
        let controller = BackpressureController::new(
            Arc::new(ProcessorRegistry::new(Arc::new(InMemoryStore::new()))),
            Arc::new(QueueManager::new(Arc::new(InMemoryStore::new()), frame_metrics::noop())),
            frame_metrics::noop(),
            params.clone(),
        );
        for _ in 0..ADAPTIVE_WINDOW {
            controller.record_sample(PressureLevel::Critical);
        }
        controller.maybe_adjust();
        let unchanged = controller.params();
        assert_eq!(unchanged.high, params.high);
    }
}
