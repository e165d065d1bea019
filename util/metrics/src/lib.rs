//! Metrics facade for the frame orchestrator.
//!
//! Every component that wants to observe a counter, gauge, or histogram
//! depends on the [`Metrics`] trait rather than on `prometheus` directly, so
//! unit tests can wire [`NoopMetrics`] and production wires
//! [`PrometheusMetrics`]. The label shapes mirror the original Python
//! implementation's `prometheus_client` metrics (`frame_buffer_*`).

use std::sync::Arc;

use once_cell::sync::OnceCell;
use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry};

/// Facade every component depends on instead of a concrete metrics backend.
pub trait Metrics: Send + Sync {
    fn frames_enqueued_total(&self, processor_id: &str, camera_id: &str) {
        let _ = (processor_id, camera_id);
    }
    fn frames_dropped_total(&self, processor_id: &str, reason: &str) {
        let _ = (processor_id, reason);
    }
    fn queue_depth_set(&self, processor_id: &str, depth: i64) {
        let _ = (processor_id, depth);
    }
    fn routing_decisions_total(&self, strategy: &str, processor_id: &str) {
        let _ = (strategy, processor_id);
    }
    fn routing_latency_observe(&self, seconds: f64) {
        let _ = seconds;
    }
    fn circuit_open_total(&self, processor_id: &str) {
        let _ = processor_id;
    }
    fn backpressure_level_set(&self, level: i64) {
        let _ = level;
    }
    fn health_check_total(&self, processor_id: &str, status: &str) {
        let _ = (processor_id, status);
    }
    fn health_status_set(&self, processor_id: &str, status: i64) {
        let _ = (processor_id, status);
    }
    fn admission_queue_size_set(&self, size: i64) {
        let _ = size;
    }
    fn admission_oldest_age_seconds_set(&self, seconds: f64) {
        let _ = seconds;
    }
}

/// Default used by every component under test: every observation is dropped.
#[derive(Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// `prometheus`-backed implementation. Registers its metric families against
/// the supplied [`Registry`] at construction time; the registry itself is
/// exposed so the embedding binary can mount it under whatever scrape
/// endpoint it runs (out of scope for this crate, see `frame-metrics-service`).
pub struct PrometheusMetrics {
    frames_enqueued: CounterVec,
    frames_dropped: CounterVec,
    queue_depth: GaugeVec,
    routing_decisions: CounterVec,
    routing_latency: HistogramVec,
    circuit_open: CounterVec,
    backpressure_level: GaugeVec,
    health_checks: CounterVec,
    health_status: GaugeVec,
    admission_queue_size: prometheus::Gauge,
    admission_oldest_age: prometheus::Gauge,
}

impl PrometheusMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let frames_enqueued = CounterVec::new(
            Opts::new(
                "frame_buffer_frames_enqueued_total",
                "Total frames enqueued to processors",
            ),
            &["processor_id", "camera_id"],
        )?;
        let frames_dropped = CounterVec::new(
            Opts::new(
                "frame_buffer_frames_dropped_total",
                "Frames dropped due to queue overflow or enqueue error",
            ),
            &["processor_id", "reason"],
        )?;
        let queue_depth = GaugeVec::new(
            Opts::new(
                "frame_buffer_queue_depth",
                "Current depth of processor queues",
            ),
            &["processor_id"],
        )?;
        let routing_decisions = CounterVec::new(
            Opts::new(
                "frame_buffer_routing_decisions_total",
                "Total routing decisions made",
            ),
            &["strategy", "processor_id"],
        )?;
        let routing_latency = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "frame_buffer_routing_latency_seconds",
                "Time to make a routing decision",
            ),
            &[],
        )?;
        let circuit_open = CounterVec::new(
            Opts::new(
                "frame_buffer_circuit_open_total",
                "Number of times a processor's circuit breaker tripped open",
            ),
            &["processor_id"],
        )?;
        let backpressure_level = GaugeVec::new(
            Opts::new(
                "frame_buffer_backpressure_level",
                "Current backpressure level (0=normal, 1=moderate, 2=high, 3=critical)",
            ),
            &[],
        )?;
        let health_checks = CounterVec::new(
            Opts::new(
                "frame_buffer_health_checks_total",
                "Total health probe outcomes",
            ),
            &["processor_id", "status"],
        )?;
        let health_status = GaugeVec::new(
            Opts::new(
                "frame_buffer_health_status",
                "Last observed health status per processor (0=healthy, 1=degraded, 2=unhealthy)",
            ),
            &["processor_id"],
        )?;
        let admission_queue_size = prometheus::Gauge::with_opts(Opts::new(
            "frame_buffer_admission_queue_size",
            "Entries currently waiting in the priority admission queue",
        ))?;
        let admission_oldest_age = prometheus::Gauge::with_opts(Opts::new(
            "frame_buffer_admission_oldest_age_seconds",
            "Age of the oldest entry in the priority admission queue",
        ))?;

        registry.register(Box::new(frames_enqueued.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(routing_decisions.clone()))?;
        registry.register(Box::new(routing_latency.clone()))?;
        registry.register(Box::new(circuit_open.clone()))?;
        registry.register(Box::new(backpressure_level.clone()))?;
        registry.register(Box::new(health_checks.clone()))?;
        registry.register(Box::new(health_status.clone()))?;
        registry.register(Box::new(admission_queue_size.clone()))?;
        registry.register(Box::new(admission_oldest_age.clone()))?;

        Ok(Self {
            frames_enqueued,
            frames_dropped,
            queue_depth,
            routing_decisions,
            routing_latency,
            circuit_open,
            backpressure_level,
            health_checks,
            health_status,
            admission_queue_size,
            admission_oldest_age,
        })
    }
}

impl Metrics for PrometheusMetrics {
    fn frames_enqueued_total(&self, processor_id: &str, camera_id: &str) {
        self.frames_enqueued
            .with_label_values(&[processor_id, camera_id])
            .inc();
    }

    fn frames_dropped_total(&self, processor_id: &str, reason: &str) {
        self.frames_dropped
            .with_label_values(&[processor_id, reason])
            .inc();
    }

    fn queue_depth_set(&self, processor_id: &str, depth: i64) {
        self.queue_depth
            .with_label_values(&[processor_id])
            .set(depth as f64);
    }

    fn routing_decisions_total(&self, strategy: &str, processor_id: &str) {
        self.routing_decisions
            .with_label_values(&[strategy, processor_id])
            .inc();
    }

    fn routing_latency_observe(&self, seconds: f64) {
        self.routing_latency.with_label_values(&[]).observe(seconds);
    }

    fn circuit_open_total(&self, processor_id: &str) {
        self.circuit_open.with_label_values(&[processor_id]).inc();
    }

    fn backpressure_level_set(&self, level: i64) {
        self.backpressure_level.with_label_values(&[]).set(level as f64);
    }

    fn health_check_total(&self, processor_id: &str, status: &str) {
        self.health_checks
            .with_label_values(&[processor_id, status])
            .inc();
    }

    fn health_status_set(&self, processor_id: &str, status: i64) {
        self.health_status.with_label_values(&[processor_id]).set(status as f64);
    }

    fn admission_queue_size_set(&self, size: i64) {
        self.admission_queue_size.set(size as f64);
    }

    fn admission_oldest_age_seconds_set(&self, seconds: f64) {
        self.admission_oldest_age.set(seconds);
    }
}

/// Lazily-initialized shared no-op handle, used by defaults in constructors
/// that don't want to thread `Arc<dyn Metrics>` through every call site.
static NOOP_HANDLE: OnceCell<Arc<dyn Metrics>> = OnceCell::new();

pub fn noop() -> Arc<dyn Metrics> {
    NOOP_HANDLE
        .get_or_init(|| Arc::new(NoopMetrics) as Arc<dyn Metrics>)
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_handle_is_inert() {
        let m = noop();
        m.frames_enqueued_total("p1", "cam1");
        m.queue_depth_set("p1", 3);
    }

    #[test]
    fn prometheus_metrics_register_without_panicking() {
        let registry = Registry::new();
        let metrics = PrometheusMetrics::new(&registry).expect("metrics register");
        metrics.frames_enqueued_total("p1", "cam1");
        metrics.queue_depth_set("p1", 5);
        metrics.routing_latency_observe(0.002);

        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "frame_buffer_frames_enqueued_total"));
    }
}
