//! Wires [`frame_metrics_config::MetricsConfig`] into a live
//! [`frame_metrics::Metrics`] handle plus the `prometheus::Registry` backing
//! it.
//!
//! Mounting that registry behind an HTTP `/metrics` scrape endpoint is an
//! external collaborator (spec.md §1 "out of scope"); this crate stops at
//! handing the embedding binary a [`Handle`] it could mount one on.

use std::sync::Arc;

use frame_logger::info;
use frame_metrics::{noop, Metrics, PrometheusMetrics};
use frame_metrics_config::MetricsConfig;
use prometheus::Registry;

/// Owns the `prometheus::Registry` (when metrics are enabled) and the
/// [`Metrics`] facade handed out to every component.
#[derive(Clone)]
pub struct Handle {
    registry: Option<Registry>,
    metrics: Arc<dyn Metrics>,
}

impl Handle {
    pub fn metrics(&self) -> Arc<dyn Metrics> {
        self.metrics.clone()
    }

    /// `None` when metrics are disabled; the embedding binary has nothing to
    /// mount a scrape endpoint on in that case.
    pub fn registry(&self) -> Option<&Registry> {
        self.registry.as_ref()
    }
}

/// Builds the metrics [`Handle`] described by `config`. Falls back to the
/// no-op facade, with a warning, if registration of the `prometheus` metric
/// families fails (e.g. duplicate registration in a test process).
pub fn init(config: &MetricsConfig) -> Handle {
    if !config.enabled {
        info!("metrics disabled by configuration");
        return Handle {
            registry: None,
            metrics: noop(),
        };
    }

    let registry = Registry::new();
    match PrometheusMetrics::new(&registry) {
        Ok(metrics) => {
            info!("metrics registry initialized under namespace '{}'", config.namespace);
            Handle {
                registry: Some(registry),
                metrics: Arc::new(metrics),
            }
        }
        Err(err) => {
            frame_logger::warn!("failed to register metrics, falling back to no-op: {err}");
            Handle {
                registry: None,
                metrics: noop(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_yields_no_registry() {
        let handle = init(&MetricsConfig {
            enabled: false,
            namespace: "x".into(),
        });
        assert!(handle.registry().is_none());
    }

    #[test]
    fn enabled_config_yields_a_registry() {
        let handle = init(&MetricsConfig::default());
        assert!(handle.registry().is_some());
        handle.metrics().queue_depth_set("p1", 1);
    }
}
