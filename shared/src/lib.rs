//! Shared Context: aggregates the core's long-lived state — the processor
//! registry, queue manager, breaker set, router, priority admission, and
//! backpressure controller — plus the loaded config and metrics handle,
//! into one `Arc<Shared>` every task clones. Mirrors the teacher's
//! `ckb-shared` role of gluing subsystems together without introducing
//! ambient globals: every field here is reached through `Shared`, never
//! through a `static`.

use std::sync::Arc;

use frame_admission::{AdmissionParams, PriorityAdmission};
use frame_backpressure::{BackpressureController, BackpressureParams};
use frame_breaker::{BreakerParams, BreakerSet};
use frame_config::Config;
use frame_health::{HealthMonitor, HealthParams, HealthProbe, ReqwestProbe};
use frame_metrics::Metrics;
use frame_queue::QueueManager;
use frame_registry::ProcessorRegistry;
use frame_router::Router;
use frame_spawn::Spawn;
use frame_store::Store;

/// The fully-wired core: every component that needs another component
/// reaches it through here rather than constructing its own.
pub struct Shared {
    pub config: Arc<Config>,
    pub metrics: Arc<dyn Metrics>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<ProcessorRegistry>,
    pub queue: Arc<QueueManager>,
    pub breakers: Arc<BreakerSet>,
    pub router: Arc<Router>,
    pub admission: Arc<PriorityAdmission>,
    pub backpressure: Arc<BackpressureController>,
    pub health: Arc<HealthMonitor>,
}

/// Builds a [`Shared`] from its external collaborators (the store, a
/// spawner, and an optional health probe override for tests), wiring every
/// component's constructor parameters from `config` the way `main` would
/// otherwise have to inline.
pub struct SharedBuilder {
    config: Arc<Config>,
    metrics: Arc<dyn Metrics>,
    store: Arc<dyn Store>,
    spawner: Arc<dyn Spawn>,
    health_probe: Option<Arc<dyn HealthProbe>>,
}

impl SharedBuilder {
    pub fn new(config: Arc<Config>, metrics: Arc<dyn Metrics>, store: Arc<dyn Store>, spawner: Arc<dyn Spawn>) -> Self {
        SharedBuilder {
            config,
            metrics,
            store,
            spawner,
            health_probe: None,
        }
    }

    /// Overrides the health monitor's probe; production wiring leaves this
    /// unset and gets a [`ReqwestProbe`].
    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    pub fn build(self) -> Arc<Shared> {
        let registry = Arc::new(ProcessorRegistry::new(self.store.clone()).with_cache());
        let queue = Arc::new(QueueManager::new(self.store.clone(), self.metrics.clone()));
        let breakers = Arc::new(BreakerSet::new(
            self.spawner.clone(),
            BreakerParams::from(&self.config.breaker),
            self.metrics.clone(),
        ));
        let router = Arc::new(
            Router::new(
                registry.clone(),
                breakers.clone(),
                queue.clone(),
                self.store.clone(),
                self.metrics.clone(),
            )
            .with_redelivery_cap(
                self.config.stream.max_redelivery_attempts,
                self.config.stream.dead_letter_stream.clone(),
            ),
        );
        let admission = Arc::new(PriorityAdmission::new(
            AdmissionParams::from(&self.config.admission),
            self.metrics.clone(),
        ));
        let backpressure = Arc::new(BackpressureController::new(
            registry.clone(),
            queue.clone(),
            self.metrics.clone(),
            BackpressureParams::from(&self.config.backpressure),
        ));
        let probe = self.health_probe.unwrap_or_else(|| Arc::new(ReqwestProbe::default()));
        let health = Arc::new(HealthMonitor::new(
            probe,
            breakers.clone(),
            self.metrics.clone(),
            HealthParams::from(&self.config.health),
        ));

        Arc::new(Shared {
            config: self.config,
            metrics: self.metrics,
            store: self.store,
            registry,
            queue,
            breakers,
            router,
            admission,
            backpressure,
            health,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_store::InMemoryStore;

    struct TokioSpawner;
    impl Spawn for TokioSpawner {
        fn spawn(&self, future: frame_spawn::BoxFuture) {
            tokio::spawn(future);
        }
    }

    #[tokio::test]
    async fn build_wires_every_component_against_the_same_store() {
        let config = Arc::new(Config::default());
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let shared = SharedBuilder::new(config, frame_metrics::noop(), store, Arc::new(TokioSpawner)).build();

        shared
            .registry
            .register(frame_types::ProcessorDescriptor::new("p1", vec!["face".to_string()], 10))
            .await
            .unwrap();
        let found = shared.registry.find_by_capability("face").await.unwrap();
        assert_eq!(found, std::collections::BTreeSet::from(["p1".to_string()]));
        assert!(shared.breakers.available("p1").await);
        assert!(shared.admission.is_empty());
    }
}
