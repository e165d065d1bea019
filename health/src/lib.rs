//! Health Monitor (spec.md §4.9): periodically probes each processor's
//! health endpoint, classifies the response, and feeds both the circuit
//! breaker set (an unhealthy streak forces a breaker open; a sustained
//! healthy streak clears it) and an operator-facing `status`/`details`
//! surface.
//!
//! One probe task per processor (DESIGN NOTES' per-component actor
//! pattern, mirrored from `frame-breaker`'s per-processor breaker actor),
//! spawned through the same [`frame_spawn::Spawn`] abstraction the rest of
//! the workspace uses instead of calling `tokio::spawn` directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use frame_breaker::BreakerSet;
use frame_config::HealthConfig;
use frame_metrics::Metrics;
use frame_registry::ProcessorRegistry;
use frame_spawn::Spawn;
use frame_systemtime::unix_time_as_millis;
use frame_types::ProcessorDescriptor;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use frame_logger::{info_target, warn_target};

const LOG_TARGET: &str = "frame_health";

/// Classified health status (spec.md §6 "Processor HTTP contract").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn as_label(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    fn as_metric_value(self) -> i64 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

/// The last probe payload (spec.md §6): `GET <health_endpoint>` returns
/// `{status, capacity_used?, frames_processed?, avg_processing_time_ms?,
/// errors_last_minute?}`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct HealthPayload {
    pub status: String,
    pub capacity_used: Option<f64>,
    pub frames_processed: Option<u64>,
    pub avg_processing_time_ms: Option<f64>,
    pub errors_last_minute: Option<u64>,
}

/// What one probe attempt produced, before classification. Kept distinct
/// from [`HealthStatus`] so "any non-2xx or timeout" collapses to
/// `Unhealthy` in one place ([`classify`]) rather than at every call site.
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeOutcome {
    Ok(HealthPayload),
    HttpError,
    Timeout,
    ParseError,
}

fn classify(outcome: ProbeOutcome) -> (HealthStatus, Option<HealthPayload>) {
    match outcome {
        ProbeOutcome::Ok(payload) => {
            let status = match payload.status.as_str() {
                "healthy" => HealthStatus::Healthy,
                "degraded" => HealthStatus::Degraded,
                _ => HealthStatus::Unhealthy,
            };
            (status, Some(payload))
        }
        ProbeOutcome::HttpError | ProbeOutcome::Timeout | ProbeOutcome::ParseError => {
            (HealthStatus::Unhealthy, None)
        }
    }
}

/// Abstraction over "make the HTTP call", so unit tests script outcomes
/// instead of standing up a real server (the same shape as
/// [`frame_store::Store`]'s production/in-memory split).
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> ProbeOutcome;
}

/// `reqwest`-backed implementation of [`HealthProbe`] (spec.md §6).
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl Default for ReqwestProbe {
    fn default() -> Self {
        ReqwestProbe {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HealthProbe for ReqwestProbe {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> ProbeOutcome {
        let response = match self.client.get(endpoint).timeout(timeout).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return ProbeOutcome::Timeout,
            Err(_) => return ProbeOutcome::HttpError,
        };
        if !response.status().is_success() {
            return ProbeOutcome::HttpError;
        }
        match response.json::<HealthPayload>().await {
            Ok(payload) => ProbeOutcome::Ok(payload),
            Err(_) => ProbeOutcome::ParseError,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealthParams {
    pub check_interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl From<&HealthConfig> for HealthParams {
    fn from(cfg: &HealthConfig) -> Self {
        HealthParams {
            check_interval: Duration::from_secs(cfg.check_interval_secs),
            timeout: Duration::from_millis(cfg.timeout_ms),
            failure_threshold: cfg.failure_threshold,
            recovery_timeout: Duration::from_secs(cfg.recovery_timeout_secs),
        }
    }
}

impl Default for HealthParams {
    fn default() -> Self {
        HealthParams::from(&HealthConfig::default())
    }
}

struct ProcessorHealth {
    status: HealthStatus,
    seen: bool,
    unhealthy_streak: u32,
    healthy_since: Option<u64>,
    breaker_failed: bool,
    last_payload: Option<HealthPayload>,
}

impl Default for ProcessorHealth {
    fn default() -> Self {
        ProcessorHealth {
            status: HealthStatus::Unhealthy,
            seen: false,
            unhealthy_streak: 0,
            healthy_since: None,
            breaker_failed: false,
            last_payload: None,
        }
    }
}

type StatusChangeCallback = dyn Fn(&str, HealthStatus, HealthStatus) + Send + Sync;

/// Per-processor health probing, breaker wiring, and the operator-facing
/// `status`/`details` surface (spec.md §4.9).
pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    breakers: Arc<BreakerSet>,
    metrics: Arc<dyn Metrics>,
    params: HealthParams,
    states: DashMap<String, ProcessorHealth>,
    on_status_change: Option<Arc<StatusChangeCallback>>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, breakers: Arc<BreakerSet>, metrics: Arc<dyn Metrics>, params: HealthParams) -> Self {
        HealthMonitor {
            probe,
            breakers,
            metrics,
            params,
            states: DashMap::new(),
            on_status_change: None,
        }
    }

    /// Registers a callback invoked exactly once per real status
    /// transition (spec.md §4.9: edge-triggered, not level-triggered; the
    /// very first observation of a processor is not itself a transition).
    pub fn with_status_change_callback(
        mut self,
        callback: impl Fn(&str, HealthStatus, HealthStatus) + Send + Sync + 'static,
    ) -> Self {
        self.on_status_change = Some(Arc::new(callback));
        self
    }

    /// Probes `endpoint` for `processor_id`, updates its tracked state,
    /// and wires the outcome into the circuit breaker per spec.md §4.9:
    /// an unhealthy streak reaching `failure_threshold` forces the
    /// breaker open directly (its own `failure_threshold` is a distinct,
    /// unrelated counter, so this never goes through
    /// [`frame_breaker::Outcome::Failure`]); a healthy streak held for at
    /// least `recovery_timeout` force-closes it again.
    pub async fn check(&self, processor_id: &str, endpoint: &str) -> HealthStatus {
        let outcome = self.probe.probe(endpoint, self.params.timeout).await;
        let (status, payload) = classify(outcome);
        let now = unix_time_as_millis();

        let (previous, previously_known, became_failed, became_recovered) = {
            let mut entry = self
                .states
                .entry(processor_id.to_string())
                .or_insert_with(ProcessorHealth::default);
            let previous = entry.status;
            let previously_known = entry.seen;
            entry.seen = true;
            entry.status = status;
            entry.last_payload = payload;

            let mut became_failed = false;
            let mut became_recovered = false;
            match status {
                HealthStatus::Unhealthy => {
                    entry.unhealthy_streak += 1;
                    entry.healthy_since = None;
                    if entry.unhealthy_streak >= self.params.failure_threshold && !entry.breaker_failed {
                        entry.breaker_failed = true;
                        became_failed = true;
                    }
                }
                HealthStatus::Healthy => {
                    entry.unhealthy_streak = 0;
                    let healthy_since = *entry.healthy_since.get_or_insert(now);
                    if entry.breaker_failed
                        && now.saturating_sub(healthy_since) >= self.params.recovery_timeout.as_millis() as u64
                    {
                        entry.breaker_failed = false;
                        became_recovered = true;
                    }
                }
                HealthStatus::Degraded => {
                    // Neither a success nor a failure: propagates through
                    // `status`/`details` without shifting the breaker.
                }
            }
            (previous, previously_known, became_failed, became_recovered)
        };

        if became_failed {
            warn_target!(LOG_TARGET, "processor {} unhealthy streak tripped its breaker", processor_id);
            self.breakers.force_open(processor_id).await;
        }
        if became_recovered {
            info_target!(LOG_TARGET, "processor {} health recovered, clearing breaker", processor_id);
            self.breakers.force_close(processor_id).await;
        }

        self.metrics.health_check_total(processor_id, status.as_label());
        self.metrics.health_status_set(processor_id, status.as_metric_value());

        if previously_known && previous != status {
            if let Some(callback) = &self.on_status_change {
                callback(processor_id, previous, status);
            }
        }

        status
    }

    pub fn status(&self, processor_id: &str) -> Option<HealthStatus> {
        self.states.get(processor_id).map(|entry| entry.status)
    }

    pub fn details(&self, processor_id: &str) -> Option<HealthPayload> {
        self.states.get(processor_id).and_then(|entry| entry.last_payload.clone())
    }

    /// Spawns one probe loop for `descriptor`, ticking at `check_interval`
    /// until `stop` fires. A no-op when the descriptor has no
    /// `health_endpoint`.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        spawner: &dyn Spawn,
        descriptor: ProcessorDescriptor,
        stop: CancellationToken,
    ) {
        let Some(endpoint) = descriptor.health_endpoint.clone() else {
            return;
        };
        let monitor = self.clone();
        let interval = self.params.check_interval;
        frame_spawn::spawn(spawner, async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.check(&descriptor.id, &endpoint).await;
                    }
                }
            }
        });
    }

    /// Spawns a probe loop for every currently-registered processor that
    /// advertises a `health_endpoint`.
    pub async fn spawn_all(self: &Arc<Self>, spawner: &dyn Spawn, registry: &ProcessorRegistry, stop: CancellationToken) {
        let descriptors = match registry.list_all().await {
            Ok(descriptors) => descriptors,
            Err(err) => {
                warn_target!(LOG_TARGET, "could not list processors to start health probes: {}", err);
                return;
            }
        };
        for descriptor in descriptors {
            self.spawn_probe_loop(spawner, descriptor, stop.clone());
        }
    }

    /// A snapshot of every tracked processor's last classified status,
    /// for an operator-facing summary.
    pub fn snapshot(&self) -> HashMap<String, HealthStatus> {
        self.states.iter().map(|e| (e.key().clone(), e.value().status)).collect()
    }
}
