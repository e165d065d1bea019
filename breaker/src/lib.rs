//! Circuit Breaker Set (spec.md §4.5): one breaker per processor, modeled
//! as an actor owning its state exclusively (DESIGN NOTES "per-breaker
//! shared state") so no lock guards the closed/open/half-open transition —
//! different breakers progress fully independently (spec.md §5).

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use frame_config::BreakerConfig;
use frame_metrics::Metrics;
use frame_spawn::Spawn;
use frame_systemtime::unix_time_as_millis;
use tokio::sync::{mpsc, oneshot};

use frame_logger::{info_target, warn_target};

const LOG_TARGET: &str = "frame_breaker";
/// The kind recorded when a guarded call exceeds `call_timeout` (spec.md §4.5:
/// "a call timeout counts as a failure of kind 'timeout'").
pub const TIMEOUT_KIND: &str = "timeout";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerParams {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub excluded_error_kinds: HashSet<String>,
    pub call_timeout: Option<Duration>,
}

impl From<&BreakerConfig> for BreakerParams {
    fn from(cfg: &BreakerConfig) -> Self {
        BreakerParams {
            failure_threshold: cfg.failure_threshold,
            recovery_timeout: Duration::from_secs(cfg.recovery_timeout_secs),
            success_threshold: cfg.success_threshold,
            excluded_error_kinds: HashSet::new(),
            call_timeout: cfg.call_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl Default for BreakerParams {
    fn default() -> Self {
        BreakerParams::from(&BreakerConfig::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// `kind` is compared against `excluded_error_kinds`; an excluded kind
    /// is neither a success nor a failure and does not shift counters
    /// (spec.md §4.5).
    Failure { kind: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BreakerMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub circuit_open_count: u64,
}

/// Error returned by [`BreakerHandle::call`].
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    #[error("circuit breaker for processor '{0}' is open")]
    CircuitOpen(String),
    #[error("call timed out")]
    Timeout,
    #[error(transparent)]
    Inner(E),
}

enum Command {
    Available(oneshot::Sender<bool>),
    Record(Outcome),
    /// Forces the breaker `Open` regardless of its failure window
    /// (spec.md §4.9: the health monitor's own unhealthy-streak signal is
    /// independent of the breaker's `failure_threshold` and must not be
    /// diluted by routing it through [`Outcome::Failure`]).
    ForceOpen,
    /// Forces the breaker `Closed` regardless of recovery timing (spec.md
    /// §4.9: a sustained healthy streak clears the health-forced state
    /// directly).
    ForceClose,
    Metrics(oneshot::Sender<BreakerMetrics>),
    State(oneshot::Sender<CircuitState>),
}

struct Actor {
    id: String,
    params: BreakerParams,
    metrics: Arc<dyn Metrics>,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<u64>,
    half_open_successes: u32,
    half_open_inflight: bool,
    counters: BreakerMetrics,
}

impl Actor {
    fn new(id: String, params: BreakerParams, metrics: Arc<dyn Metrics>) -> Self {
        Actor {
            id,
            params,
            metrics,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_successes: 0,
            half_open_inflight: false,
            counters: BreakerMetrics::default(),
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(unix_time_as_millis());
        self.half_open_successes = 0;
        self.half_open_inflight = false;
        self.counters.circuit_open_count += 1;
        self.metrics.circuit_open_total(&self.id);
        warn_target!(LOG_TARGET, "breaker for {} opened", self.id);
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_successes = 0;
        self.half_open_inflight = false;
        info_target!(LOG_TARGET, "breaker for {} closed", self.id);
    }

    /// Whether the next call may proceed, per spec.md §4.5's state
    /// machine. A query against `Open` whose recovery timeout has elapsed
    /// transitions to `HalfOpen` and grants the single in-flight probe.
    fn available(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = unix_time_as_millis().saturating_sub(self.opened_at.unwrap_or(0));
                if elapsed >= self.params.recovery_timeout.as_millis() as u64 {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_inflight = true;
                    info_target!(LOG_TARGET, "breaker for {} half-opening for a probe", self.id);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_inflight {
                    false
                } else {
                    self.half_open_inflight = true;
                    true
                }
            }
        }
    }

    fn record(&mut self, outcome: Outcome) {
        self.counters.total_calls += 1;
        match outcome {
            Outcome::Success => {
                self.counters.successful_calls += 1;
                match self.state {
                    CircuitState::Closed => self.consecutive_failures = 0,
                    CircuitState::HalfOpen => {
                        self.half_open_inflight = false;
                        self.half_open_successes += 1;
                        if self.half_open_successes >= self.params.success_threshold {
                            self.close();
                        }
                    }
                    CircuitState::Open => {}
                }
            }
            Outcome::Failure { kind } => {
                if self.params.excluded_error_kinds.contains(&kind) {
                    // Excluded: propagates but shifts no counters.
                    self.counters.total_calls -= 1;
                    return;
                }
                self.counters.failed_calls += 1;
                match self.state {
                    CircuitState::Closed => {
                        self.consecutive_failures += 1;
                        if self.consecutive_failures >= self.params.failure_threshold {
                            self.open();
                        }
                    }
                    CircuitState::HalfOpen => self.open(),
                    CircuitState::Open => {}
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Available(reply) => {
                let _ = reply.send(self.available());
            }
            Command::Record(outcome) => self.record(outcome),
            Command::ForceOpen => {
                if self.state != CircuitState::Open {
                    self.open();
                }
            }
            Command::ForceClose => {
                if self.state != CircuitState::Closed {
                    self.close();
                }
            }
            Command::Metrics(reply) => {
                let _ = reply.send(self.counters);
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
        }
    }
}

/// A cloneable reference to one processor's breaker actor.
#[derive(Clone)]
pub struct BreakerHandle {
    tx: mpsc::Sender<Command>,
}

impl BreakerHandle {
    pub async fn available(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Available(reply_tx)).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub async fn record_outcome(&self, outcome: Outcome) {
        let _ = self.tx.send(Command::Record(outcome)).await;
    }

    /// Forces this breaker open outside of its own failure-window
    /// accounting (spec.md §4.9 "mark the breaker failed").
    pub async fn force_open(&self) {
        let _ = self.tx.send(Command::ForceOpen).await;
    }

    /// Forces this breaker closed outside of its own recovery-timeout
    /// accounting (spec.md §4.9 "clears it").
    pub async fn force_close(&self) {
        let _ = self.tx.send(Command::ForceClose).await;
    }

    pub async fn metrics(&self) -> BreakerMetrics {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Metrics(reply_tx)).await.is_err() {
            return BreakerMetrics::default();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn state(&self) -> CircuitState {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::State(reply_tx)).await.is_err() {
            return CircuitState::Closed;
        }
        reply_rx.await.unwrap_or(CircuitState::Closed)
    }

    /// Guards `op` with this breaker: if not [`BreakerHandle::available`],
    /// returns [`CallError::CircuitOpen`] without invoking `op`. Otherwise
    /// runs `op`, applying `call_timeout` if configured (a timeout records
    /// a failure of kind [`TIMEOUT_KIND`]) and classifying any `Err` via
    /// `classify` to decide whether it counts as a breaker failure.
    pub async fn call<F, Fut, T, E>(
        &self,
        processor_id: &str,
        classify: impl Fn(&E) -> String,
        call_timeout: Option<Duration>,
        op: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.available().await {
            return Err(CallError::CircuitOpen(processor_id.to_string()));
        }
        let outcome_result = match call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => {
                    self.record_outcome(Outcome::Failure {
                        kind: TIMEOUT_KIND.to_string(),
                    })
                    .await;
                    return Err(CallError::Timeout);
                }
            },
            None => op().await,
        };
        match outcome_result {
            Ok(value) => {
                self.record_outcome(Outcome::Success).await;
                Ok(value)
            }
            Err(err) => {
                self.record_outcome(Outcome::Failure {
                    kind: classify(&err),
                })
                .await;
                Err(CallError::Inner(err))
            }
        }
    }
}

/// Owns one [`BreakerHandle`] per processor id, spawning its actor task
/// lazily on first use and evicting it when the processor unregisters
/// (spec.md §3 "evicted when processor unregisters").
pub struct BreakerSet {
    spawner: Arc<dyn Spawn>,
    params: BreakerParams,
    metrics: Arc<dyn Metrics>,
    breakers: DashMap<String, BreakerHandle>,
}

impl BreakerSet {
    pub fn new(spawner: Arc<dyn Spawn>, params: BreakerParams, metrics: Arc<dyn Metrics>) -> Self {
        BreakerSet {
            spawner,
            params,
            metrics,
            breakers: DashMap::new(),
        }
    }

    fn spawn_actor(&self, processor_id: &str) -> BreakerHandle {
        let (tx, mut rx) = mpsc::channel::<Command>(256);
        let mut actor = Actor::new(processor_id.to_string(), self.params.clone(), self.metrics.clone());
        frame_spawn::spawn(self.spawner.as_ref(), async move {
            while let Some(cmd) = rx.recv().await {
                actor.handle(cmd);
            }
        });
        BreakerHandle { tx }
    }

    /// Returns the breaker for `processor_id`, spawning its actor on first
    /// use.
    pub fn get_or_create(&self, processor_id: &str) -> BreakerHandle {
        if let Some(handle) = self.breakers.get(processor_id) {
            return handle.clone();
        }
        let handle = self.spawn_actor(processor_id);
        self.breakers.insert(processor_id.to_string(), handle.clone());
        handle
    }

    pub async fn available(&self, processor_id: &str) -> bool {
        self.get_or_create(processor_id).available().await
    }

    pub async fn record_outcome(&self, processor_id: &str, outcome: Outcome) {
        self.get_or_create(processor_id).record_outcome(outcome).await;
    }

    /// Forces the breaker for `processor_id` open, independent of its own
    /// `failure_threshold` (spec.md §4.9: the health monitor's unhealthy
    /// streak is a distinct signal from the breaker's own failure count).
    pub async fn force_open(&self, processor_id: &str) {
        self.get_or_create(processor_id).force_open().await;
    }

    /// Forces the breaker for `processor_id` closed, independent of its
    /// own recovery timing.
    pub async fn force_close(&self, processor_id: &str) {
        self.get_or_create(processor_id).force_close().await;
    }

    pub async fn state(&self, processor_id: &str) -> Option<CircuitState> {
        let handle = self.breakers.get(processor_id)?.clone();
        Some(handle.state().await)
    }

    pub async fn metrics(&self, processor_id: &str) -> Option<BreakerMetrics> {
        let handle = self.breakers.get(processor_id)?.clone();
        Some(handle.metrics().await)
    }

    /// Drops the breaker for `processor_id` (its actor task exits once its
    /// sender is dropped).
    pub fn remove(&self, processor_id: &str) {
        self.breakers.remove(processor_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_async_runtime_test_support::local_spawner;

    fn params() -> BreakerParams {
        BreakerParams {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            success_threshold: 2,
            excluded_error_kinds: HashSet::new(),
            call_timeout: None,
        }
    }

    #[tokio::test]
    async fn closed_breaker_is_available() {
        let set = BreakerSet::new(local_spawner(), params(), frame_metrics::noop());
        assert!(set.available("p1").await);
    }

    #[tokio::test]
    async fn opens_after_consecutive_failure_threshold() {
        let set = BreakerSet::new(local_spawner(), params(), frame_metrics::noop());
        for _ in 0..3 {
            set.record_outcome("p1", Outcome::Failure { kind: "enqueue_error".to_string() })
                .await;
        }
        assert_eq!(set.state("p1").await, Some(CircuitState::Open));
        assert!(!set.available("p1").await);
    }

    #[tokio::test]
    async fn success_in_closed_resets_consecutive_failures() {
        let set = BreakerSet::new(local_spawner(), params(), frame_metrics::noop());
        set.record_outcome("p1", Outcome::Failure { kind: "x".to_string() }).await;
        set.record_outcome("p1", Outcome::Failure { kind: "x".to_string() }).await;
        set.record_outcome("p1", Outcome::Success).await;
        set.record_outcome("p1", Outcome::Failure { kind: "x".to_string() }).await;
        set.record_outcome("p1", Outcome::Failure { kind: "x".to_string() }).await;
        // Two failures since the reset; threshold is 3, so still closed.
        assert_eq!(set.state("p1").await, Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn half_open_after_recovery_timeout_then_closes_on_success_threshold() {
        let set = BreakerSet::new(local_spawner(), params(), frame_metrics::noop());
        for _ in 0..3 {
            set.record_outcome("p1", Outcome::Failure { kind: "x".to_string() }).await;
        }
        assert_eq!(set.state("p1").await, Some(CircuitState::Open));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(set.available("p1").await);
        assert_eq!(set.state("p1").await, Some(CircuitState::HalfOpen));
        // No second probe while the first is in flight.
        assert!(!set.available("p1").await);

        set.record_outcome("p1", Outcome::Success).await;
        assert_eq!(set.state("p1").await, Some(CircuitState::HalfOpen));
        assert!(set.available("p1").await);
        set.record_outcome("p1", Outcome::Success).await;
        assert_eq!(set.state("p1").await, Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let set = BreakerSet::new(local_spawner(), params(), frame_metrics::noop());
        for _ in 0..3 {
            set.record_outcome("p1", Outcome::Failure { kind: "x".to_string() }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(set.available("p1").await);
        set.record_outcome("p1", Outcome::Failure { kind: "x".to_string() }).await;
        assert_eq!(set.state("p1").await, Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn excluded_error_kind_does_not_shift_counters() {
        let mut p = params();
        p.excluded_error_kinds.insert("validation".to_string());
        let set = BreakerSet::new(local_spawner(), p, frame_metrics::noop());
        for _ in 0..5 {
            set.record_outcome("p1", Outcome::Failure { kind: "validation".to_string() })
                .await;
        }
        assert_eq!(set.state("p1").await, Some(CircuitState::Closed));
        let metrics = set.metrics("p1").await.unwrap();
        assert_eq!(metrics.total_calls, 0);
    }

    #[tokio::test]
    async fn call_short_circuits_when_open() {
        let set = BreakerSet::new(local_spawner(), params(), frame_metrics::noop());
        for _ in 0..3 {
            set.record_outcome("p1", Outcome::Failure { kind: "x".to_string() }).await;
        }
        let handle = set.get_or_create("p1");
        let result: Result<(), CallError<String>> = handle
            .call("p1", |e: &String| e.clone(), None, || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(CallError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn force_open_trips_the_breaker_without_touching_the_failure_window() {
        let set = BreakerSet::new(local_spawner(), params(), frame_metrics::noop());
        set.force_open("p1").await;
        assert_eq!(set.state("p1").await, Some(CircuitState::Open));
        assert!(!set.available("p1").await);
        // No failures were ever recorded against the rolling window.
        assert_eq!(set.metrics("p1").await.unwrap().failed_calls, 0);
    }

    #[tokio::test]
    async fn force_close_clears_a_forced_open_breaker() {
        let set = BreakerSet::new(local_spawner(), params(), frame_metrics::noop());
        set.force_open("p1").await;
        assert!(!set.available("p1").await);
        set.force_close("p1").await;
        assert_eq!(set.state("p1").await, Some(CircuitState::Closed));
        assert!(set.available("p1").await);
    }

    #[tokio::test]
    async fn call_records_timeout_as_failure_kind() {
        let set = BreakerSet::new(local_spawner(), params(), frame_metrics::noop());
        let handle = set.get_or_create("p1");
        let result: Result<(), CallError<String>> = handle
            .call(
                "p1",
                |e: &String| e.clone(),
                Some(Duration::from_millis(10)),
                || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                },
            )
            .await;
        assert!(matches!(result, Err(CallError::Timeout)));
    }
}

/// Test-only spawner that runs every future on the current tokio runtime
/// (the actor loop is just a task; its scheduling doesn't matter for unit
/// tests as long as something polls it).
#[cfg(test)]
mod frame_async_runtime_test_support {
    use std::sync::Arc;

    use frame_spawn::{BoxFuture, Spawn};

    struct TokioSpawner;

    impl Spawn for TokioSpawner {
        fn spawn(&self, future: BoxFuture) {
            tokio::spawn(future);
        }
    }

    pub fn local_spawner() -> Arc<dyn Spawn> {
        Arc::new(TokioSpawner)
    }
}
