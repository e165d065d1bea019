//! Binary entry point: loads configuration, brings up logging, metrics, and
//! the async runtime, wires every core component through [`frame_shared`],
//! and runs the capture → stream consumer → (priority admission) → router
//! → processor queue pipeline until a shutdown signal arrives.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use frame_config::{Cli, Config};
use frame_consumer::StreamConsumer;
use frame_router::RouteOutcome;
use frame_shared::{Shared, SharedBuilder};
use frame_store::{RedisStore, Store, StreamMessage};
use frame_trace::TraceContext;
use frame_types::FrameEvent;

use frame_logger::{error, info, info_target, warn, warn_target};

const LOG_TARGET: &str = "frame_orchestrator";

/// How many new entries the consumer requests per read at full intake
/// (spec.md §4.8: backpressure scales this down via the published
/// multiplier, never up).
const BASE_READ_COUNT: u64 = 10;
const BLOCK_MS: u64 = 2_000;
const HEALTH_CHECK_COOLDOWN: Duration = Duration::from_secs(2);
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);
const RECLAIM_MIN_IDLE_MS: u64 = 60_000;

fn main() -> ExitCode {
    let config = match Cli::load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = frame_logger_service::init(Some("RUST_LOG"), config.logger.clone())
        .expect("logger backend installs exactly once per process");

    let version = frame_build_info::get_version(0, 1, 0, Some("frame-orchestrator"), None, None);
    info!("starting {version}");

    let (handle, runtime) = frame_async_runtime::new_runtime(config.worker_threads);
    let exit_code = handle.block_on(run(config, handle.clone()));

    frame_stop_handler::broadcast_exit_signals();
    handle.block_on(frame_stop_handler::wait_all_tasks());
    frame_stop_handler::wait_all_threads();
    drop(runtime);

    if exit_code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(config: Arc<Config>, handle: frame_async_runtime::Handle) -> i32 {
    let metrics_handle = frame_metrics_service::init(&config.metrics);
    let metrics = metrics_handle.metrics();

    let store: Arc<dyn Store> = match RedisStore::connect(&config.store.url).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("failed to connect to the store at {}: {}", config.store.url, err);
            return 1;
        }
    };

    let shared = SharedBuilder::new(config.clone(), metrics.clone(), store.clone(), Arc::new(handle.clone())).build();

    let consumer_name = format!("orchestrator-{}", std::process::id());
    let consumer = match StreamConsumer::init(
        store.clone(),
        config.stream.input_stream.clone(),
        config.stream.input_group.clone(),
        consumer_name,
    )
    .await
    {
        Ok(consumer) => Arc::new(consumer),
        Err(err) => {
            error!("failed to join consumer group {}: {}", config.stream.input_group, err);
            return 1;
        }
    };

    let stop = frame_stop_handler::cancellation_token();
    spawn_signal_watcher(&handle);

    shared.health.spawn_all(&handle, &shared.registry, stop.clone()).await;
    spawn_backpressure_ticker(&handle, shared.clone(), stop.clone());

    let in_flight: Arc<DashMap<String, String>> = Arc::new(DashMap::new());

    if config.admission.enabled {
        spawn_admission_dispatcher(&handle, shared.clone(), consumer.clone(), in_flight.clone(), stop.clone());
    }
    spawn_reclaim_loop(&handle, shared.clone(), consumer.clone(), in_flight.clone(), stop.clone());

    info!(
        "orchestrator running: input stream '{}', group '{}'",
        config.stream.input_stream, config.stream.input_group
    );

    while !stop.is_cancelled() {
        let (level, multiplier) = shared.backpressure.current();
        if multiplier <= 0.0 {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(HEALTH_CHECK_COOLDOWN) => {}
            }
            continue;
        }
        let count = ((BASE_READ_COUNT as f64) * multiplier).round().max(1.0) as u64;
        let _ = level;

        let messages = match consumer.consume(count, BLOCK_MS, &stop).await {
            Ok(messages) => messages,
            Err(err) => {
                warn_target!(LOG_TARGET, "consume error: {}", err);
                continue;
            }
        };
        if messages.is_empty() {
            continue;
        }
        let messages = messages.into_iter().map(|message| (message, 1)).collect();
        process_messages(&shared, &consumer, &in_flight, messages).await;
    }

    info!("shutdown signal received, draining in-flight work");
    0
}

fn spawn_signal_watcher(handle: &frame_async_runtime::Handle) {
    let join = handle.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt signal");
        }
        frame_stop_handler::broadcast_exit_signals();
    });
    frame_stop_handler::register_task("signal-watcher", join);
}

fn spawn_backpressure_ticker(
    handle: &frame_async_runtime::Handle,
    shared: Arc<Shared>,
    stop: frame_stop_handler::CancellationToken,
) {
    let join = handle.spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    shared.backpressure.tick().await;
                }
            }
        }
    });
    frame_stop_handler::register_task("backpressure-ticker", join);
}

/// Drains the priority admission queue into the router, one frame at a
/// time, when `config.admission.enabled` (spec.md §4.7: optional stage
/// between the consumer and the router).
fn spawn_admission_dispatcher(
    handle: &frame_async_runtime::Handle,
    shared: Arc<Shared>,
    consumer: Arc<StreamConsumer>,
    in_flight: Arc<DashMap<String, String>>,
    stop: frame_stop_handler::CancellationToken,
) {
    let join = handle.spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = stop.cancelled() => break,
                frame = shared.admission.dequeue() => frame,
            };
            let outcome = shared.router.route(&frame).await;
            settle_route_outcome(&consumer, &in_flight, &frame.frame_id, outcome).await;
        }
    });
    frame_stop_handler::register_task("admission-dispatcher", join);
}

/// Periodically reclaims input-stream entries that have sat pending past
/// `RECLAIM_MIN_IDLE_MS` (spec.md §4.4: recovers work left behind by a
/// crashed consumer) and re-feeds them through the same pipeline.
fn spawn_reclaim_loop(
    handle: &frame_async_runtime::Handle,
    shared: Arc<Shared>,
    consumer: Arc<StreamConsumer>,
    in_flight: Arc<DashMap<String, String>>,
    stop: frame_stop_handler::CancellationToken,
) {
    let join = handle.spawn(async move {
        let mut ticker = tokio::time::interval(RECLAIM_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    match consumer.claim_pending(RECLAIM_MIN_IDLE_MS, BASE_READ_COUNT).await {
                        Ok(reclaimed) if !reclaimed.is_empty() => {
                            info_target!(LOG_TARGET, "reclaimed {} stale pending entries", reclaimed.len());
                            let messages = reclaimed
                                .into_iter()
                                .map(|r| (r.message, r.delivery_count))
                                .collect();
                            process_messages(&shared, &consumer, &in_flight, messages).await;
                        }
                        Ok(_) => {}
                        Err(err) => warn_target!(LOG_TARGET, "reclaim scan failed: {}", err),
                    }
                }
            }
        }
    });
    frame_stop_handler::register_task("reclaim-loop", join);
}

/// Parses, traces, and routes (or admits) a batch of raw stream messages,
/// tracking each frame's source message id in `in_flight` so the
/// eventual routing outcome can decide whether to ack it.
///
/// `messages` pairs each raw entry with its delivery count as tracked by
/// the Store's pending list (1 for a fresh, never-reclaimed read); the
/// stream entry's own fields are immutable and never carry a redelivery
/// counter, so `retry_count` is always stamped from this delivery count,
/// never read back from the entry (spec.md §7's bounded retry counter).
async fn process_messages(
    shared: &Arc<Shared>,
    consumer: &Arc<StreamConsumer>,
    in_flight: &Arc<DashMap<String, String>>,
    messages: Vec<(StreamMessage, u64)>,
) {
    for (message, delivery_count) in messages {
        let mut fields = message.fields;
        fields.insert("retry_count".to_string(), delivery_count.saturating_sub(1).to_string());

        let frame = match FrameEvent::from_fields(&fields) {
            Ok(frame) => frame,
            Err(err) => {
                warn_target!(LOG_TARGET, "dropping malformed message {}: {}", message.id, err);
                if let Err(ack_err) = consumer.ack(&message.id).await {
                    warn_target!(LOG_TARGET, "failed to ack malformed message {}: {}", message.id, ack_err);
                }
                continue;
            }
        };

        let parent_ctx = TraceContext::from_json(&frame.trace_context).unwrap_or_else(|_| TraceContext::create(true));
        let _span = frame_trace::TraceSpan::start("ingest", &parent_ctx);

        in_flight.insert(frame.frame_id.clone(), message.id.clone());

        if shared.config.admission.enabled {
            shared.admission.enqueue(frame);
        } else {
            let outcome = shared.router.route(&frame).await;
            settle_route_outcome(consumer, in_flight, &frame.frame_id, outcome).await;
        }
    }
}

/// Acks the source message for every outcome except the two that must be
/// retried (a transient dispatch failure, or no capable processor being
/// available right now); those are left pending so [`spawn_reclaim_loop`]
/// eventually reclaims and redelivers them, counting toward the
/// redelivery cap the Router enforces.
async fn settle_route_outcome(
    consumer: &Arc<StreamConsumer>,
    in_flight: &Arc<DashMap<String, String>>,
    frame_id: &str,
    outcome: RouteOutcome,
) {
    let should_ack = match &outcome {
        RouteOutcome::Dispatched { .. } => true,
        RouteOutcome::DeadLettered { .. } => true,
        RouteOutcome::MissingCapability => true,
        RouteOutcome::NoCapableProcessor => false,
        RouteOutcome::DispatchFailed { .. } => false,
    };

    if !should_ack {
        in_flight.remove(frame_id);
        return;
    }
    if let Some((_, message_id)) = in_flight.remove(frame_id) {
        if let Err(err) = consumer.ack(&message_id).await {
            warn_target!(LOG_TARGET, "failed to ack message for frame {}: {}", frame_id, err);
        }
    }
}

