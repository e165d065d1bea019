//! Coordinated shutdown.
//!
//! Every long-running component (consumer loop, breaker actors, health
//! probes) holds a clone of the same [`CancellationToken`] and a clone of
//! the same crossbeam `Receiver<()>`. [`broadcast_exit_signals`] trips the
//! token and closes the channel at the same instant, so async tasks
//! (`select! { _ = token.cancelled() => ... }`) and blocking threads
//! (`select! { recv(rx) -> _ => ... }`) wake up together. `main` registers
//! every spawned task/thread here and calls [`wait_all`] once shutdown has
//! been broadcast, so nothing is left running when the process exits.

use std::thread::JoinHandle;

use frame_logger::{info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
pub use tokio_util::sync::CancellationToken;

static TOKEN: OnceCell<CancellationToken> = OnceCell::new();
static EXIT_CHANNEL: OnceCell<Mutex<Option<frame_channel::Sender<()>>>> = OnceCell::new();
static EXIT_RECEIVER: OnceCell<frame_channel::Receiver<()>> = OnceCell::new();
static REGISTRY: OnceCell<Mutex<Registry>> = OnceCell::new();

#[derive(Default)]
struct Registry {
    threads: Vec<(String, JoinHandle<()>)>,
    tasks: Vec<(String, tokio::task::JoinHandle<()>)>,
}

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

fn channel() -> (&'static Mutex<Option<frame_channel::Sender<()>>>, &'static frame_channel::Receiver<()>) {
    let rx = EXIT_RECEIVER.get_or_init(|| {
        let (tx, rx) = frame_channel::bounded(0);
        EXIT_CHANNEL
            .set(Mutex::new(Some(tx)))
            .unwrap_or_else(|_| unreachable!("EXIT_RECEIVER and EXIT_CHANNEL init together"));
        rx
    });
    (EXIT_CHANNEL.get().expect("initialized above"), rx)
}

/// The process-wide cancellation token. Clone it freely; cloning a
/// `CancellationToken` shares the same underlying flag.
pub fn cancellation_token() -> CancellationToken {
    TOKEN.get_or_init(CancellationToken::new).clone()
}

/// A receiver that unblocks with `Err(Disconnected)` once shutdown has been
/// broadcast. Meant for `crossbeam_channel::select!` in blocking threads
/// that have no tokio runtime to `await` a `CancellationToken` on.
pub fn new_exit_rx() -> frame_channel::Receiver<()> {
    channel().1.clone()
}

/// Trips the cancellation token and closes the exit channel. Safe to call
/// more than once; only the first call has any effect.
pub fn broadcast_exit_signals() {
    cancellation_token().cancel();
    let (sender_slot, _rx) = channel();
    if sender_slot.lock().take().is_some() {
        info!("shutdown broadcast to all registered tasks and threads");
    }
}

pub fn has_received_exit_signal() -> bool {
    cancellation_token().is_cancelled()
}

/// Registers a blocking thread so [`wait_all`] joins it during shutdown.
pub fn register_thread(name: impl Into<String>, handle: JoinHandle<()>) {
    registry().lock().threads.push((name.into(), handle));
}

/// Registers a tokio task so [`wait_all_tasks`] awaits it during shutdown.
pub fn register_task(name: impl Into<String>, handle: tokio::task::JoinHandle<()>) {
    registry().lock().tasks.push((name.into(), handle));
}

/// Joins every registered blocking thread. Call after [`broadcast_exit_signals`]
/// so the threads have actually been told to stop.
pub fn wait_all_threads() {
    let threads = std::mem::take(&mut registry().lock().threads);
    for (name, handle) in threads {
        if handle.join().is_err() {
            warn!("thread '{name}' panicked while shutting down");
        }
    }
}

/// Awaits every registered tokio task. Call after [`broadcast_exit_signals`].
pub async fn wait_all_tasks() {
    let tasks = std::mem::take(&mut registry().lock().tasks);
    for (name, handle) in tasks {
        if handle.await.is_err() {
            warn!("task '{name}' panicked while shutting down");
        }
    }
}
