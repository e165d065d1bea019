//! Owns the orchestrator's tokio runtime.
//!
//! `main` builds one [`tokio::runtime::Runtime`] and keeps it alive for the
//! life of the process; every component that needs to spawn a task gets a
//! cloneable [`Handle`] instead of the runtime itself, so nothing but `main`
//! can shut it down.

use std::future::Future;

use frame_logger::info;
use frame_spawn::{BoxFuture, Spawn};

/// Cheap to clone; wraps `tokio::runtime::Handle`, which is itself a
/// reference-counted handle to the runtime's scheduler.
#[derive(Clone)]
pub struct Handle {
    inner: tokio::runtime::Handle,
}

impl Handle {
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.spawn(future)
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.inner.block_on(future)
    }

    pub fn inner(&self) -> &tokio::runtime::Handle {
        &self.inner
    }
}

impl Spawn for Handle {
    fn spawn(&self, future: BoxFuture) {
        self.inner.spawn(future);
    }
}

/// Builds a multi-threaded runtime named `frame-orchestrator` and returns a
/// [`Handle`] to it alongside the runtime itself. The caller (`main`) must
/// keep the `tokio::runtime::Runtime` alive for as long as the handle is
/// used; dropping it stops the scheduler.
pub fn new_runtime(worker_threads: Option<usize>) -> (Handle, tokio::runtime::Runtime) {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.thread_name("frame-orchestrator").enable_all();
    if let Some(n) = worker_threads {
        builder.worker_threads(n);
    }
    let runtime = builder.build().expect("failed to build the tokio runtime");
    let handle = Handle {
        inner: runtime.handle().clone(),
    };
    info!("async runtime started");
    (handle, runtime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_runs_a_future_to_completion() {
        let (handle, _runtime) = new_runtime(Some(1));
        let result = handle.block_on(async { 1 + 1 });
        assert_eq!(result, 2);
    }

    #[test]
    fn spawn_executes_on_the_runtime() {
        let (handle, _runtime) = new_runtime(Some(1));
        let (tx, rx) = std::sync::mpsc::channel();
        handle.spawn(async move {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap(), 42);
    }
}
