//! Abstracts "spawn this onto the runtime" behind a trait so crates that
//! need to fire background work (the breaker's per-processor actor, the
//! health monitor's probe loop) don't depend on `tokio` directly. Only
//! [`frame-async-runtime`] implements it against a real runtime; tests can
//! implement it against an inline executor instead.

use std::future::Future;
use std::pin::Pin;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Spawn: Send + Sync {
    fn spawn(&self, future: BoxFuture);
}

/// Boxes `future` and hands it to `spawn`; convenience so call sites don't
/// have to write `Box::pin` at every call site.
pub fn spawn<S, F>(spawner: &S, future: F)
where
    S: Spawn + ?Sized,
    F: Future<Output = ()> + Send + 'static,
{
    spawner.spawn(Box::pin(future));
}
