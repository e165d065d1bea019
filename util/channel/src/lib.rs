//! Reexports `crossbeam_channel` so every crate in the workspace pins the
//! same version without naming it directly. Used where a synchronous,
//! select!-capable channel is a better fit than a tokio channel: the stop
//! handler's exit signal, and any blocking (non-async) worker thread.

pub use crossbeam_channel::{
    bounded, select, unbounded, Receiver, RecvError, RecvTimeoutError, SendError, Sender,
    TryRecvError,
};
