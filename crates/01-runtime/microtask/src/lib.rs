#![deny(missing_docs)]
//! Single-threaded continuation runtime shared by the stream engine.
//!
//! * [`TaskQueue`] – FIFO queue of continuations drained cooperatively by the
//!   owning context (no threads, no timers).
//! * [`Promise`] – settle-once result handle whose reactions are scheduled on
//!   the queue it was created with.

mod promise;
mod queue;

pub use promise::{Promise, PromiseState};
pub use queue::TaskQueue;
