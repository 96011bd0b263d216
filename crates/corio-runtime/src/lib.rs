//! # corio-runtime — cooperative tasks and the worker pool
//!
//! The runtime is deliberately not a general executor. A task suspends only
//! at the handful of await points the server uses (I/O awaiters, the
//! dispatch awaiter, a message wait) and is resumed exactly once per
//! suspension by whoever owns the wake-up: a pool worker, the I/O listener,
//! or a `SendableTask` driver. Wakers are noops; the resumption path carries
//! the [`task::TaskHandle`] directly.

pub mod pool;
pub mod semaphore;
pub mod sendable;
pub mod task;

pub use pool::dispatch_to_pool;
pub use semaphore::Semaphore;
pub use sendable::{MessageSource, SendableTask};
pub use task::{current_task, spawn, spawn_join, JoinTask, TaskHandle};
