//! # corio-concurrent — lock-free containers for the corio runtime
//!
//! Everything in this crate is built from atomics and raw storage; nothing
//! here blocks except the hazard managers' global retired lists, which take a
//! mutex only on thread exit and during scans.
//!
//! - [`HazardManager`] / [`MpscHazardManager`] — safe deferred reclamation
//!   of nodes that readers may still hold by raw pointer.
//! - [`MpmcQueue`] — unbounded multi-producer/multi-consumer chunked FIFO.
//! - [`mpsc_queue`](mpsc_queue::mpsc_queue) — its unbounded
//!   multi-producer/single-consumer sibling, split into sender/receiver
//!   halves.
//! - [`RingBuffer`] — bounded multi-producer ring, used as the ready queue.
//! - [`SpscPool`] — single-producer/single-consumer object pool.

pub mod hazard;
pub mod mpmc_queue;
pub mod mpsc_hazard;
pub mod mpsc_queue;
pub mod ring_buffer;
pub mod spsc_pool;

pub use hazard::HazardManager;
pub use mpmc_queue::MpmcQueue;
pub use mpsc_hazard::MpscHazardManager;
pub use mpsc_queue::{MpscReceiver, MpscSender};
pub use ring_buffer::RingBuffer;
pub use spsc_pool::SpscPool;

/// Type-erased retired pointer: the address plus the deleter to run once no
/// hazard slot references it.
pub(crate) struct RetiredPtr {
    pub(crate) ptr: *mut u8,
    pub(crate) deleter: unsafe fn(*mut u8),
}

// Retired entries travel from per-thread lists into the global list.
unsafe impl Send for RetiredPtr {}

/// Deleter for pointers that came out of `Box::into_raw`.
pub(crate) unsafe fn drop_boxed<T>(ptr: *mut u8) {
    drop(Box::from_raw(ptr.cast::<T>()));
}

/// Pads the wrapped value to its own cache line so that hot counters on
/// opposite sides of a queue do not false-share.
#[repr(align(64))]
pub(crate) struct CacheLine<T>(pub(crate) T);

