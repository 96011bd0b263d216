//! # corio-uring — the io_uring side of the runtime
//!
//! Tasks await [`awaiter`] futures; the [`ctx`] module owns the ring, a
//! submitter thread that batches submission entries, and the listener loop
//! (run on the main thread) that reaps completions and dispatches the
//! suspended tasks back to the worker pool.
//!
//! Linux-only by design: the engine is the kernel ring.

pub mod awaiter;
pub mod ctx;
pub mod error;
pub mod fd;
pub mod op;

pub use ctx::{register_file_alloc_range, register_files, register_files_sparse, unregister_files};
pub use ctx::{request_stop, run};
pub use error::{IoError, IoResult};
pub use fd::Fd;
