//! Worker pool: N long-lived threads draining the ready queue.
//!
//! Each worker loops on acquire-semaphore → pop handle → resume. The
//! semaphore count mirrors the queue backlog, so `unsafe_pop_front` is sound
//! under a held permit. Handles are resumed in FIFO submission order.
//!
//! At shutdown the stop flag is raised and the semaphore released once per
//! worker; whatever handles remain queued are leaked deliberately — their
//! frames belong to in-flight I/O paths and the I/O context is responsible
//! for draining those first in an orderly stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;

use corio_concurrent::RingBuffer;

use crate::semaphore::Semaphore;
use crate::task::{set_after_suspend, AfterSuspend, TaskHandle};

const READY_QUEUE_CAP: usize = 16384;

struct Pool {
    ready: RingBuffer<TaskHandle, READY_QUEUE_CAP>,
    sem: Semaphore,
    stop: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

static POOL: OnceLock<Pool> = OnceLock::new();

fn instance() -> &'static Pool {
    POOL.get_or_init(|| Pool {
        ready: RingBuffer::new(),
        sem: Semaphore::new(0),
        stop: AtomicBool::new(false),
        workers: Mutex::new(Vec::new()),
        started: AtomicBool::new(false),
    })
}

/// Start `worker_count` worker threads. Returns `false` if the pool was
/// already started.
pub fn init(worker_count: usize) -> bool {
    let pool = instance();
    if pool.started.swap(true, Ordering::AcqRel) {
        return false;
    }
    let mut workers = pool.workers.lock().unwrap();
    for i in 0..worker_count {
        workers.push(
            std::thread::Builder::new()
                .name(format!("corio-worker-{}", i))
                .spawn(move || worker_loop(instance()))
                .expect("failed to spawn worker thread"),
        );
    }
    true
}

fn worker_loop(pool: &'static Pool) {
    loop {
        pool.sem.acquire();
        if pool.stop.load(Ordering::Acquire) {
            break;
        }
        // A held permit guarantees a matching push.
        let handle = unsafe { pool.ready.unsafe_pop_front() };
        handle.resume();
    }
}

/// Queue a suspended task for resumption on a worker.
///
/// Wait-free from the producer's side (one bounded CAS loop). On overload
/// the bounded ready queue rejects; the drop is logged rather than blocking
/// the submitter.
pub fn dispatch(handle: TaskHandle) {
    let pool = instance();
    if pool.ready.push_back(handle) {
        pool.sem.release(1);
    } else {
        log::error!("ready queue full, dropping task handle {:?}", handle);
    }
}

/// Signal stop and join every worker. Queued handles are leaked (see module
/// docs).
pub fn shutdown() {
    let pool = instance();
    pool.stop.store(true, Ordering::Release);
    let mut workers = pool.workers.lock().unwrap();
    pool.sem.release(workers.len());
    for worker in workers.drain(..) {
        let _ = worker.join();
    }
}

/// Awaiting this moves the enclosing task from its current thread onto the
/// worker pool. This is the runtime's only thread-transfer primitive.
pub fn dispatch_to_pool() -> DispatchAwaiter {
    DispatchAwaiter { dispatched: false }
}

pub struct DispatchAwaiter {
    dispatched: bool,
}

unsafe fn dispatch_after_suspend(handle: TaskHandle, _data: *mut ()) {
    dispatch(handle);
}

impl std::future::Future for DispatchAwaiter {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        if self.dispatched {
            return std::task::Poll::Ready(());
        }
        self.dispatched = true;
        set_after_suspend(AfterSuspend {
            f: dispatch_after_suspend,
            data: std::ptr::null_mut(),
        });
        std::task::Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::spawn_join;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    // One worker so resumption order is observable: FIFO through the ready
    // queue implies completion order matches dispatch order.
    fn init_single_worker() {
        init(1);
    }

    #[test]
    fn test_dispatch_moves_task_to_worker() {
        init_single_worker();
        let spawner = std::thread::current().id();
        let jt = spawn_join(async move {
            dispatch_to_pool().await;
            std::thread::current().id() != spawner
        });
        assert!(jt.get(), "task should resume on a pool worker");
    }

    #[test]
    fn test_fifo_resumption_order() {
        init_single_worker();
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for i in 0..16usize {
            let order = Arc::clone(&order);
            let counter = Arc::clone(&counter);
            joins.push(spawn_join(async move {
                dispatch_to_pool().await;
                order.lock().unwrap().push(i);
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for jt in joins {
            jt.get();
        }

        let order = order.lock().unwrap();
        // This test dispatches from one thread, so its own tasks must appear
        // in submission order even if other tests interleave.
        assert_eq!(&*order, &(0..16).collect::<Vec<_>>());
    }
}
