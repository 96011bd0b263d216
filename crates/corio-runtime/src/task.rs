//! Task frames, handles and the suspension protocol.
//!
//! A spawned future lives in a heap frame headed by its resume function; a
//! [`TaskHandle`] is an opaque pointer to that header. `resume` polls the
//! future once. The frame is freed when the future returns `Ready`.
//!
//! Hand-off protocol: an awaiter must not give the task's handle to another
//! thread *during* `poll` — the other thread could resume the frame while
//! the current poll is still unwinding. Instead the awaiter registers an
//! [`AfterSuspend`] action; the resume loop runs it after the poll has
//! returned `Pending`, when the frame is quiescent again. The worker pool's
//! dispatch and the I/O context's submit both go through this hook.

use std::cell::Cell;
use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

#[repr(C)]
struct Header {
    resume: unsafe fn(NonNull<Header>),
}

#[repr(C)]
struct Frame<F: Future<Output = ()>> {
    header: Header,
    future: F,
}

/// Opaque handle to a suspended task. The core never inspects the frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaskHandle(NonNull<Header>);

// Handles travel from the suspending thread to whichever thread resumes the
// task; the frame itself is only ever touched by one thread at a time.
unsafe impl Send for TaskHandle {}

impl TaskHandle {
    /// Resume the task: poll its future once, run any registered
    /// after-suspend action, free the frame on completion.
    pub fn resume(self) {
        unsafe { ((*self.0.as_ptr()).resume)(self.0) }
    }
}

/// Action an awaiter schedules to run once the frame is quiescent.
pub struct AfterSuspend {
    pub f: unsafe fn(TaskHandle, *mut ()),
    pub data: *mut (),
}

thread_local! {
    static CURRENT_TASK: Cell<Option<TaskHandle>> = const { Cell::new(None) };
    static AFTER_SUSPEND: Cell<Option<AfterSuspend>> = const { Cell::new(None) };
}

/// The handle of the task currently being resumed on this thread, if any.
pub fn current_task() -> Option<TaskHandle> {
    CURRENT_TASK.with(|cell| cell.get())
}

/// Register the action to run after the current poll returns `Pending`.
/// Awaiters call this at their suspension point.
pub fn set_after_suspend(action: AfterSuspend) {
    AFTER_SUSPEND.with(|cell| cell.set(Some(action)));
}

const NOOP_VTABLE: RawWakerVTable = RawWakerVTable::new(
    |_| RawWaker::new(std::ptr::null(), &NOOP_VTABLE),
    |_| {},
    |_| {},
    |_| {},
);

fn noop_waker() -> Waker {
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &NOOP_VTABLE)) }
}

unsafe fn resume_frame<F: Future<Output = ()>>(ptr: NonNull<Header>) {
    let frame = ptr.as_ptr().cast::<Frame<F>>();
    let handle = TaskHandle(ptr);

    let previous = CURRENT_TASK.with(|cell| cell.replace(Some(handle)));
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let future = Pin::new_unchecked(&mut (*frame).future);
    let done = future.poll(&mut cx).is_ready();
    CURRENT_TASK.with(|cell| cell.set(previous));

    if done {
        debug_assert!(AFTER_SUSPEND.with(|cell| cell.take()).is_none());
        drop(Box::from_raw(frame));
        return;
    }
    // Past this point another thread may resume (and even free) the frame,
    // so the action must be the last thing touching it.
    if let Some(action) = AFTER_SUSPEND.with(|cell| cell.take()) {
        (action.f)(handle, action.data);
    }
}

/// Spawn a detached task. It begins eagerly on the calling thread and its
/// frame is destroyed when the future completes.
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let frame = Box::new(Frame {
        header: Header {
            resume: resume_frame::<F>,
        },
        future,
    });
    let raw = Box::into_raw(frame);
    let handle = TaskHandle(unsafe { NonNull::new_unchecked(raw.cast::<Header>()) });
    handle.resume();
}

struct JoinCell<T> {
    done: AtomicBool,
    value: UnsafeCell<Option<T>>,
}

unsafe impl<T: Send> Send for JoinCell<T> {}
unsafe impl<T: Send> Sync for JoinCell<T> {}

/// Result-bearing task: starts eagerly like [`spawn`], but the spawner keeps
/// a handle it can block on.
pub fn spawn_join<T, F>(future: F) -> JoinTask<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let cell = Arc::new(JoinCell {
        done: AtomicBool::new(false),
        value: UnsafeCell::new(None),
    });
    let completion = Arc::clone(&cell);
    spawn(async move {
        let value = future.await;
        unsafe { *completion.value.get() = Some(value) };
        completion.done.store(true, Ordering::Release);
    });
    JoinTask { cell }
}

pub struct JoinTask<T> {
    cell: Arc<JoinCell<T>>,
}

impl<T> JoinTask<T> {
    pub fn is_done(&self) -> bool {
        self.cell.done.load(Ordering::Acquire)
    }

    /// Spin-yield until the task completes and take its result.
    pub fn get(self) -> T {
        while !self.cell.done.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        unsafe { (*self.cell.value.get()).take().expect("join value taken twice") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_spawn_runs_eagerly() {
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        spawn(async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        // No suspension points: the task completed during spawn.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_join_returns_value() {
        let jt = spawn_join(async { 21 * 2 });
        assert_eq!(jt.get(), 42);
    }

    #[test]
    fn test_nested_await_is_symmetric() {
        // The inner future completes on the caller's poll stack; no pool or
        // queue is involved.
        async fn inner() -> u32 {
            7
        }
        let jt = spawn_join(async { inner().await + 1 });
        assert!(jt.is_done());
        assert_eq!(jt.get(), 8);
    }

    #[test]
    fn test_current_task_visible_during_poll() {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        spawn(async move {
            flag.store(current_task().is_some(), Ordering::SeqCst);
        });
        assert!(seen.load(Ordering::SeqCst));
        assert!(current_task().is_none());
    }
}
