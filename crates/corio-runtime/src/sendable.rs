//! Message-bearing task.
//!
//! A `SendableTask` starts eagerly and runs until it awaits
//! [`MessageSource::recv`]; each [`SendableTask::send`] stores one message
//! and resumes the task inline on the sender's thread. The HTTP request
//! parser is the consumer of this shape: the connection handler feeds it
//! read buffers chunk by chunk.
//!
//! The task is driven only through `send` — it must not await pool or I/O
//! awaiters, which is what makes the inline resume correct.

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

struct MessageCell<M> {
    slot: UnsafeCell<Option<M>>,
}

// The cell is shared between the task object and the future inside it; both
// move between threads together and are polled by one thread at a time.
unsafe impl<M: Send> Send for MessageCell<M> {}
unsafe impl<M: Send> Sync for MessageCell<M> {}

/// The receiving end a `SendableTask`'s future awaits messages on.
pub struct MessageSource<M> {
    cell: Arc<MessageCell<M>>,
}

impl<M> MessageSource<M> {
    /// Await the next message sent into the task.
    pub fn recv(&self) -> Recv<'_, M> {
        Recv { source: self }
    }
}

pub struct Recv<'a, M> {
    source: &'a MessageSource<M>,
}

impl<M> Future for Recv<'_, M> {
    type Output = M;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<M> {
        match unsafe { (*self.source.cell.slot.get()).take() } {
            Some(msg) => Poll::Ready(msg),
            None => Poll::Pending,
        }
    }
}

pub struct SendableTask<M> {
    future: Pin<Box<dyn Future<Output = ()> + Send>>,
    cell: Arc<MessageCell<M>>,
    done: bool,
}

impl<M: Send + 'static> SendableTask<M> {
    /// Build and eagerly start the task; it runs until its first
    /// `recv().await`.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(MessageSource<M>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cell = Arc::new(MessageCell {
            slot: UnsafeCell::new(None),
        });
        let source = MessageSource {
            cell: Arc::clone(&cell),
        };
        let mut this = Self {
            future: Box::pin(f(source)),
            cell,
            done: false,
        };
        this.poll_once();
        this
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Deliver one message and resume the task until it waits again (or
    /// finishes). A message sent after completion is dropped.
    pub fn send(&mut self, msg: M) {
        if self.done {
            return;
        }
        unsafe { *self.cell.slot.get() = Some(msg) };
        self.poll_once();
    }

    fn poll_once(&mut self) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        if self.future.as_mut().poll(&mut cx).is_ready() {
            self.done = true;
        }
    }
}

fn noop_waker() -> std::task::Waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};
    const VTABLE: RawWakerVTable = RawWakerVTable::new(
        |_| RawWaker::new(std::ptr::null(), &VTABLE),
        |_| {},
        |_| {},
        |_| {},
    );
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_runs_eagerly_until_first_recv() {
        let progress = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&progress);
        let task = SendableTask::<u32>::new(move |source| async move {
            p.store(1, Ordering::SeqCst);
            let _ = source.recv().await;
            p.store(2, Ordering::SeqCst);
        });
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert!(!task.is_done());
    }

    #[test]
    fn test_send_resumes_with_message() {
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        let mut task = SendableTask::<u32>::new(move |source| async move {
            for _ in 0..3 {
                let msg = source.recv().await;
                sink.lock().unwrap().push(msg);
            }
        });

        task.send(10);
        task.send(20);
        assert!(!task.is_done());
        task.send(30);
        assert!(task.is_done());
        assert_eq!(&*got.lock().unwrap(), &[10, 20, 30]);

        // Messages after completion are ignored.
        task.send(40);
        assert_eq!(got.lock().unwrap().len(), 3);
    }
}
