//! I/O awaiters.
//!
//! An [`Op`] is a future over one kernel operation. Its first poll captures
//! the current task handle and registers a submit action to run once the
//! frame is quiescent; the listener later stores the completion result and
//! dispatches the handle back to the pool, so the second poll just decodes
//! the result slot. [`LinkTimeout`] wraps an `Op` and writes a chained
//! op+timeout pair, translating `-ECANCELED` on the primary into
//! [`IoError::Timeout`].

use std::future::Future;
use std::marker::{PhantomData, PhantomPinned};
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use corio_runtime::task::{current_task, set_after_suspend, AfterSuspend, TaskHandle};

use io_uring::opcode;
use io_uring::squeue::Flags;
use io_uring::types::Timespec;

use crate::ctx::{self, SqeSink};
use crate::error::{IoError, IoResult};
use crate::op::{build_entry, OpSpec};

const STATE_NEW: u8 = 0;
const STATE_SUBMITTED: u8 = 1;

// Distinguishes "submit raced with shutdown" from kernel results.
const KIND_OK: u8 = 0;
const KIND_CLOSED: u8 = 1;

/// Future over a single kernel operation. Lives pinned in the awaiting
/// task's frame for the whole submission-to-completion window.
pub struct Op<'a> {
    spec: OpSpec,
    ts: Timespec,
    result: AtomicI32,
    kind: AtomicU8,
    handle: Option<TaskHandle>,
    state: u8,
    _marker: PhantomData<&'a mut ()>,
    _pin: PhantomPinned,
}

// The raw pointers in the op parameters target buffers owned by (or
// borrowed into) the same task frame, which migrates between threads as a
// unit and is only polled by one thread at a time.
unsafe impl Send for Op<'_> {}
unsafe impl Send for LinkTimeout<'_> {}

impl<'a> Op<'a> {
    fn new(spec: OpSpec) -> Self {
        Self {
            spec,
            ts: Timespec::new(),
            result: AtomicI32::new(0),
            kind: AtomicU8::new(KIND_OK),
            handle: None,
            state: STATE_NEW,
            _marker: PhantomData,
            _pin: PhantomPinned,
        }
    }

    /// Wrap this op in a link-timeout: if `timeout` elapses first the kernel
    /// cancels the op and the await resolves to [`IoError::Timeout`].
    pub fn link_timeout(self, timeout: Duration) -> LinkTimeout<'a> {
        LinkTimeout {
            op: Op {
                ts: timespec_from(timeout),
                ..self
            },
        }
    }

    fn decode(&self) -> IoResult {
        if self.kind.load(Ordering::Acquire) == KIND_CLOSED {
            return Err(IoError::CtxClosed);
        }
        let res = self.result.load(Ordering::Acquire);
        if res < 0 {
            Err(IoError::Sys(-res))
        } else {
            Ok(res)
        }
    }
}

fn timespec_from(duration: Duration) -> Timespec {
    Timespec::new()
        .sec(duration.as_secs())
        .nsec(duration.subsec_nanos())
}

unsafe fn submit_op(handle: TaskHandle, data: *mut ()) {
    let op = &mut *(data as *mut Op<'_>);
    op.handle = Some(handle);
    if !ctx::submit(data, prep_op) {
        // Shutdown raced us past the poll-time check; resume with the
        // closed error so the task is not stranded.
        op.kind.store(KIND_CLOSED, Ordering::Release);
        handle.resume();
    }
}

unsafe fn prep_op(helper: *mut (), sink: &mut SqeSink<'_>) -> u32 {
    let op = &mut *(helper as *mut Op<'_>);
    let data = sink.alloc_io_data(op.handle.expect("op submitted without handle"), &op.result);
    let entry = build_entry(&op.spec, &op.ts).user_data(data as u64);
    sink.push(entry);
    1
}

impl Future for Op<'_> {
    type Output = IoResult;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult> {
        let this = unsafe { self.get_unchecked_mut() };
        match this.state {
            STATE_NEW => {
                if !ctx::is_running() {
                    return Poll::Ready(Err(IoError::CtxClosed));
                }
                debug_assert!(current_task().is_some(), "awaited outside a task");
                this.state = STATE_SUBMITTED;
                set_after_suspend(AfterSuspend {
                    f: submit_op,
                    data: this as *mut Op<'_> as *mut (),
                });
                Poll::Pending
            }
            _ => Poll::Ready(this.decode()),
        }
    }
}

/// A chained `(op, timeout)` submission pair.
pub struct LinkTimeout<'a> {
    op: Op<'a>,
}

unsafe fn submit_link_timeout(handle: TaskHandle, data: *mut ()) {
    let lt = &mut *(data as *mut LinkTimeout<'_>);
    lt.op.handle = Some(handle);
    if !ctx::submit(data, prep_link_timeout) {
        lt.op.kind.store(KIND_CLOSED, Ordering::Release);
        handle.resume();
    }
}

unsafe fn prep_link_timeout(helper: *mut (), sink: &mut SqeSink<'_>) -> u32 {
    let lt = &mut *(helper as *mut LinkTimeout<'_>);
    let op = &mut lt.op;

    let io_data = sink.alloc_io_data(op.handle.expect("op submitted without handle"), &op.result);
    let entry = build_entry(&op.spec, &op.ts)
        .user_data(io_data as u64)
        .flags(Flags::IO_LINK);
    sink.push(entry);

    let timeout_data = sink.alloc_timeout_data(io_data);
    let timeout_entry = opcode::LinkTimeout::new(&op.ts)
        .build()
        .user_data(timeout_data as u64);
    sink.push(timeout_entry);
    2
}

impl Future for LinkTimeout<'_> {
    type Output = IoResult;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult> {
        let this = unsafe { self.get_unchecked_mut() };
        match this.op.state {
            STATE_NEW => {
                if !ctx::is_running() {
                    return Poll::Ready(Err(IoError::CtxClosed));
                }
                debug_assert!(current_task().is_some(), "awaited outside a task");
                this.op.state = STATE_SUBMITTED;
                set_after_suspend(AfterSuspend {
                    f: submit_link_timeout,
                    data: this as *mut LinkTimeout<'_> as *mut (),
                });
                Poll::Pending
            }
            _ => match this.op.decode() {
                Err(IoError::Sys(errno)) if errno == libc::ECANCELED => {
                    Poll::Ready(Err(IoError::Timeout))
                }
                other => Poll::Ready(other),
            },
        }
    }
}

// ── Awaiter constructors ──

pub fn read(fd: RawFd, buf: &mut [u8]) -> Op<'_> {
    Op::new(OpSpec::Read {
        fd,
        buf: buf.as_mut_ptr(),
        len: buf.len() as u32,
        offset: 0,
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> Op<'_> {
    Op::new(OpSpec::Write {
        fd,
        buf: buf.as_ptr(),
        len: buf.len() as u32,
        offset: 0,
    })
}

pub fn writev(fd: RawFd, iov: &[libc::iovec]) -> Op<'_> {
    Op::new(OpSpec::Writev {
        fd,
        iov: iov.as_ptr(),
        nr: iov.len() as u32,
        offset: 0,
    })
}

pub fn accept<'a>(
    fd: RawFd,
    addr: &'a mut libc::sockaddr_in,
    addrlen: &'a mut libc::socklen_t,
) -> Op<'a> {
    *addrlen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    Op::new(OpSpec::Accept {
        fd,
        addr: (addr as *mut libc::sockaddr_in).cast(),
        addrlen,
        flags: 0,
    })
}

/// `read` against a registered-file index.
pub fn read_direct(index: u32, buf: &mut [u8]) -> Op<'_> {
    Op::new(OpSpec::ReadDirect {
        index,
        buf: buf.as_mut_ptr(),
        len: buf.len() as u32,
        offset: 0,
    })
}

/// `write` against a registered-file index.
pub fn write_direct(index: u32, buf: &[u8]) -> Op<'_> {
    Op::new(OpSpec::WriteDirect {
        index,
        buf: buf.as_ptr(),
        len: buf.len() as u32,
        offset: 0,
    })
}

pub fn writev_direct(index: u32, iov: &[libc::iovec]) -> Op<'_> {
    Op::new(OpSpec::WritevDirect {
        index,
        iov: iov.as_ptr(),
        nr: iov.len() as u32,
        offset: 0,
    })
}

/// Accept into a kernel-allocated registered-file slot.
pub fn accept_direct<'a>(
    fd: RawFd,
    addr: &'a mut libc::sockaddr_in,
    addrlen: &'a mut libc::socklen_t,
) -> Op<'a> {
    *addrlen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    Op::new(OpSpec::AcceptDirect {
        fd,
        addr: (addr as *mut libc::sockaddr_in).cast(),
        addrlen,
        flags: 0,
    })
}

pub fn close_direct(index: u32) -> Op<'static> {
    Op::new(OpSpec::CloseDirect { index })
}

/// Cancel every in-flight op referencing `fd`.
pub fn cancel_fd(fd: RawFd) -> Op<'static> {
    Op::new(OpSpec::CancelFd { fd })
}

/// Standalone timer; resolves to `Err(Sys(ETIME))` when it fires.
pub fn timeout(duration: Duration) -> Op<'static> {
    let mut op = Op::new(OpSpec::Timeout);
    op.ts = timespec_from(duration);
    op
}
