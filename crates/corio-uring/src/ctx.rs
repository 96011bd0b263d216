//! The I/O context: broker between task awaits and the kernel ring.
//!
//! One lazy instance per process. Awaiters enqueue [`SubmitRequest`]s into
//! an MPSC queue; the submitter thread drains it, writes submission entries
//! and flushes in batches of [`SUBMIT_THRESHOLD`] (or on a 25 ms lull). The
//! listener — whichever thread calls [`run`], normally main — blocks on the
//! completion side, stores each result into its awaiter's slot and
//! dispatches the suspended task to the worker pool.
//!
//! User-data records are allocated from an SPSC pool: only the submitter
//! (or, during shutdown drain, the listener that has taken over its role)
//! allocates, only the listener frees.

use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, Once, OnceLock};
use std::time::Duration;

use corio_concurrent::mpsc_queue::{mpsc_queue, MpscReceiver, MpscSender};
use corio_concurrent::SpscPool;
use corio_runtime::pool;
use corio_runtime::Semaphore;
use corio_runtime::TaskHandle;

use io_uring::types::{SubmitArgs, Timespec};
use io_uring::IoUring;

/// Submission entries accumulated before the submitter flushes the ring.
pub const SUBMIT_THRESHOLD: usize = 64;
/// The submitter's acquire timeout; bounds flush latency under low load.
pub const SUBMIT_FLUSH_TIMEOUT: Duration = Duration::from_millis(25);

const RING_ENTRIES: u32 = 128;
const USER_DATA_POOL_CAP: usize = 65536;

pub(crate) const TAG_IO: u8 = 0;
pub(crate) const TAG_TIMEOUT: u8 = 1;

/// Completion routing record, stamped into each submission entry's
/// user_data. The tag is atomic because the listener reads it concurrently
/// with the awaiting task resuming.
pub struct UserData {
    tag: AtomicU8,
    handle: Option<TaskHandle>,
    result: *const AtomicI32,
    linked: *const UserData,
}

// Records hop from the submitter to the kernel tag and back to the
// listener; each field is only touched by the role that owns it.
unsafe impl Send for UserData {}

impl UserData {
    pub(crate) fn new_io(handle: TaskHandle, result: *const AtomicI32) -> Self {
        Self {
            tag: AtomicU8::new(TAG_IO),
            handle: Some(handle),
            result,
            linked: ptr::null(),
        }
    }

    pub(crate) fn new_timeout(linked: *const UserData) -> Self {
        Self {
            tag: AtomicU8::new(TAG_TIMEOUT),
            handle: None,
            result: ptr::null(),
            linked,
        }
    }
}

/// `(helper pointer, prep function)` — the prep writes one or two
/// submission entries for the awaiter behind `helper` and returns how many.
pub struct SubmitRequest {
    pub helper: *mut (),
    pub prep: unsafe fn(*mut (), &mut SqeSink<'_>) -> u32,
}

unsafe impl Send for SubmitRequest {}

/// Handed to prep functions: pushes entries into the ring's submission
/// queue and allocates user-data records.
pub struct SqeSink<'a> {
    ctx: &'a Ctx,
}

impl SqeSink<'_> {
    /// Push one submission entry, flushing the ring first if the queue is
    /// full.
    pub fn push(&mut self, entry: io_uring::squeue::Entry) {
        unsafe {
            {
                let mut sq = self.ctx.ring.submission_shared();
                if sq.push(&entry).is_ok() {
                    return;
                }
            }
            if let Err(e) = self.ctx.ring.submit() {
                log::error!("io_uring submit failed: {}", e);
            }
            let mut sq = self.ctx.ring.submission_shared();
            if sq.push(&entry).is_err() {
                log::error!("submission queue still full after flush");
                std::process::abort();
            }
        }
    }

    /// Allocate the io-variant user-data, spinning until the pool has a
    /// free cell.
    pub fn alloc_io_data(&mut self, handle: TaskHandle, result: *const AtomicI32) -> *mut UserData {
        self.alloc(UserData::new_io(handle, result))
    }

    /// Allocate a timeout-variant user-data referencing `linked`.
    pub fn alloc_timeout_data(&mut self, linked: *const UserData) -> *mut UserData {
        self.alloc(UserData::new_timeout(linked))
    }

    fn alloc(&mut self, data: UserData) -> *mut UserData {
        let mut data = data;
        loop {
            // Safety: the submitter role is the pool's single allocator.
            match unsafe { self.ctx.user_data.allocate(data) } {
                Ok(ptr) => return ptr,
                Err(back) => {
                    data = back;
                    std::hint::spin_loop();
                }
            }
        }
    }
}

struct Ctx {
    ring: IoUring,
    requests: MpscSender<SubmitRequest, 64>,
    // Taken by the submitter thread; put back on its exit so the listener's
    // shutdown drain can finish the leftovers.
    requests_rx: Mutex<Option<MpscReceiver<SubmitRequest, 64>>>,
    sem: Semaphore,
    user_data: SpscPool<UserData>,
    pending: AtomicUsize,
    worker_running: AtomicBool,
    stop: AtomicBool,
}

// The ring is touched by submitter (submission queue) and listener
// (completion queue) only; they do not share a cursor.
unsafe impl Send for Ctx {}
unsafe impl Sync for Ctx {}

static CTX: OnceLock<Ctx> = OnceLock::new();
static SUBMITTER: Once = Once::new();

fn instance() -> &'static Ctx {
    let ctx = CTX.get_or_init(|| {
        let ring = match IoUring::builder().build(RING_ENTRIES) {
            Ok(ring) => ring,
            Err(e) => {
                log::error!("failed to initialize io_uring: {}", e);
                std::process::abort();
            }
        };
        let (tx, rx) = mpsc_queue::<SubmitRequest, 64>();
        Ctx {
            ring,
            requests: tx,
            requests_rx: Mutex::new(Some(rx)),
            sem: Semaphore::new(0),
            user_data: SpscPool::new(USER_DATA_POOL_CAP),
            pending: AtomicUsize::new(0),
            worker_running: AtomicBool::new(true),
            stop: AtomicBool::new(false),
        }
    });
    SUBMITTER.call_once(|| {
        std::thread::Builder::new()
            .name("corio-io-submitter".into())
            .spawn(|| submitter_loop(instance()))
            .expect("failed to spawn submitter thread");
    });
    ctx
}

/// Whether the context still accepts submissions.
pub fn is_running() -> bool {
    instance().worker_running.load(Ordering::Acquire)
}

/// Enqueue a submission request. Returns `false` once the context is
/// shutting down.
pub fn submit(helper: *mut (), prep: unsafe fn(*mut (), &mut SqeSink<'_>) -> u32) -> bool {
    let ctx = instance();
    if !ctx.worker_running.load(Ordering::Acquire) {
        return false;
    }
    ctx.requests.push_back(SubmitRequest { helper, prep });
    ctx.sem.release(1);
    true
}

/// Ask the submitter to stop; the listener drains afterwards.
pub fn request_stop() {
    instance().stop.store(true, Ordering::Release);
}

fn submitter_loop(ctx: &'static Ctx) {
    let mut rx = ctx
        .requests_rx
        .lock()
        .unwrap()
        .take()
        .expect("submitter started twice");

    let mut submit_count: usize = 0;
    while !ctx.stop.load(Ordering::Acquire) {
        if ctx.sem.try_acquire_for(SUBMIT_FLUSH_TIMEOUT) {
            if let Some(req) = rx.pop_front() {
                // Count before prep: an entry may reach the kernel early if
                // the submission queue fills mid-prep.
                ctx.pending.fetch_add(1, Ordering::AcqRel);
                let mut sink = SqeSink { ctx };
                submit_count += unsafe { (req.prep)(req.helper, &mut sink) } as usize;

                if submit_count >= SUBMIT_THRESHOLD {
                    flush(ctx, &mut submit_count);
                }
            }
        } else if submit_count > 0 {
            // Quiet period: push out the partial batch.
            flush(ctx, &mut submit_count);
        }
    }

    if submit_count > 0 {
        flush(ctx, &mut submit_count);
    }
    // Hand the consumer role back for the listener's shutdown drain.
    *ctx.requests_rx.lock().unwrap() = Some(rx);
    ctx.worker_running.store(false, Ordering::Release);
}

fn flush(ctx: &Ctx, submit_count: &mut usize) {
    match ctx.ring.submit() {
        Ok(n) => {
            log::debug!("submitted {} entries to io_uring", n);
            *submit_count = 0;
        }
        Err(e) => log::error!("io_uring submit failed: {}", e),
    }
}

/// Run the listener on the calling thread (normally main) until
/// [`request_stop`], then drain in-flight work and tear the ring down.
pub fn run() {
    let ctx = instance();
    listen(ctx);
    clean_up(ctx);
}

fn listen(ctx: &'static Ctx) {
    // Bounded wait so a stop request is noticed even on an idle ring.
    let ts = Timespec::new().sec(0).nsec(100_000_000);
    while !ctx.stop.load(Ordering::Acquire) {
        let args = SubmitArgs::new().timespec(&ts);
        match ctx.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => handle_cqes(ctx),
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => handle_cqes(ctx),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                log::debug!("completion wait interrupted, checking for stop");
            }
            Err(e) => {
                log::error!("completion wait failed: {}", e);
                break;
            }
        }
    }
}

fn handle_cqes(ctx: &'static Ctx) {
    let mut count = 0u32;
    let mut cq = unsafe { ctx.ring.completion_shared() };
    for cqe in &mut cq {
        count += 1;
        let data = cqe.user_data() as *mut UserData;
        let res = cqe.result();
        let tag = unsafe { (*data).tag.load(Ordering::Acquire) };
        match tag {
            TAG_IO => unsafe {
                let ud = &*data;
                (*ud.result).store(res, Ordering::Release);
                // The dispatch through the pool carries the release-acquire
                // pair to the resumed task.
                pool::dispatch(ud.handle.expect("io user data without handle"));
                ctx.pending.fetch_sub(1, Ordering::AcqRel);
            },
            TAG_TIMEOUT => match -res {
                libc::ETIME | libc::ECANCELED | libc::ENOENT => {}
                _ => {
                    let linked = unsafe { (*data).linked };
                    log::error!(
                        "link-timeout completion in unexpected state: res={} io={:p}",
                        res,
                        linked
                    );
                    std::process::abort();
                }
            },
            other => {
                log::error!("unknown user data tag {} in completion", other);
                std::process::abort();
            }
        }
        // Safety: the listener is the pool's single deallocator.
        unsafe { ctx.user_data.deallocate(data) };
    }
    drop(cq);
    if count > 0 {
        log::debug!("processed {} completed requests", count);
    }
}

fn clean_up(ctx: &'static Ctx) {
    while ctx.worker_running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    // The submitter is gone; adopt its consumer role and flush whatever is
    // still queued so those tasks observe real completions.
    let mut rx = ctx
        .requests_rx
        .lock()
        .unwrap()
        .take()
        .expect("submitter did not return the request queue");
    while ctx.sem.try_acquire_for(Duration::from_millis(5)) {
        if let Some(req) = rx.pop_front() {
            ctx.pending.fetch_add(1, Ordering::AcqRel);
            let mut sink = SqeSink { ctx };
            unsafe { (req.prep)(req.helper, &mut sink) };
        }
    }
    match ctx.ring.submit() {
        Ok(n) => log::debug!("submitted {} entries during shutdown", n),
        Err(e) => log::error!("io_uring submit failed during shutdown: {}", e),
    }

    let ts = Timespec::new().sec(1);
    while ctx.pending.load(Ordering::Relaxed) > 0 {
        log::info!(
            "waiting for {} pending requests to complete",
            ctx.pending.load(Ordering::Relaxed)
        );
        let args = SubmitArgs::new().timespec(&ts);
        match ctx.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => handle_cqes(ctx),
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => handle_cqes(ctx),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
            Err(e) => {
                log::error!("completion wait failed during shutdown: {}", e);
                break;
            }
        }
    }
}

// ── Registered-file pass-throughs ──

pub fn register_files(fds: &[RawFd]) -> std::io::Result<()> {
    instance().ring.submitter().register_files(fds)
}

pub fn register_files_sparse(count: u32) -> std::io::Result<()> {
    instance().ring.submitter().register_files_sparse(count)
}

pub fn register_file_alloc_range(off: u32, len: u32) -> std::io::Result<()> {
    instance().ring.submitter().register_file_alloc_range(off, len)
}

pub fn unregister_files() -> std::io::Result<()> {
    instance().ring.submitter().unregister_files()
}
