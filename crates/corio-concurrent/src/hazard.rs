//! Hazard-pointer reclamation manager.
//!
//! A thread publishes the pointer it is about to dereference into one of its
//! hazard slots; a retiring thread only deletes a node once no active record
//! holds its address. Records live in a fixed array inside a shared recorder;
//! a thread claims one on first contact with a manager and releases it when
//! the thread exits.
//!
//! Retired pointers collect on a per-thread list and are scanned once the
//! list grows past [`RETIRE_THRESHOLD`]. Whatever survives a thread's exit is
//! spliced into the recorder's global list, which is scanned under its mutex.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use crate::{drop_boxed, RetiredPtr};

/// Hazard slots per record.
pub const MAX_HAZARDS: usize = 3;
/// Records per manager; claiming the 65th thread is fatal.
pub const MAX_THREADS: usize = 64;
/// Per-thread retired list length that triggers a scan.
pub const RETIRE_THRESHOLD: usize = 16;

#[repr(align(64))]
pub(crate) struct HazardRecord {
    slots: [AtomicPtr<u8>; MAX_HAZARDS],
    active: AtomicBool,
}

impl HazardRecord {
    const fn new() -> Self {
        const EMPTY: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());
        Self {
            slots: [EMPTY; MAX_HAZARDS],
            active: AtomicBool::new(false),
        }
    }
}

pub(crate) struct Recorder {
    records: [HazardRecord; MAX_THREADS],
    global_retired: Mutex<Vec<RetiredPtr>>,
}

unsafe impl Send for Recorder {}
unsafe impl Sync for Recorder {}

impl Recorder {
    fn new() -> Self {
        Self {
            records: [const { HazardRecord::new() }; MAX_THREADS],
            global_retired: Mutex::new(Vec::new()),
        }
    }

    fn allocate_record(&self) -> Option<&HazardRecord> {
        self.records.iter().find(|record| {
            record
                .active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        })
    }

    fn deallocate_record(&self, record: &HazardRecord) {
        record.active.store(false, Ordering::Release);
    }

    /// Delete every retired pointer whose address appears in no active
    /// record's hazard slots; keep the rest.
    fn scan_retired(&self, retired: &mut Vec<RetiredPtr>) {
        retired.retain(|rp| {
            let in_use = self
                .records
                .iter()
                .filter(|rec| rec.active.load(Ordering::Acquire))
                .flat_map(|rec| rec.slots.iter())
                .any(|slot| slot.load(Ordering::Acquire) == rp.ptr);
            if in_use {
                return true;
            }
            unsafe { (rp.deleter)(rp.ptr) };
            false
        });
    }

    /// Splice a dying thread's leftovers into the global list and scan it if
    /// it has grown past the threshold.
    fn collect_unretired(&self, leftovers: Vec<RetiredPtr>) {
        let mut global = self.global_retired.lock().unwrap();
        global.extend(leftovers);
        if global.len() > RETIRE_THRESHOLD {
            let mut list = std::mem::take(&mut *global);
            self.scan_retired(&mut list);
            *global = list;
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let mut global = std::mem::take(self.global_retired.get_mut().unwrap());
        // No new protections can appear here: the recorder only drops once
        // every thread-local reference to it is gone.
        let remaining = {
            self.scan_retired(&mut global);
            global.len()
        };
        if remaining > 0 {
            log::error!(
                "hazard manager still has {} retired pointers after destruction",
                remaining
            );
            for (index, record) in self.records.iter().enumerate() {
                if record.active.load(Ordering::Acquire) {
                    log::error!("hazard record {} is still active", index);
                }
            }
            std::process::abort();
        }
    }
}

struct TlsEntry {
    recorder: Arc<Recorder>,
    // Points into `recorder.records`; `recorder` keeps it alive.
    record: *const HazardRecord,
    retired: Vec<RetiredPtr>,
}

impl Drop for TlsEntry {
    fn drop(&mut self) {
        let record = unsafe { &*self.record };
        self.recorder.scan_retired(&mut self.retired);
        if !self.retired.is_empty() {
            self.recorder.collect_unretired(std::mem::take(&mut self.retired));
        }
        self.recorder.deallocate_record(record);
    }
}

thread_local! {
    // One entry per (thread, manager) pair, keyed by recorder address.
    static HP_TLS: RefCell<HashMap<usize, TlsEntry>> = RefCell::new(HashMap::new());
}

/// Shared-state hazard-pointer manager. Clone-free: structures embed one and
/// call it from every thread that touches them.
pub struct HazardManager {
    recorder: Arc<Recorder>,
}

impl HazardManager {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::new()),
        }
    }

    /// Publish that the calling thread intends to dereference `ptr`.
    #[inline]
    pub fn protect(&self, index: usize, ptr: *mut u8) {
        assert!(index < MAX_HAZARDS);
        self.with_tls(|entry| {
            let record = unsafe { &*entry.record };
            record.slots[index].store(ptr, Ordering::Release);
        });
    }

    /// Release one protection slot.
    #[inline]
    pub fn clear(&self, index: usize) {
        self.protect(index, ptr::null_mut());
    }

    /// Release every slot of the calling thread's record.
    pub fn clear_all(&self) {
        self.with_tls(|entry| {
            let record = unsafe { &*entry.record };
            for slot in &record.slots {
                slot.store(ptr::null_mut(), Ordering::Release);
            }
        });
    }

    /// Mark a `Box`-allocated node unreachable; it is freed once no hazard
    /// slot holds its address.
    pub fn retire<T>(&self, ptr: *mut T) {
        self.retire_with(ptr.cast(), drop_boxed::<T>);
    }

    /// `retire` with an explicit deleter.
    pub fn retire_with(&self, ptr: *mut u8, deleter: unsafe fn(*mut u8)) {
        self.with_tls(|entry| {
            entry.retired.push(RetiredPtr { ptr, deleter });
        });
        self.scan_tls_retired();
    }

    fn scan_tls_retired(&self) {
        // Scanning outside `with_tls` would re-borrow the TLS map from the
        // deleters; take the list out, scan, put the survivors back.
        let mut list = self.with_tls(|entry| {
            if entry.retired.len() > RETIRE_THRESHOLD {
                Some(std::mem::take(&mut entry.retired))
            } else {
                None
            }
        });
        if let Some(list) = list.as_mut() {
            self.recorder.scan_retired(list);
        }
        if let Some(list) = list {
            self.with_tls(|entry| {
                entry.retired.extend(list);
            });
        }
    }

    fn with_tls<R>(&self, f: impl FnOnce(&mut TlsEntry) -> R) -> R {
        let key = Arc::as_ptr(&self.recorder) as usize;
        HP_TLS.with(|map| {
            let mut map = map.borrow_mut();
            let entry = map.entry(key).or_insert_with(|| {
                let record = match self.recorder.allocate_record() {
                    Some(record) => record,
                    None => {
                        log::error!("hazard manager out of records ({} threads)", MAX_THREADS);
                        std::process::abort();
                    }
                };
                TlsEntry {
                    recorder: Arc::clone(&self.recorder),
                    record,
                    retired: Vec::new(),
                }
            });
            f(entry)
        })
    }
}

impl Default for HazardManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    static DELETED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn counting_deleter(ptr: *mut u8) {
        DELETED.fetch_add(1, Ordering::SeqCst);
        drop(Box::from_raw(ptr.cast::<u64>()));
    }

    #[test]
    fn test_retire_without_protection_frees() {
        let hm = HazardManager::new();
        let before = DELETED.load(Ordering::SeqCst);

        // Push past the threshold so a scan actually runs.
        for i in 0..(RETIRE_THRESHOLD + 2) {
            let p = Box::into_raw(Box::new(i as u64));
            hm.retire_with(p.cast(), counting_deleter);
        }

        assert!(DELETED.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn test_protected_pointer_survives_scan() {
        struct Tracked;
        static TRACKED_DROPS: AtomicUsize = AtomicUsize::new(0);
        impl Drop for Tracked {
            fn drop(&mut self) {
                TRACKED_DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hm = HazardManager::new();
        let p = Box::into_raw(Box::new(7u64));
        hm.protect(0, p.cast());

        // Retire `p` plus enough filler to force scans; `p` must survive
        // every one of them while the slot holds its address.
        hm.retire(p);
        for _ in 0..(RETIRE_THRESHOLD * 2) {
            hm.retire(Box::into_raw(Box::new(Tracked)));
        }
        // Filler got reclaimed, proving scans ran while `p` was pinned.
        assert!(TRACKED_DROPS.load(Ordering::SeqCst) > 0);
        assert_eq!(unsafe { *p }, 7);

        hm.clear(0);
        for _ in 0..(RETIRE_THRESHOLD * 2) {
            hm.retire(Box::into_raw(Box::new(Tracked)));
        }
    }

    #[test]
    fn test_cross_thread_protect_retire() {
        let hm = Arc::new(HazardManager::new());
        let barrier = Arc::new(Barrier::new(2));
        let p = Box::into_raw(Box::new(41u64));
        let addr = p as usize;

        let reader = {
            let hm = Arc::clone(&hm);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let p = addr as *mut u64;
                hm.protect(0, p.cast());
                barrier.wait();
                // The retiring thread is now free to retire; the value must
                // stay readable until we clear.
                for _ in 0..1000 {
                    assert_eq!(unsafe { *p }, 41);
                }
                hm.clear(0);
            })
        };

        barrier.wait();
        hm.retire(p);
        // Force scans from this thread; none may free `p` while the reader
        // holds it.
        for _ in 0..(RETIRE_THRESHOLD * 4) {
            hm.retire(Box::into_raw(Box::new(0u64)));
        }
        reader.join().unwrap();
    }
}
