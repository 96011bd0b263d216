//! Two-slot hazard manager for single-consumer queues.
//!
//! Differences from [`crate::HazardManager`]: two hazard slots per record, no
//! per-thread retired lists (only the queue's one consumer retires, so the
//! manager keeps a single shared list), and a much higher scan threshold.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use crate::{drop_boxed, RetiredPtr};

pub const MAX_HAZARDS: usize = 2;
pub const MAX_THREADS: usize = 64;
pub const RETIRE_THRESHOLD: usize = 64 * 16;

#[repr(align(64))]
struct HazardRecord {
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

struct Recorder {
    records: [HazardRecord; MAX_THREADS],
    retired: Mutex<Vec<RetiredPtr>>,
}

unsafe impl Send for Recorder {}
unsafe impl Sync for Recorder {}

impl Recorder {
    fn allocate_record(&self) -> Option<&HazardRecord> {
        self.records.iter().find(|record| {
            record
                .active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        })
    }

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
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let mut retired = std::mem::take(self.retired.get_mut().unwrap());
        self.scan_retired(&mut retired);
        if !retired.is_empty() {
            log::error!(
                "mpsc hazard manager still has {} retired pointers after destruction",
                retired.len()
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
    record: *const HazardRecord,
}

impl Drop for TlsEntry {
    fn drop(&mut self) {
        let record = unsafe { &*self.record };
        for slot in &record.slots {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
        record.active.store(false, Ordering::Release);
        // The shared retired list needs no splice; it was never per-thread.
        let _ = &self.recorder;
    }
}

thread_local! {
    static MPSC_HP_TLS: RefCell<HashMap<usize, TlsEntry>> = RefCell::new(HashMap::new());
}

/// Hazard manager embedded in [`crate::MpscQueue`].
pub struct MpscHazardManager {
    recorder: Arc<Recorder>,
}

impl MpscHazardManager {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder {
                records: [const { HazardRecord::new() }; MAX_THREADS],
                retired: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn protect(&self, index: usize, ptr: *mut u8) {
        assert!(index < MAX_HAZARDS);
        let record = self.local_record();
        unsafe { &*record }.slots[index].store(ptr, Ordering::Release);
    }

    #[inline]
    pub fn clear(&self, index: usize) {
        self.protect(index, ptr::null_mut());
    }

    pub fn clear_all(&self) {
        let record = unsafe { &*self.local_record() };
        for slot in &record.slots {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Retire a `Box`-allocated node. Called only by the queue's consumer;
    /// the shared list stays uncontended.
    pub fn retire<T>(&self, ptr: *mut T) {
        let mut retired = self.recorder.retired.lock().unwrap();
        retired.push(RetiredPtr {
            ptr: ptr.cast(),
            deleter: drop_boxed::<T>,
        });
        if retired.len() > RETIRE_THRESHOLD {
            let mut list = std::mem::take(&mut *retired);
            drop(retired);
            self.recorder.scan_retired(&mut list);
            *self.recorder.retired.lock().unwrap() = list;
        }
    }

    fn local_record(&self) -> *const HazardRecord {
        let key = Arc::as_ptr(&self.recorder) as usize;
        MPSC_HP_TLS.with(|map| {
            let mut map = map.borrow_mut();
            map.entry(key)
                .or_insert_with(|| {
                    let record = match self.recorder.allocate_record() {
                        Some(record) => record,
                        None => {
                            log::error!(
                                "mpsc hazard manager out of records ({} threads)",
                                MAX_THREADS
                            );
                            std::process::abort();
                        }
                    };
                    TlsEntry {
                        recorder: Arc::clone(&self.recorder),
                        record,
                    }
                })
                .record
        })
    }
}

impl Default for MpscHazardManager {
    fn default() -> Self {
        Self::new()
    }
}
