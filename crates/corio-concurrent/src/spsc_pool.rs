//! Single-producer/single-consumer object pool.
//!
//! A slab of aligned cells plus a ring of pointers to the free ones. One
//! thread allocates (the I/O submitter), a different thread frees (the
//! listener); the head/tail counters make that hand-off safe without locks.
//! Exactly one of {cell is live, cell is on the free ring} holds for every
//! cell at any moment — allocation nulls the ring slot so a double-free or a
//! leak shows up instead of silently corrupting the slab.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::CacheLine;

struct PoolCell<T> {
    storage: UnsafeCell<MaybeUninit<T>>,
}

pub struct SpscPool<T> {
    storage: Box<[PoolCell<T>]>,
    free_ring: Box<[AtomicPtr<T>]>,
    capacity: usize,
    // Deallocation side.
    head: CacheLine<AtomicUsize>,
    // Allocation side.
    tail: CacheLine<AtomicUsize>,
}

unsafe impl<T: Send> Send for SpscPool<T> {}
unsafe impl<T: Send> Sync for SpscPool<T> {}

impl<T> SpscPool<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        let storage: Box<[PoolCell<T>]> = (0..capacity)
            .map(|_| PoolCell {
                storage: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        let free_ring: Box<[AtomicPtr<T>]> = storage
            .iter()
            .map(|cell| AtomicPtr::new(cell.storage.get().cast::<T>()))
            .collect();
        Self {
            storage,
            free_ring,
            capacity,
            head: CacheLine(AtomicUsize::new(capacity)),
            tail: CacheLine(AtomicUsize::new(0)),
        }
    }

    /// Number of cells currently on the free ring.
    pub fn available(&self) -> usize {
        self.head
            .0
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail.0.load(Ordering::Acquire))
    }

    /// Take a free cell and move `value` into it. Hands the value back when
    /// the pool is exhausted.
    ///
    /// # Safety
    ///
    /// Only one thread may allocate at a time (the pool's producer role).
    pub unsafe fn allocate(&self, value: T) -> Result<*mut T, T> {
        let idx = self.tail.0.load(Ordering::Acquire);
        if idx >= self.head.0.load(Ordering::Acquire) {
            return Err(value); // no free cell
        }
        let slot = &self.free_ring[idx % self.capacity];
        let cell = slot.load(Ordering::Acquire);
        cell.write(value);
        // Null the slot so leaks and double-frees are observable.
        slot.store(ptr::null_mut(), Ordering::Release);
        self.tail.0.fetch_add(1, Ordering::Release);
        Ok(cell)
    }

    /// Drop the value in `obj` and return its cell to the free ring.
    ///
    /// # Safety
    ///
    /// `obj` must have come from `allocate` on this pool and not have been
    /// freed since; only one thread may deallocate (the consumer role).
    pub unsafe fn deallocate(&self, obj: *mut T) {
        ptr::drop_in_place(obj);
        let head = self.head.0.load(Ordering::Acquire);
        self.free_ring[head % self.capacity].store(obj, Ordering::Release);
        self.head.0.fetch_add(1, Ordering::Release);
    }
}

impl<T> Drop for SpscPool<T> {
    fn drop(&mut self) {
        for (index, slot) in self.free_ring.iter().enumerate() {
            if slot.load(Ordering::Acquire).is_null() {
                log::error!(
                    "object pool leak: cell {} was allocated but never deallocated",
                    index
                );
            }
        }
        // Leaked cells are not dropped; the leak report is the contract.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_deallocate_roundtrip() {
        let pool: SpscPool<u64> = SpscPool::new(4);
        unsafe {
            let p = pool.allocate(42).unwrap();
            assert_eq!(*p, 42);
            assert_eq!(pool.available(), 3);
            pool.deallocate(p);
            assert_eq!(pool.available(), 4);
        }
    }

    #[test]
    fn test_exhaustion_hands_value_back() {
        let pool: SpscPool<u32> = SpscPool::new(2);
        unsafe {
            let a = pool.allocate(1).unwrap();
            let b = pool.allocate(2).unwrap();
            assert_eq!(pool.allocate(3), Err(3));
            pool.deallocate(a);
            assert!(pool.allocate(4).is_ok());
            pool.deallocate(b);
        }
    }

    #[test]
    fn test_freed_cell_is_reused() {
        let pool: SpscPool<u32> = SpscPool::new(1);
        unsafe {
            let p = pool.allocate(7).unwrap();
            pool.deallocate(p);
            let q = pool.allocate(8).unwrap();
            assert_eq!(p, q, "the freed cell should come back");
            pool.deallocate(q);
        }
    }

    #[test]
    fn test_cross_thread_handoff() {
        use std::sync::mpsc;
        use std::sync::Arc;

        let pool: Arc<SpscPool<u64>> = Arc::new(SpscPool::new(8));
        let (tx, rx) = mpsc::channel::<usize>();
        let total = 1000u64;

        let consumer = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for _ in 0..total {
                    let addr = rx.recv().unwrap();
                    unsafe { pool.deallocate(addr as *mut u64) };
                }
            })
        };

        for i in 0..total {
            let mut value = i;
            loop {
                match unsafe { pool.allocate(value) } {
                    Ok(p) => {
                        tx.send(p as usize).unwrap();
                        break;
                    }
                    Err(back) => {
                        value = back;
                        std::thread::yield_now();
                    }
                }
            }
        }
        consumer.join().unwrap();
        assert_eq!(pool.available(), 8);
    }
}
