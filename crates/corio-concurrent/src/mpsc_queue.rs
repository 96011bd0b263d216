//! Unbounded MPSC FIFO — the single-consumer sibling of [`crate::MpmcQueue`].
//!
//! The push side is identical in shape to the MPMC queue (tail protected by
//! hazard slot 0, CAS slot reservation, losers free their speculative chunk)
//! but runs on the two-slot [`MpscHazardManager`]. The single consumer owns
//! the head pointer and each chunk's read index outright, so the pop path
//! needs no atomics beyond the status and write-index loads.
//!
//! Constructed as a channel pair: [`MpscSender`] is cheap to clone and share;
//! [`MpscReceiver`] is unique, which is what makes the plain-read pop sound.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::mpsc_hazard::MpscHazardManager;
use crate::CacheLine;

const EMPTY: u8 = 0;
const READY: u8 = 1;
const USED: u8 = 2;

struct Slot<T> {
    storage: UnsafeCell<MaybeUninit<T>>,
    status: AtomicU8,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            storage: UnsafeCell::new(MaybeUninit::uninit()),
            status: AtomicU8::new(EMPTY),
        }
    }
}

struct Chunk<T, const N: usize> {
    slots: [Slot<T>; N],
    // Owned by the single consumer.
    read_index: UnsafeCell<usize>,
    write_index: AtomicUsize,
    next: AtomicPtr<Chunk<T, N>>,
}

impl<T, const N: usize> Chunk<T, N> {
    fn new() -> Self {
        Self {
            slots: [const { Slot::new() }; N],
            read_index: UnsafeCell::new(0),
            write_index: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn try_push(&self, value: T) -> Result<(), T> {
        loop {
            let write_idx = self.write_index.load(Ordering::Acquire);
            if write_idx == N {
                return Err(value);
            }
            if self
                .write_index
                .compare_exchange(write_idx, write_idx + 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                let slot = &self.slots[write_idx];
                unsafe { (*slot.storage.get()).write(value) };
                slot.status.store(READY, Ordering::Release);
                return Ok(());
            }
        }
    }

    /// Pop from the consumer side. Caller must be the unique consumer.
    unsafe fn try_pop(&self) -> Option<T> {
        let read_idx = *self.read_index.get();
        let write_idx = self.write_index.load(Ordering::Acquire);
        if read_idx >= write_idx {
            return None;
        }
        let slot = &self.slots[read_idx];
        while slot.status.load(Ordering::Acquire) != READY {
            std::hint::spin_loop();
        }
        let value = (*slot.storage.get()).as_ptr().read();
        slot.status.store(USED, Ordering::Release);
        *self.read_index.get() = read_idx + 1;
        Some(value)
    }
}

impl<T, const N: usize> Drop for Chunk<T, N> {
    fn drop(&mut self) {
        let read_idx = unsafe { *self.read_index.get() };
        let write_idx = self.write_index.load(Ordering::Acquire);
        for slot in &self.slots[read_idx..write_idx] {
            while slot.status.load(Ordering::Acquire) != READY {
                std::thread::yield_now();
            }
            unsafe { (*slot.storage.get()).assume_init_drop() };
        }
    }
}

struct Inner<T, const N: usize> {
    // Consumer-owned; shared here only so the final Drop can walk the list.
    head: UnsafeCell<*mut Chunk<T, N>>,
    tail: CacheLine<AtomicPtr<Chunk<T, N>>>,
    hp: MpscHazardManager,
}

unsafe impl<T: Send, const N: usize> Send for Inner<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Inner<T, N> {}

impl<T, const N: usize> Drop for Inner<T, N> {
    fn drop(&mut self) {
        let mut current = unsafe { *self.head.get() };
        while !current.is_null() {
            let next = unsafe { (*current).next.load(Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(current) });
            current = next;
        }
    }
}

/// Build an unbounded MPSC queue. Senders clone freely; the receiver is the
/// unique consumer.
pub fn mpsc_queue<T, const N: usize>() -> (MpscSender<T, N>, MpscReceiver<T, N>) {
    let dummy = Box::into_raw(Box::new(Chunk::new()));
    let inner = Arc::new(Inner {
        head: UnsafeCell::new(dummy),
        tail: CacheLine(AtomicPtr::new(dummy)),
        hp: MpscHazardManager::new(),
    });
    (
        MpscSender {
            inner: Arc::clone(&inner),
        },
        MpscReceiver {
            inner,
            _not_sync: PhantomData,
        },
    )
}

pub struct MpscSender<T, const N: usize = 64> {
    inner: Arc<Inner<T, N>>,
}

impl<T, const N: usize> Clone for MpscSender<T, N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

const HAZ_TAIL: usize = 0;

impl<T: Send, const N: usize> MpscSender<T, N> {
    pub fn push_back(&self, value: T) {
        let inner = &*self.inner;
        let mut value = value;
        loop {
            let old_tail = inner.tail.0.load(Ordering::Acquire);
            inner.hp.protect(HAZ_TAIL, old_tail.cast());
            if old_tail != inner.tail.0.load(Ordering::Acquire) {
                continue;
            }
            let tail_ref = unsafe { &*old_tail };
            match tail_ref.try_push(value) {
                Ok(()) => {
                    inner.hp.clear(HAZ_TAIL);
                    return;
                }
                Err(v) => value = v,
            }

            let next = tail_ref.next.load(Ordering::Acquire);
            if next.is_null() {
                let new_chunk = Box::into_raw(Box::new(Chunk::new()));
                match tail_ref.next.compare_exchange(
                    ptr::null_mut(),
                    new_chunk,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let _ = inner.tail.0.compare_exchange(
                            old_tail,
                            new_chunk,
                            Ordering::Release,
                            Ordering::Relaxed,
                        );
                        inner.hp.clear(HAZ_TAIL);
                        continue;
                    }
                    Err(linked) => {
                        drop(unsafe { Box::from_raw(new_chunk) });
                        let _ = inner.tail.0.compare_exchange(
                            old_tail,
                            linked,
                            Ordering::Release,
                            Ordering::Relaxed,
                        );
                        inner.hp.clear(HAZ_TAIL);
                        continue;
                    }
                }
            }
            let _ = inner
                .tail
                .0
                .compare_exchange(old_tail, next, Ordering::Release, Ordering::Relaxed);
            inner.hp.clear(HAZ_TAIL);
        }
    }
}

pub struct MpscReceiver<T, const N: usize = 64> {
    inner: Arc<Inner<T, N>>,
    // Keeps the receiver off other threads' shared references.
    _not_sync: PhantomData<*mut ()>,
}

unsafe impl<T: Send, const N: usize> Send for MpscReceiver<T, N> {}

impl<T: Send, const N: usize> MpscReceiver<T, N> {
    pub fn pop_front(&mut self) -> Option<T> {
        let inner = &*self.inner;
        loop {
            let head = unsafe { *inner.head.get() };
            let head_ref = unsafe { &*head };
            if let Some(value) = unsafe { head_ref.try_pop() } {
                return Some(value);
            }

            let next = head_ref.next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }

            let tail_now = inner.tail.0.load(Ordering::Acquire);
            if tail_now == head {
                let _ = inner
                    .tail
                    .0
                    .compare_exchange(tail_now, next, Ordering::Release, Ordering::Relaxed);
            }

            unsafe { *inner.head.get() = next };
            inner.hp.retire(head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_push_pop_order() {
        let (tx, mut rx) = mpsc_queue::<u32, 8>();
        for i in 0..40 {
            tx.push_back(i);
        }
        for i in 0..40 {
            assert_eq!(rx.pop_front(), Some(i));
        }
        assert_eq!(rx.pop_front(), None);
    }

    #[test]
    fn test_multi_producer_drain() {
        let (tx, mut rx) = mpsc_queue::<u64, 16>();
        let n_threads = 4u64;
        let n_per_thread = 500u64;

        let mut handles = vec![];
        for t in 0..n_threads {
            let tx = tx.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..n_per_thread {
                    tx.push_back(t * 10_000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = HashSet::new();
        let mut last_per_producer = vec![None::<u64>; n_threads as usize];
        while let Some(v) = rx.pop_front() {
            assert!(seen.insert(v), "duplicate value {}", v);
            let producer = (v / 10_000) as usize;
            let seq = v % 10_000;
            if let Some(prev) = last_per_producer[producer] {
                assert!(seq > prev);
            }
            last_per_producer[producer] = Some(seq);
        }
        assert_eq!(seen.len() as u64, n_threads * n_per_thread);
    }

    #[test]
    fn test_concurrent_pop_while_pushing() {
        let (tx, mut rx) = mpsc_queue::<u64, 16>();
        let total = 2000u64;

        let producer = std::thread::spawn(move || {
            for i in 0..total {
                tx.push_back(i);
            }
        });

        let mut got = Vec::new();
        while (got.len() as u64) < total {
            if let Some(v) = rx.pop_front() {
                got.push(v);
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(got, (0..total).collect::<Vec<_>>());
    }
}
