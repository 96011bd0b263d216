//! Unbounded MPMC FIFO built from linked fixed-size chunks.
//!
//! Producers reserve a slot in the tail chunk by CAS on its write index and
//! publish the value with a READY status store. When a chunk fills, the
//! producer that observed it allocates a fresh chunk and CAS-links it; losers
//! of that race free their speculative chunk and help advance the shared
//! tail. Consumers reserve via CAS on the chunk read index, spin for READY
//! (the producer may still be mid-write) and mark the slot USED. Exhausted
//! head chunks are retired through the hazard manager, so a consumer holding
//! a stale chunk pointer never reads freed memory.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::hazard::HazardManager;
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
    read_index: AtomicUsize,
    write_index: AtomicUsize,
    next: AtomicPtr<Chunk<T, N>>,
}

impl<T, const N: usize> Chunk<T, N> {
    fn new() -> Self {
        Self {
            slots: [const { Slot::new() }; N],
            read_index: AtomicUsize::new(0),
            write_index: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn try_push(&self, value: T) -> Result<(), T> {
        loop {
            let write_idx = self.write_index.load(Ordering::Acquire);
            if write_idx >= N {
                return Err(value); // chunk is full
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

    fn try_pop(&self) -> Option<T> {
        loop {
            let read_idx = self.read_index.load(Ordering::Acquire);
            let write_idx = self.write_index.load(Ordering::Acquire);
            if read_idx >= write_idx {
                return None; // no elements to pop
            }
            if self
                .read_index
                .compare_exchange(read_idx, read_idx + 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                let slot = &self.slots[read_idx];
                while slot.status.load(Ordering::Acquire) != READY {
                    std::hint::spin_loop(); // producer is still writing
                }
                let value = unsafe { (*slot.storage.get()).as_ptr().read() };
                slot.status.store(USED, Ordering::Release);
                return Some(value);
            }
        }
    }
}

impl<T, const N: usize> Drop for Chunk<T, N> {
    fn drop(&mut self) {
        let read_idx = self.read_index.load(Ordering::Acquire);
        let write_idx = self.write_index.load(Ordering::Acquire);
        for slot in &self.slots[read_idx..write_idx] {
            while slot.status.load(Ordering::Acquire) != READY {
                std::thread::yield_now();
            }
            unsafe { (*slot.storage.get()).assume_init_drop() };
        }
    }
}

/// Unbounded multi-producer/multi-consumer queue.
///
/// `pop_front` returns `None` on empty; no operation fails otherwise.
pub struct MpmcQueue<T, const N: usize = 64> {
    head: CacheLine<AtomicPtr<Chunk<T, N>>>,
    tail: CacheLine<AtomicPtr<Chunk<T, N>>>,
    hp: HazardManager,
}

unsafe impl<T: Send, const N: usize> Send for MpmcQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for MpmcQueue<T, N> {}

const HAZ_HEAD: usize = 0;
const HAZ_TAIL: usize = 0;
const HAZ_NEXT: usize = 1;

impl<T, const N: usize> MpmcQueue<T, N> {
    pub fn new() -> Self {
        let dummy = Box::into_raw(Box::new(Chunk::new()));
        Self {
            head: CacheLine(AtomicPtr::new(dummy)),
            tail: CacheLine(AtomicPtr::new(dummy)),
            hp: HazardManager::new(),
        }
    }

    pub fn push_back(&self, value: T) {
        let mut value = value;
        loop {
            let old_tail = self.tail.0.load(Ordering::Acquire);
            self.hp.protect(HAZ_TAIL, old_tail.cast());
            if old_tail != self.tail.0.load(Ordering::Acquire) {
                continue; // tail moved under us, retry
            }
            let tail_ref = unsafe { &*old_tail };
            match tail_ref.try_push(value) {
                Ok(()) => {
                    self.hp.clear(HAZ_TAIL);
                    return;
                }
                Err(v) => value = v,
            }

            // Current chunk is full: link a new one, or help whoever did.
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
                        let _ = self.tail.0.compare_exchange(
                            old_tail,
                            new_chunk,
                            Ordering::Release,
                            Ordering::Relaxed,
                        );
                        self.hp.clear(HAZ_TAIL);
                        continue;
                    }
                    Err(linked) => {
                        // Lost the linking race: free the speculative chunk.
                        drop(unsafe { Box::from_raw(new_chunk) });
                        let _ = self.tail.0.compare_exchange(
                            old_tail,
                            linked,
                            Ordering::Release,
                            Ordering::Relaxed,
                        );
                        self.hp.clear(HAZ_TAIL);
                        continue;
                    }
                }
            }
            // Tail was not the last chunk; help advance it.
            let _ = self
                .tail
                .0
                .compare_exchange(old_tail, next, Ordering::Release, Ordering::Relaxed);
            self.hp.clear(HAZ_TAIL);
        }
    }

    pub fn pop_front(&self) -> Option<T> {
        loop {
            let head = self.head.0.load(Ordering::Acquire);
            self.hp.protect(HAZ_HEAD, head.cast());
            if head != self.head.0.load(Ordering::Acquire) {
                continue;
            }
            let head_ref = unsafe { &*head };
            if let Some(value) = head_ref.try_pop() {
                self.hp.clear(HAZ_HEAD);
                return Some(value);
            }

            // Head chunk exhausted; advance to the next one if any.
            let next = head_ref.next.load(Ordering::Acquire);
            self.hp.protect(HAZ_NEXT, next.cast());
            if next.is_null() {
                self.hp.clear_all();
                return None;
            }

            // A lagging tail must move off the chunk before head passes it.
            let tail_now = self.tail.0.load(Ordering::Acquire);
            if tail_now == head {
                let _ = self
                    .tail
                    .0
                    .compare_exchange(tail_now, next, Ordering::Release, Ordering::Relaxed);
                continue;
            }

            if self
                .head
                .0
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.hp.clear(HAZ_HEAD);
                self.hp.clear(HAZ_NEXT);
                self.hp.retire(head);
            }
        }
    }
}

impl<T, const N: usize> Default for MpmcQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for MpmcQueue<T, N> {
    fn drop(&mut self) {
        let mut current = self.head.0.load(Ordering::Relaxed);
        while !current.is_null() {
            let next = unsafe { (*current).next.load(Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(current) });
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_push_pop_single_thread() {
        let q: MpmcQueue<u32> = MpmcQueue::new();
        for i in 0..10 {
            q.push_back(i);
        }
        for i in 0..10 {
            assert_eq!(q.pop_front(), Some(i));
        }
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn test_crosses_chunk_boundary() {
        // Small chunks force several link/retire cycles.
        let q: MpmcQueue<usize, 8> = MpmcQueue::new();
        for i in 0..100 {
            q.push_back(i);
        }
        for i in 0..100 {
            assert_eq!(q.pop_front(), Some(i));
        }
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn test_concurrent_producers_single_drain() {
        let q: Arc<MpmcQueue<u64, 16>> = Arc::new(MpmcQueue::new());
        let n_threads = 4u64;
        let n_per_thread = 500u64;

        let mut handles = vec![];
        for t in 0..n_threads {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..n_per_thread {
                    q.push_back(t * 10_000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Every value exactly once, and FIFO within each producer.
        let mut seen = HashSet::new();
        let mut last_per_producer = vec![None::<u64>; n_threads as usize];
        while let Some(v) = q.pop_front() {
            assert!(seen.insert(v), "duplicate value {}", v);
            let producer = (v / 10_000) as usize;
            let seq = v % 10_000;
            if let Some(prev) = last_per_producer[producer] {
                assert!(seq > prev, "producer {} reordered: {} after {}", producer, seq, prev);
            }
            last_per_producer[producer] = Some(seq);
        }
        assert_eq!(seen.len() as u64, n_threads * n_per_thread);
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        let q: Arc<MpmcQueue<u64, 16>> = Arc::new(MpmcQueue::new());
        let n_producers = 3u64;
        let n_consumers = 3usize;
        let n_per_thread = 400u64;

        let mut producers = vec![];
        for t in 0..n_producers {
            let q = Arc::clone(&q);
            producers.push(std::thread::spawn(move || {
                for i in 0..n_per_thread {
                    q.push_back(t * 10_000 + i);
                }
            }));
        }

        let mut consumers = vec![];
        for _ in 0..n_consumers {
            let q = Arc::clone(&q);
            consumers.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match q.pop_front() {
                        Some(v) => got.push(v),
                        None => {
                            // Stop once the producers are done and the queue
                            // stays empty.
                            if PRODUCERS_DONE.load(Ordering::Acquire) {
                                match q.pop_front() {
                                    Some(v) => got.push(v),
                                    None => break,
                                }
                            } else {
                                std::thread::yield_now();
                            }
                        }
                    }
                }
                got
            }));
        }

        static PRODUCERS_DONE: std::sync::atomic::AtomicBool =
            std::sync::atomic::AtomicBool::new(false);
        for h in producers {
            h.join().unwrap();
        }
        PRODUCERS_DONE.store(true, Ordering::Release);

        let mut all = Vec::new();
        for h in consumers {
            all.extend(h.join().unwrap());
        }
        // Late stragglers the consumers missed at the done/empty edge.
        while let Some(v) = q.pop_front() {
            all.push(v);
        }

        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "a value was consumed twice");
        assert_eq!(all.len() as u64, n_producers * n_per_thread);
    }

    #[test]
    fn test_drop_with_remaining_values() {
        let q: MpmcQueue<String, 4> = MpmcQueue::new();
        for i in 0..10 {
            q.push_back(format!("value-{}", i));
        }
        drop(q); // remaining strings must be freed without leaks
    }
}
