//! Bounded lock-free rings used for the segment ready-queues, the
//! pending-recycle queue, and deferred releases.
//!
//! The layouts are plain arrays of atomics so a ring can live inside the
//! mapped allocator-state file. Rings carry no state worth preserving
//! across runs; they are re-initialized on every open.

use std::sync::atomic::{AtomicU64, Ordering};

/// Multi-producer multi-consumer bounded queue of `u64` values.
///
/// Classic sequence-stamped slot design: a slot is writable when its
/// stamp equals the head position, readable when it equals position + 1.
#[repr(C)]
pub struct Ring<const N: usize> {
    head: AtomicU64,
    tail: AtomicU64,
    slots: [RingSlot; N],
}

#[repr(C)]
pub struct RingSlot {
    stamp: AtomicU64,
    value: AtomicU64,
}

impl<const N: usize> Ring<N> {
    const _POW2: () = assert!(N.is_power_of_two());

    /// Reset to empty. Callers must hold exclusive access (open time).
    pub fn init(&self) {
        let _ = Self::_POW2;
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        for (i, slot) in self.slots.iter().enumerate() {
            slot.stamp.store(i as u64, Ordering::Relaxed);
            slot.value.store(0, Ordering::Relaxed);
        }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.saturating_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push; returns `Err(value)` when full.
    pub fn push(&self, value: u64) -> Result<(), u64> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos as usize) & (N - 1)];
            let stamp = slot.stamp.load(Ordering::Acquire);
            if stamp == pos {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.value.store(value, Ordering::Relaxed);
                        slot.stamp.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(p) => pos = p,
                }
            } else if stamp < pos {
                return Err(value);
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop; `None` when empty.
    pub fn pop(&self) -> Option<u64> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos as usize) & (N - 1)];
            let stamp = slot.stamp.load(Ordering::Acquire);
            if stamp == pos + 1 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = slot.value.load(Ordering::Relaxed);
                        slot.stamp.store(pos + N as u64, Ordering::Release);
                        return Some(value);
                    }
                    Err(p) => pos = p,
                }
            } else if stamp <= pos {
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }
}

/// Single-producer single-consumer queue of `(value, key)` pairs, used
/// for compacted segments waiting out the read locks.
#[repr(C)]
pub struct PairRing<const N: usize> {
    head: AtomicU64,
    tail: AtomicU64,
    values: [AtomicU64; N],
    keys: [AtomicU64; N],
}

impl<const N: usize> PairRing<N> {
    const _POW2: () = assert!(N.is_power_of_two());

    pub fn init(&self) {
        let _ = Self::_POW2;
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        (self.head.load(Ordering::Acquire) - self.tail.load(Ordering::Acquire)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, value: u64, key: u64) -> Result<(), ()> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head - tail >= N as u64 {
            return Err(());
        }
        let i = (head as usize) & (N - 1);
        self.values[i].store(value, Ordering::Relaxed);
        self.keys[i].store(key, Ordering::Relaxed);
        self.head.store(head + 1, Ordering::Release);
        Ok(())
    }

    /// Peek the front pair without consuming it.
    pub fn front(&self) -> Option<(u64, u64)> {
        let tail = self.tail.load(Ordering::Relaxed);
        if self.head.load(Ordering::Acquire) == tail {
            return None;
        }
        let i = (tail as usize) & (N - 1);
        Some((self.values[i].load(Ordering::Relaxed), self.keys[i].load(Ordering::Relaxed)))
    }

    pub fn pop(&self) -> Option<(u64, u64)> {
        let out = self.front()?;
        self.tail.fetch_add(1, Ordering::Release);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_box<T>() -> Box<T> {
        unsafe {
            let layout = std::alloc::Layout::new::<T>();
            Box::from_raw(std::alloc::alloc_zeroed(layout) as *mut T)
        }
    }

    fn fresh_ring<const N: usize>() -> Box<Ring<N>> {
        let ring: Box<Ring<N>> = zeroed_box();
        ring.init();
        ring
    }

    #[test]
    fn fifo_order_and_capacity() {
        let ring = fresh_ring::<8>();
        for i in 0..8 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.push(99), Err(99), "full ring rejects");
        for i in 0..8 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn wraparound() {
        let ring = fresh_ring::<4>();
        for round in 0..20u64 {
            ring.push(round).unwrap();
            assert_eq!(ring.pop(), Some(round));
        }
    }

    #[test]
    fn concurrent_producers_consumers() {
        use std::sync::Arc;
        let ring = Arc::new(*fresh_ring::<64>());
        let ring2 = Arc::clone(&ring);
        let producer = std::thread::spawn(move || {
            for i in 1..=1000u64 {
                loop {
                    if ring2.push(i).is_ok() {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        });
        let mut sum = 0u64;
        let mut got = 0;
        while got < 1000 {
            if let Some(v) = ring.pop() {
                sum += v;
                got += 1;
            }
        }
        producer.join().unwrap();
        assert_eq!(sum, 1000 * 1001 / 2);
    }

    #[test]
    fn pair_ring_keys_travel_with_values() {
        let ring: Box<PairRing<4>> = zeroed_box();
        ring.init();
        ring.push(7, 100).unwrap();
        ring.push(8, 200).unwrap();
        assert_eq!(ring.front(), Some((7, 100)));
        assert_eq!(ring.pop(), Some((7, 100)));
        assert_eq!(ring.pop(), Some((8, 200)));
        assert_eq!(ring.pop(), None);
    }
}
