//! Lock-free single-producer/single-consumer packet rings.
//!
//! Rings hand bursts of packets from one lcore to another without locks:
//! the producing lcore enqueues from its transmit path, and the owning
//! lcore drains the ring into a paired transmit queue once per loop
//! iteration (see the rings-to-push list in [`crate::lcore`]).
//!
//! Capacity is a power of two; head and tail indices live on separate
//! cache lines and synchronize with release/acquire ordering only.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketBurst, VifIndex};

#[repr(align(64))]
struct CachePadded<T>(T);

/// A fixed-capacity lock-free SPSC ring of packets.
///
/// # Discipline
///
/// Exactly one thread may call [`enqueue_burst`](VrRing::enqueue_burst)
/// and exactly one thread may call
/// [`dequeue_burst`](VrRing::dequeue_burst) at any time. The scheduler
/// upholds this by giving each ring one producing queue and one draining
/// lcore.
pub struct VrRing {
    name: String,
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<Packet>>]>,
    /// Producer index: next slot to write.
    head: CachePadded<AtomicUsize>,
    /// Consumer index: next slot to read.
    tail: CachePadded<AtomicUsize>,
}

// Packet slots are accessed by at most one producer and one consumer,
// synchronized through head/tail.
unsafe impl Send for VrRing {}
unsafe impl Sync for VrRing {}

impl VrRing {
    /// Create a ring with `size` slots. `size` must be a power of two.
    pub fn with_capacity(name: impl Into<String>, size: usize) -> Result<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(Error::RingSize(size));
        }
        let slots = (0..size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Ok(Self {
            name: name.into(),
            mask: size - 1,
            slots,
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        })
    }

    /// Ring name (unique per dataplane).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of packets currently enqueued.
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Whether the ring holds no packets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue packets from the front of `pkts`, up to the free space.
    ///
    /// Returns the number enqueued; packets that did not fit remain in
    /// `pkts`. Producer side only.
    pub fn enqueue_burst(&self, pkts: &mut PacketBurst) -> usize {
        if pkts.is_empty() {
            return 0;
        }
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        let free = self.capacity() - head.wrapping_sub(tail);
        let n = free.min(pkts.len());
        if n == 0 {
            return 0;
        }
        for (i, pkt) in pkts.drain(..n).enumerate() {
            let slot = &self.slots[head.wrapping_add(i) & self.mask];
            // Safety: slots in [tail+cap, head) are free and this is the
            // only producer.
            unsafe { (*slot.get()).write(pkt) };
        }
        // Publish all slot writes with a single release store.
        self.head.0.store(head.wrapping_add(n), Ordering::Release);
        n
    }

    /// Dequeue up to `max` packets, appending to `pkts` (bounded by its
    /// remaining capacity). Returns the number dequeued. Consumer side
    /// only.
    pub fn dequeue_burst(&self, pkts: &mut PacketBurst, max: usize) -> usize {
        let room = pkts.capacity() - pkts.len();
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        let avail = head.wrapping_sub(tail);
        let n = avail.min(max).min(room);
        if n == 0 {
            return 0;
        }
        for i in 0..n {
            let slot = &self.slots[tail.wrapping_add(i) & self.mask];
            // Safety: slots in [tail, head) were published by the
            // producer and this is the only consumer.
            let pkt = unsafe { (*slot.get()).assume_init_read() };
            pkts.push(pkt);
        }
        self.tail.0.store(tail.wrapping_add(n), Ordering::Release);
        n
    }
}

impl Drop for VrRing {
    fn drop(&mut self) {
        let head = *self.head.0.get_mut();
        let tail = *self.tail.0.get_mut();
        for i in 0..head.wrapping_sub(tail) {
            let slot = self.slots[tail.wrapping_add(i) & self.mask].get_mut();
            // Safety: [tail, head) slots are initialized; we have
            // exclusive access.
            unsafe { slot.assume_init_drop() };
        }
    }
}

impl std::fmt::Debug for VrRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VrRing")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// Pairs a ring with the interface whose transmit queue drains it.
///
/// Registered on the draining lcore; that lcore looks up its own transmit
/// queue for `vif` each iteration and bursts the ring into it.
#[derive(Clone)]
pub struct RingToPush {
    pub ring: Arc<VrRing>,
    pub vif: VifIndex,
}

/// A registry entry for an allocated ring. The owner is the lcore that
/// drains the ring.
pub(crate) struct RingEntry {
    pub(crate) ring: Arc<VrRing>,
    pub(crate) owner_lcore: usize,
}

/// Allocate a named ring into `registry`, rejecting name collisions.
pub(crate) fn allocate_into(
    registry: &Mutex<HashMap<String, RingEntry>>,
    owner_lcore: usize,
    name: &str,
    size: usize,
) -> Result<Arc<VrRing>> {
    let ring = Arc::new(VrRing::with_capacity(name, size)?);
    let mut reg = registry.lock().unwrap_or_else(|e| e.into_inner());
    if reg.contains_key(name) {
        return Err(Error::RingNameCollision(name.to_string()));
    }
    tracing::debug!(name, size, owner_lcore, "ring allocated");
    reg.insert(
        name.to_string(),
        RingEntry {
            ring: Arc::clone(&ring),
            owner_lcore,
        },
    );
    Ok(ring)
}

/// Remove a ring from `registry`; missing names are a no-op.
pub(crate) fn free_from(registry: &Mutex<HashMap<String, RingEntry>>, name: &str) {
    let mut reg = registry.lock().unwrap_or_else(|e| e.into_inner());
    if reg.remove(name).is_some() {
        tracing::debug!(name, "ring freed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_PACKET_SZ;
    use crate::mempool::Mempool;

    fn burst_of(pool: &Mempool, n: usize, vif: VifIndex) -> PacketBurst {
        let mut burst = PacketBurst::new();
        for i in 0..n {
            let mut pkt = Packet::from_buf(pool.try_alloc().unwrap(), vif);
            assert!(pkt.set_data(&[i as u8]));
            burst.push(pkt);
        }
        burst
    }

    #[test]
    fn test_size_must_be_power_of_two() {
        assert!(matches!(
            VrRing::with_capacity("bad", 10),
            Err(Error::RingSize(10))
        ));
        assert!(matches!(
            VrRing::with_capacity("zero", 0),
            Err(Error::RingSize(0))
        ));
        assert!(VrRing::with_capacity("ok", 16).is_ok());
    }

    #[test]
    fn test_enqueue_dequeue_order() {
        let pool = Mempool::new("ring-test", 32, MAX_PACKET_SZ);
        let ring = VrRing::with_capacity("r0", 16).unwrap();

        let mut burst = burst_of(&pool, 5, 3);
        assert_eq!(ring.enqueue_burst(&mut burst), 5);
        assert!(burst.is_empty());
        assert_eq!(ring.len(), 5);

        let mut out = PacketBurst::new();
        assert_eq!(ring.dequeue_burst(&mut out, 32), 5);
        assert!(ring.is_empty());
        for (i, pkt) in out.iter().enumerate() {
            assert_eq!(pkt.data(), &[i as u8]);
            assert_eq!(pkt.vif(), 3);
        }
    }

    #[test]
    fn test_full_ring_retains_remainder() {
        let pool = Mempool::new("ring-full", 32, MAX_PACKET_SZ);
        let ring = VrRing::with_capacity("r1", 4).unwrap();

        let mut burst = burst_of(&pool, 6, 0);
        assert_eq!(ring.enqueue_burst(&mut burst), 4);
        assert_eq!(burst.len(), 2);
        assert_eq!(ring.len(), 4);

        // Drain two, then the remainder fits.
        let mut out = PacketBurst::new();
        assert_eq!(ring.dequeue_burst(&mut out, 2), 2);
        assert_eq!(ring.enqueue_burst(&mut burst), 2);
        assert!(burst.is_empty());
    }

    #[test]
    fn test_wraparound() {
        let pool = Mempool::new("ring-wrap", 64, MAX_PACKET_SZ);
        let ring = VrRing::with_capacity("r2", 8).unwrap();

        for round in 0..10 {
            let mut burst = burst_of(&pool, 6, round as VifIndex);
            assert_eq!(ring.enqueue_burst(&mut burst), 6);
            let mut out = PacketBurst::new();
            assert_eq!(ring.dequeue_burst(&mut out, 32), 6);
            assert!(out.iter().all(|p| p.vif() == round as VifIndex));
        }
    }

    #[test]
    fn test_spsc_across_threads() {
        let pool = Mempool::new("ring-mt", 512, 256);
        let ring = Arc::new(VrRing::with_capacity("r3", 64).unwrap());
        let total = 400usize;

        let producer = {
            let ring = Arc::clone(&ring);
            let pool = pool.clone();
            std::thread::spawn(move || {
                let mut sent = 0;
                while sent < total {
                    let n = (total - sent).min(8);
                    let mut burst = burst_of(&pool, n, 1);
                    while !burst.is_empty() {
                        if ring.enqueue_burst(&mut burst) == 0 {
                            std::thread::yield_now();
                        }
                    }
                    sent += n;
                }
            })
        };

        let mut received = 0;
        while received < total {
            let mut out = PacketBurst::new();
            let n = ring.dequeue_burst(&mut out, 32);
            if n == 0 {
                std::thread::yield_now();
            }
            received += n;
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
        assert_eq!(pool.available(), 512);
    }

    #[test]
    fn test_registry_collision() {
        let registry = Mutex::new(HashMap::new());
        allocate_into(&registry, 0, "dup", 8).unwrap();
        assert!(matches!(
            allocate_into(&registry, 1, "dup", 8),
            Err(Error::RingNameCollision(_))
        ));
        free_from(&registry, "dup");
        free_from(&registry, "dup"); // no-op
        assert!(allocate_into(&registry, 1, "dup", 8).is_ok());
    }
}
