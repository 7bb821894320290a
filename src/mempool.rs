//! Bounded packet-buffer pools.
//!
//! A [`Mempool`] pre-allocates a fixed number of equally sized buffers and
//! leases them out as [`PoolBuf`]s; a buffer returns to its pool when the
//! lease is dropped. Exhaustion is reported as `None`, never by growing
//! the pool.
//!
//! The free list is guarded by a mutex: buffers are allocated inside
//! device backends (hardware receive, kernel bridge), not in the
//! per-lcore polling loop.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

struct MempoolInner {
    name: String,
    buf_len: usize,
    capacity: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

/// A fixed-capacity pool of pre-allocated packet buffers.
///
/// Cloning is cheap and shares the same pool.
#[derive(Clone)]
pub struct Mempool {
    inner: Arc<MempoolInner>,
}

impl Mempool {
    /// Create a pool of `capacity` buffers of `buf_len` bytes each.
    pub fn new(name: impl Into<String>, capacity: usize, buf_len: usize) -> Self {
        let free = (0..capacity)
            .map(|_| vec![0u8; buf_len].into_boxed_slice())
            .collect();
        Self {
            inner: Arc::new(MempoolInner {
                name: name.into(),
                buf_len,
                capacity,
                free: Mutex::new(free),
            }),
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Size of each buffer in bytes.
    pub fn buf_len(&self) -> usize {
        self.inner.buf_len
    }

    /// Total number of buffers in the pool.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        match self.inner.free.lock() {
            Ok(free) => free.len(),
            Err(_) => 0,
        }
    }

    /// Lease a buffer from the pool. Returns `None` when exhausted.
    pub fn try_alloc(&self) -> Option<PoolBuf> {
        let buf = self.inner.free.lock().ok()?.pop()?;
        Some(PoolBuf {
            data: Some(buf),
            pool: Arc::clone(&self.inner),
        })
    }
}

impl std::fmt::Debug for Mempool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("name", &self.inner.name)
            .field("buf_len", &self.inner.buf_len)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// A buffer leased from a [`Mempool`]; returns to the pool on drop.
pub struct PoolBuf {
    data: Option<Box<[u8]>>,
    pool: Arc<MempoolInner>,
}

impl PoolBuf {
    /// Length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.pool.buf_len
    }

    /// Whether the buffer has zero length.
    pub fn is_empty(&self) -> bool {
        self.pool.buf_len == 0
    }
}

impl Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // Invariant: `data` is Some for the lifetime of the lease.
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.data.take()
            && let Ok(mut free) = self.pool.free.lock()
        {
            free.push(buf);
        }
    }
}

impl std::fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuf")
            .field("pool", &self.pool.name)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_return() {
        let pool = Mempool::new("test", 2, 64);
        assert_eq!(pool.available(), 2);

        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(pool.available(), 0);
        assert!(pool.try_alloc().is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_buffer_is_writable() {
        let pool = Mempool::new("rw", 1, 16);
        let mut buf = pool.try_alloc().unwrap();
        buf[0] = 0xab;
        buf[15] = 0xcd;
        assert_eq!(buf[0], 0xab);
        assert_eq!(buf[15], 0xcd);
    }
}
