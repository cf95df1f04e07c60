//! Fixed-capacity pool of pre-allocated, format-matched frame buffers

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use tracing::{debug, info};

use super::frame::FormatDescription;
use crate::error::{RelayError, Result};

/// Upper bound on the bytes a single pool may pre-allocate (4 GiB)
pub const MAX_POOL_BYTES: u64 = 4 << 30;

/// Bounded set of reusable frame buffers.
///
/// `acquire` never blocks: once every slot is checked out it returns
/// [`RelayError::PoolExhausted`] until a [`PooledBuffer`] is dropped.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Slots not currently checked out
    free: ArrayQueue<Box<[u8]>>,
    format: FormatDescription,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    acquired: AtomicU64,
    released: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub outstanding: usize,
    pub acquired: u64,
    pub released: u64,
    pub exhausted: u64,
}

impl FramePool {
    /// Allocate `capacity` buffers sized for `format`.
    pub fn new(format: FormatDescription, capacity: usize) -> Result<Self> {
        format.validate()?;
        let buffer_size = format.buffer_size();
        if capacity == 0 {
            return Err(RelayError::invalid_config("pool capacity must be > 0"));
        }
        let total = (capacity as u64).checked_mul(buffer_size as u64);
        if total.map_or(true, |total| total > MAX_POOL_BYTES) {
            return Err(RelayError::PoolCreationFailed {
                capacity,
                buffer_size,
            });
        }

        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let mut slot = Vec::new();
            slot.try_reserve_exact(buffer_size)
                .map_err(|_| RelayError::PoolCreationFailed {
                    capacity,
                    buffer_size,
                })?;
            slot.resize(buffer_size, 0);
            // Queue was sized to capacity, push cannot fail here
            let _ = free.push(slot.into_boxed_slice());
        }

        info!(
            "Frame pool ready: {} buffers of {} bytes ({})",
            capacity, buffer_size, format
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                free,
                format,
                stats: CachePadded::new(Stats::default()),
            }),
        })
    }

    /// Check out a free buffer, failing fast when none is left.
    pub fn acquire(&self) -> Result<PooledBuffer> {
        let stats = &self.inner.stats;
        match self.inner.free.pop() {
            Some(data) => {
                stats.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(PooledBuffer {
                    data: Some(data),
                    pool: Arc::clone(&self.inner),
                })
            }
            None => {
                stats.exhausted.fetch_add(1, Ordering::Relaxed);
                debug!("Frame pool exhausted ({} outstanding)", self.capacity());
                Err(RelayError::PoolExhausted {
                    capacity: self.capacity(),
                })
            }
        }
    }

    /// Hand a buffer back. Equivalent to dropping it; ownership makes a
    /// second release impossible.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    pub fn capacity(&self) -> usize {
        self.inner.free.capacity()
    }

    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    pub fn outstanding(&self) -> usize {
        self.capacity() - self.available()
    }

    pub fn format(&self) -> &FormatDescription {
        &self.inner.format
    }

    pub fn stats(&self) -> PoolStats {
        let stats = &self.inner.stats;
        PoolStats {
            capacity: self.capacity(),
            outstanding: self.outstanding(),
            acquired: stats.acquired.load(Ordering::Relaxed),
            released: stats.released.load(Ordering::Relaxed),
            exhausted: stats.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("format", &self.inner.format)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// A pool slot checked out by exactly one owner.
///
/// Dropping it returns the slot to the pool it came from.
pub struct PooledBuffer {
    data: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    pub fn format(&self) -> &FormatDescription {
        &self.pool.format
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            let _ = self.pool.free.push(data);
            self.pool.stats.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("format", &self.pool.format)
            .field("bytes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn pool(capacity: usize) -> FramePool {
        let format = FormatDescription::new(64, 48, PixelFormat::Bgra32).unwrap();
        FramePool::new(format, capacity).unwrap()
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = pool(3);
        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.outstanding(), 3);

        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, RelayError::PoolExhausted { capacity: 3 }));

        drop(held);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_release_makes_slot_available() {
        let pool = pool(1);
        let buf = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());

        pool.release(buf);
        assert!(pool.acquire().is_ok());

        let stats = pool.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.exhausted, 1);
    }

    #[test]
    fn test_buffers_match_format() {
        let pool = pool(2);
        let mut buf = pool.acquire().unwrap();
        assert_eq!(buf.len(), 64 * 48 * 4);
        buf[0] = 0xff;
        assert_eq!(buf[0], 0xff);
        assert_eq!(buf.format(), pool.format());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let format = FormatDescription::new(64, 48, PixelFormat::Bgra32).unwrap();
        let err = FramePool::new(format, 0).unwrap_err();
        assert!(matches!(err, RelayError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_oversized_pool_is_an_error() {
        let tiny = FormatDescription::new(1, 1, PixelFormat::Bgra32).unwrap();
        let err = FramePool::new(tiny, usize::MAX / 4).unwrap_err();
        assert!(matches!(
            err,
            RelayError::PoolCreationFailed { buffer_size: 4, .. }
        ));

        // 8K BGRA is 132 MB a frame, 64 of them blow the byte limit
        let huge = FormatDescription::new(7680, 4320, PixelFormat::Bgra32).unwrap();
        let err = FramePool::new(huge, 64).unwrap_err();
        assert!(matches!(err, RelayError::PoolCreationFailed { capacity: 64, .. }));
    }

    #[test]
    fn test_clones_share_slots() {
        let pool = pool(1);
        let other = pool.clone();
        let _buf = pool.acquire().unwrap();
        assert!(other.acquire().is_err());
    }
}
