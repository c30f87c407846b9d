//! Recycling pool of pre-allocated pixel buffers.
//!
//! Each pipeline stage owns one pool sized for the active geometry. A stage takes a
//! buffer, fills it privately, wraps it in a [`Frame`](super::Frame) and publishes it.
//! When the last snapshot referencing that frame is dropped, the buffer goes back to
//! the free list instead of being freed, so the steady state performs no pixel
//! allocations.
//!
//! # Design
//!
//! - `SegQueue` holds the free buffers (lock-free push/pop from any thread).
//! - `PooledBuffer` keeps a `Weak` handle to its pool. If the pool is gone (geometry
//!   change reallocated everything), the buffer is simply freed on drop.
//! - Exhaustion (consumers holding on to many snapshots) grows the pool by one buffer
//!   and logs, mirroring the frame pool backpressure reporting of the acquisition driver.
//! - Allocation goes through `try_reserve_exact`, so running out of memory is reported as
//!   [`LiveViewError::AllocationFailure`] instead of aborting.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use tracing::{debug, warn};

use super::Pixel;
use crate::error::{LiveViewError, LiveViewResult};

struct PoolInner<T: Pixel> {
    name: &'static str,
    pixels: usize,
    free: SegQueue<Vec<T>>,
    initial_size: usize,
    allocated: AtomicUsize,
}

/// Pool of equally sized pixel buffers.
pub struct FramePool<T: Pixel> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Pixel> Clone for FramePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Pixel> FramePool<T> {
    /// Create a pool of `size` buffers of `pixels` samples each.
    ///
    /// All buffers are allocated up front; the call fails with `AllocationFailure` if any
    /// of them cannot be reserved.
    pub fn new(name: &'static str, pixels: usize, size: usize) -> LiveViewResult<Self> {
        if size == 0 {
            return Err(LiveViewError::InvalidParameter(
                "frame pool size must be greater than 0".into(),
            ));
        }

        let free = SegQueue::new();
        for _ in 0..size {
            free.push(allocate_pixels::<T>(pixels)?);
        }

        debug!(pool = name, pixels, size, "frame pool allocated");

        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                pixels,
                free,
                initial_size: size,
                allocated: AtomicUsize::new(size),
            }),
        })
    }

    /// Take a buffer, growing the pool when every buffer is on loan.
    ///
    /// The buffer content is whatever the previous user left in it; callers overwrite
    /// every sample before publishing.
    pub fn acquire(&self) -> LiveViewResult<PooledBuffer<T>> {
        let data = match self.inner.free.pop() {
            Some(data) => data,
            None => self.grow()?,
        };

        Ok(PooledBuffer {
            data,
            home: Some(Arc::downgrade(&self.inner)),
        })
    }

    fn grow(&self) -> LiveViewResult<Vec<T>> {
        let data = allocate_pixels::<T>(self.inner.pixels)?;
        let allocated = self.inner.allocated.fetch_add(1, Ordering::AcqRel) + 1;

        // Doubling points only, a slow consumer would otherwise flood the log.
        if allocated.is_power_of_two() || allocated == self.inner.initial_size * 2 {
            warn!(
                pool = self.inner.name,
                allocated,
                initial_size = self.inner.initial_size,
                "Frame pool exhausted, growing. Consumers are holding on to snapshots."
            );
        }

        Ok(data)
    }

    /// Samples per buffer.
    #[must_use]
    pub fn pixels(&self) -> usize {
        self.inner.pixels
    }

    /// Buffers currently in the free list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// Total buffers allocated by this pool, including loans.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }
}

/// A buffer on loan from a [`FramePool`], returned on drop.
#[derive(Debug)]
pub struct PooledBuffer<T: Pixel> {
    data: Vec<T>,
    home: Option<Weak<PoolInner<T>>>,
}

impl<T: Pixel> PooledBuffer<T> {
    /// A buffer that belongs to no pool and is freed normally.
    #[must_use]
    pub fn detached(data: Vec<T>) -> Self {
        Self { data, home: None }
    }
}

impl<T: Pixel> Deref for PooledBuffer<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<T: Pixel> DerefMut for PooledBuffer<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl<T: Pixel> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        let Some(pool) = self.home.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        if self.data.len() == pool.pixels {
            pool.free.push(std::mem::take(&mut self.data));
        }
    }
}

/// Allocate a zeroed buffer of `pixels` values without aborting on OOM.
pub(crate) fn allocate_pixels<T: Copy + Default>(pixels: usize) -> LiveViewResult<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(pixels).map_err(|e| {
        LiveViewError::AllocationFailure(format!(
            "{pixels} x {} byte samples: {e}",
            std::mem::size_of::<T>()
        ))
    })?;
    data.resize(pixels, T::default());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_buffers_are_recycled() {
        let pool: FramePool<u16> = FramePool::new("test", 16, 2).unwrap();
        assert_eq!(pool.available(), 2);

        let mut a = pool.acquire().unwrap();
        a[0] = 42;
        assert_eq!(pool.available(), 1);

        drop(a);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    #[traced_test]
    fn test_exhausted_pool_grows() {
        let pool: FramePool<f32> = FramePool::new("test", 4, 1).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(b.len(), 4);
        assert!(logs_contain("Frame pool exhausted"));

        drop(a);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_buffer_outlives_pool() {
        let pool: FramePool<u16> = FramePool::new("test", 8, 1).unwrap();
        let buffer = pool.acquire().unwrap();
        drop(pool);
        // Must not panic or leak into a dead pool.
        assert_eq!(buffer.len(), 8);
        drop(buffer);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(FramePool::<u16>::new("test", 8, 0).is_err());
    }

    #[test]
    fn test_detached_buffer() {
        let buffer = PooledBuffer::detached(vec![1u16, 2, 3]);
        assert_eq!(&*buffer, &[1, 2, 3]);
    }
}
