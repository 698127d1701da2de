//! Pool of receive buffers backing range chunks.
//!
//! Transports write each scan reply into a `PooledBuffer`; the decoded chunk
//! owns that buffer until the iterator moves past it, and dropping it hands
//! the allocation back to the pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Default number of idle buffers kept for reuse.
pub const DEFAULT_MAX_POOLED: usize = 16;

struct BufferPoolInner {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
    outstanding: AtomicUsize,
}

impl BufferPoolInner {
    fn return_buffer(&self, mut buffer: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        buffer.clear();
        let mut pool = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.len() < self.max_pooled {
            pool.push(buffer);
        }
    }
}

/// Shared allocator for raw chunk buffers. Cloning shares the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                buffers: Mutex::new(Vec::new()),
                max_pooled,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Checks out an empty buffer with at least `capacity` bytes reserved.
    pub fn acquire(&self, capacity: usize) -> PooledBuffer {
        let reused = {
            let mut pool = self
                .inner
                .buffers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pool.pop()
        };
        let mut buffer = reused.unwrap_or_default();
        buffer.reserve(capacity);
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            data: Some(buffer),
            pool: Some(Arc::downgrade(&self.inner)),
        }
    }

    /// Buffers currently checked out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Idle buffers available for reuse.
    pub fn available(&self) -> usize {
        self.inner
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOLED)
    }
}

/// A buffer checked out from a [`BufferPool`]. Returns to the pool on drop.
pub struct PooledBuffer {
    data: Option<Vec<u8>>,
    pool: Option<Weak<BufferPoolInner>>,
}

impl PooledBuffer {
    /// Wraps bytes that do not belong to any pool.
    pub fn standalone(bytes: Vec<u8>) -> Self {
        Self {
            data: Some(bytes),
            pool: None,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        self.data.get_or_insert_with(Vec::new)
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(weak) = self.pool.take() else {
            return;
        };
        let Some(pool) = weak.upgrade() else {
            return;
        };
        if let Some(buffer) = self.data.take() {
            pool.return_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_buffers_return_to_pool() {
        let pool = BufferPool::new(4);
        {
            let mut buf = pool.acquire(64);
            buf.as_mut_vec().extend_from_slice(b"payload");
            assert_eq!(buf.len(), 7);
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);

        // Reused buffers come back empty.
        let buf = pool.acquire(8);
        assert!(buf.is_empty());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn idle_buffers_are_capped() {
        let pool = BufferPool::new(1);
        let first = pool.acquire(8);
        let second = pool.acquire(8);
        assert_eq!(pool.outstanding(), 2);
        drop(first);
        drop(second);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn standalone_buffers_bypass_pool() {
        let pool = BufferPool::new(1);
        let buf = PooledBuffer::standalone(b"abc".to_vec());
        assert_eq!(buf.as_slice(), b"abc");
        drop(buf);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 0);
    }
}
