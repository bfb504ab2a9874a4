use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::AllocError;

/// Source of raw memory for frame buffers
///
/// Allocation failures are never retried by callers.
pub trait BufferAllocator: Send + Sync {
    /// Allocate an empty buffer able to hold `size` bytes
    fn allocate(&self, size: usize) -> Result<BytesMut, AllocError>;

    /// Hand a buffer back once its last reader is gone
    fn recycle(&self, _buffer: Bytes) {}
}

/// Initial number of buffers to pre-allocate in the pool
const INITIAL_POOL_SIZE: usize = 4;

/// Pool for reusing byte buffers to avoid allocations.
///
/// # Performance
/// - Pre-allocates buffers on creation to avoid runtime allocation
/// - Reuses buffers via recycle()/allocate() cycle
/// - Falls back to allocation if pool is exhausted
pub struct PoolAllocator {
    buffers: Mutex<VecDeque<BytesMut>>,
    block_size: usize,
    max_allocation: usize,
}

impl PoolAllocator {
    pub fn new(block_size: usize, max_allocation: usize) -> Self {
        let mut buffers = VecDeque::with_capacity(INITIAL_POOL_SIZE);

        // Pre-allocate initial buffers to avoid runtime allocation
        for _ in 0..INITIAL_POOL_SIZE {
            buffers.push_back(BytesMut::with_capacity(block_size));
        }

        Self {
            buffers: Mutex::new(buffers),
            block_size,
            max_allocation,
        }
    }

    /// Number of buffers currently pooled
    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new(64 * 1024, 64 * 1024 * 1024)
    }
}

impl BufferAllocator for PoolAllocator {
    fn allocate(&self, size: usize) -> Result<BytesMut, AllocError> {
        if size > self.max_allocation {
            return Err(AllocError::TooLarge {
                requested: size,
                limit: self.max_allocation,
            });
        }

        // Try to reuse a buffer from the pool.
        // Scan each currently pooled buffer at most once to avoid spinning.
        let mut buffers = self.buffers.lock();
        let available = buffers.len();
        for _ in 0..available {
            let Some(mut buffer) = buffers.pop_front() else {
                break;
            };
            if buffer.capacity() >= size {
                buffer.clear();
                return Ok(buffer);
            }
            // Too small for this request, keep it for later.
            buffers.push_back(buffer);
        }

        // Pool exhausted, allocate a new buffer
        Ok(BytesMut::with_capacity(size.max(self.block_size)))
    }

    #[inline]
    fn recycle(&self, buffer: Bytes) {
        // Only keep buffers nobody else reads, and only if pool isn't too large
        if let Ok(buffer) = buffer.try_into_mut() {
            let mut buffers = self.buffers.lock();
            if buffers.len() < INITIAL_POOL_SIZE * 2 {
                buffers.push_back(buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_within_limit() {
        let pool = PoolAllocator::new(16, 1024);
        let buffer = pool.allocate(100).unwrap();
        assert!(buffer.capacity() >= 100);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_allocate_over_limit_fails() {
        let pool = PoolAllocator::new(16, 64);
        assert!(matches!(
            pool.allocate(65),
            Err(AllocError::TooLarge {
                requested: 65,
                limit: 64
            })
        ));
    }

    #[test]
    fn test_recycle_unique_buffer() {
        let pool = PoolAllocator::new(16, 1024);
        let before = pool.pooled();
        let mut buffer = pool.allocate(8).unwrap();
        buffer.extend_from_slice(b"12345678");
        let frozen = buffer.freeze();
        pool.recycle(frozen);
        assert_eq!(pool.pooled(), before);
    }

    #[test]
    fn test_recycle_shared_buffer_is_dropped() {
        let pool = PoolAllocator::new(16, 1024);
        let before = pool.pooled();
        let mut buffer = pool.allocate(8).unwrap();
        buffer.extend_from_slice(b"abcdefgh");
        let frozen = buffer.freeze();
        let _reader = frozen.clone();
        pool.recycle(frozen);
        assert_eq!(pool.pooled(), before - 1);
    }
}
