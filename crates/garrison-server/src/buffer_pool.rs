//! Recycled read/write buffers for HTTP connections.
//!
//! Every accepted connection takes two buffers and gives them back on close,
//! so that keep-alive churn does not hit the allocator on each accept.
//! Buffers that grew past `max_retained` while serving a large body are
//! dropped instead of being pooled.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// A bounded pool of `BytesMut` buffers.
pub struct BufferPool {
    pool: ArrayQueue<BytesMut>,
    default_capacity: usize,
    max_retained: usize,
}

impl BufferPool {
    /// Creates a pool keeping at most `pool_size` buffers of
    /// `default_capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `pool_size` or `default_capacity` is 0.
    pub fn new(pool_size: usize, default_capacity: usize) -> Self {
        assert!(pool_size > 0, "pool_size must be positive");
        assert!(default_capacity > 0, "default_capacity must be positive");
        Self {
            pool: ArrayQueue::new(pool_size),
            default_capacity,
            max_retained: default_capacity * 16,
        }
    }

    /// Pops a recycled buffer or allocates a fresh one.
    pub fn get(&self) -> BytesMut {
        self.pool
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.default_capacity))
    }

    /// Clears `buf` and keeps it for the next connection.
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > self.max_retained {
            return;
        }
        buf.clear();
        let _ = self.pool.push(buf);
    }

    pub fn available(&self) -> usize {
        self.pool.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(256, 4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_buffer_is_cleared_and_keeps_capacity() {
        let pool = BufferPool::new(4, 256);

        let mut buf = pool.get();
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        let capacity = buf.capacity();
        pool.put(buf);
        assert_eq!(pool.available(), 1);

        let recycled = pool.get();
        assert!(recycled.is_empty());
        assert_eq!(recycled.capacity(), capacity);
    }

    #[test]
    fn oversized_buffers_are_not_retained() {
        let pool = BufferPool::new(4, 64);
        pool.put(BytesMut::with_capacity(64 * 32));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn full_pool_drops_excess() {
        let pool = BufferPool::new(2, 64);
        for _ in 0..3 {
            pool.put(BytesMut::with_capacity(64));
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    #[should_panic(expected = "pool_size must be positive")]
    fn zero_pool_size_panics() {
        let _pool = BufferPool::new(0, 128);
    }
}
