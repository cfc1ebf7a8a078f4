//! Bounded FIFO for queries that arrive while every connection is busy.
//!
//! Backed by `crossbeam-queue::ArrayQueue`. When the queue is full,
//! `try_push` hands the query back so that the caller can fail it instead of
//! blocking the reactor or growing memory without bound.

use crossbeam_queue::ArrayQueue;

/// Capacity of the pool's overflow queue.
pub const OVERFLOW_QUEUE_CAPACITY: usize = 0xFFFF;

/// Result of attempting to enqueue.
#[derive(Debug)]
pub enum PushResult<T> {
    /// Item was enqueued.
    Ok,
    /// Queue is full. Returns the item for the caller to handle.
    Full(T),
}

/// A bounded FIFO with explicit overflow signalling.
#[derive(Debug)]
pub struct OverflowQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> Default for OverflowQueue<T> {
    fn default() -> Self {
        Self::new(OVERFLOW_QUEUE_CAPACITY)
    }
}

impl<T> OverflowQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    pub fn try_push(&self, item: T) -> PushResult<T> {
        match self.inner.push(item) {
            Ok(()) => PushResult::Ok,
            Err(item) => PushResult::Full(item),
        }
    }

    /// Pops the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Removes every queued item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.inner.pop()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = OverflowQueue::new(3);

        assert!(matches!(q.try_push(1), PushResult::Ok));
        assert!(matches!(q.try_push(2), PushResult::Ok));
        assert!(matches!(q.try_push(3), PushResult::Ok));

        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn full_returns_item() {
        let q = OverflowQueue::new(2);
        assert!(matches!(q.try_push(1), PushResult::Ok));
        assert!(matches!(q.try_push(2), PushResult::Ok));

        match q.try_push(3) {
            PushResult::Full(v) => assert_eq!(v, 3),
            PushResult::Ok => panic!("expected a full queue"),
        }
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn default_capacity_rejects_65536th_item() {
        let q = OverflowQueue::default();
        assert_eq!(q.capacity(), 65_535);
        for i in 0..65_535u32 {
            assert!(matches!(q.try_push(i), PushResult::Ok), "push {i}");
        }
        assert!(q.is_full());
        assert!(matches!(q.try_push(65_535), PushResult::Full(65_535)));
    }

    #[test]
    fn drain_empties_in_order() {
        let q = OverflowQueue::new(4);
        for i in 0..4 {
            let _ = q.try_push(i);
        }
        assert_eq!(q.drain(), vec![0, 1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    #[should_panic(expected = "queue capacity must be positive")]
    fn zero_capacity_panics() {
        let _q: OverflowQueue<i32> = OverflowQueue::new(0);
    }
}
