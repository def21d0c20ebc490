//! Bounded object pools for per-request scratch buffers.
//!
//! Two pools exist per server: a text pool for rendering URL templates and
//! diagnostics, and a byte pool for relaying upstream response bodies. A
//! [`Lease`] puts its value back on drop, so every exit path of a handler
//! returns the buffer, including `?` early returns and cancelled futures.
//!
//! The free list is a lock-free [`ArrayQueue`]: checkout and return never
//! block, and a value is owned by exactly one lease at a time. When the free
//! list is empty a fresh value is allocated; when it is full the returned
//! value is simply dropped, so the pool never holds more than `capacity`.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

/// Values the pool knows how to create and scrub.
pub trait Reusable: Send + 'static {
    fn with_capacity(cap: usize) -> Self;
    fn clear(&mut self);
    fn capacity(&self) -> usize;
}

impl Reusable for String {
    fn with_capacity(cap: usize) -> Self { String::with_capacity(cap) }
    fn clear(&mut self) { String::clear(self) }
    fn capacity(&self) -> usize { String::capacity(self) }
}

impl Reusable for Vec<u8> {
    fn with_capacity(cap: usize) -> Self { Vec::with_capacity(cap) }
    fn clear(&mut self) { Vec::clear(self) }
    fn capacity(&self) -> usize { Vec::capacity(self) }
}

struct Inner<T> {
    free: ArrayQueue<T>,
    item_capacity: usize,
}

/// A shared, bounded pool. Cloning is cheap and shares the free list.
pub struct Pool<T: Reusable> {
    inner: Arc<Inner<T>>,
}

impl<T: Reusable> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// Pool of text buffers.
pub type BufferPool = Pool<String>;

/// Pool of byte buffers used as proxy copy buffers.
pub type BytePool = Pool<Vec<u8>>;

impl<T: Reusable> Pool<T> {
    /// `capacity` idle values at most, each preallocated to `item_capacity`.
    pub fn new(capacity: usize, item_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                free: ArrayQueue::new(capacity.max(1)),
                item_capacity,
            }),
        }
    }

    /// Checks a value out of the pool, allocating one if none is idle.
    pub fn get(&self) -> Lease<T> {
        let value = self
            .inner
            .free
            .pop()
            .unwrap_or_else(|| T::with_capacity(self.inner.item_capacity));
        Lease { value: Some(value), pool: Arc::clone(&self.inner) }
    }

    /// Number of idle values currently held.
    pub fn idle(&self) -> usize {
        self.inner.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.free.capacity()
    }

    /// Capacity each value is allocated with.
    pub fn item_capacity(&self) -> usize {
        self.inner.item_capacity
    }
}

/// Exclusive use of one pooled value until dropped.
pub struct Lease<T: Reusable> {
    value: Option<T>,
    pool: Arc<Inner<T>>,
}

impl<T: Reusable> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` takes the value out.
        self.value.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reusable> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reusable> Drop for Lease<T> {
    fn drop(&mut self) {
        let Some(mut value) = self.value.take() else { return };
        // Buffers that ballooned on one large request are not worth keeping.
        if value.capacity() > self.pool.item_capacity.saturating_mul(4).max(1024) {
            return;
        }
        value.clear();
        let _ = self.pool.free.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_returns_cleared_value() {
        let pool = BufferPool::new(2, 16);
        {
            let mut buf = pool.get();
            buf.push_str("hello");
        }
        assert_eq!(pool.idle(), 1);
        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 16);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn idle_count_never_exceeds_capacity() {
        let pool = BytePool::new(2, 8);
        let leases: Vec<_> = (0..5).map(|_| pool.get()).collect();
        assert_eq!(pool.idle(), 0);
        drop(leases);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn oversized_buffers_are_discarded() {
        let pool = BytePool::new(2, 8);
        {
            let mut buf = pool.get();
            buf.resize(64 * 1024, 0);
        }
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_leases_never_alias() {
        let pool = BytePool::new(4, 64);
        let mut tasks = tokio::task::JoinSet::new();

        for id in 0..32u8 {
            let pool = pool.clone();
            tasks.spawn(async move {
                for _ in 0..50 {
                    let mut buf = pool.get();
                    buf.extend(std::iter::repeat_n(id, 48));
                    tokio::task::yield_now().await;
                    assert!(buf.iter().all(|b| *b == id), "buffer shared between leases");
                    assert_eq!(buf.len(), 48);
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        assert_eq!(pool.idle(), pool.capacity());
    }
}
