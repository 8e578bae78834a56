use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

use bytes::BytesMut;

use crate::sync::lock;

/// Objects that can be wiped and handed to a new owner.
pub trait Reusable {
    fn reset(&mut self);
}

impl Reusable for BytesMut {
    fn reset(&mut self) {
        self.clear();
    }
}

/// A thread-safe object pool for reusing allocations.
///
/// Connection slots are recycled on every accept, and so are their I/O
/// buffers: a buffer goes back to the pool when its [`PooledObject`] drops
/// and comes out reset on the next [`acquire`](Self::acquire). At most
/// `capacity` idle objects are retained; extras are freed.
pub struct ObjectPool<T> {
    pool: Arc<Mutex<VecDeque<T>>>,
    create_fn: Arc<dyn Fn() -> T + Send + Sync>,
    capacity: usize,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            create_fn: Arc::clone(&self.create_fn),
            capacity: self.capacity,
        }
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("available", &lock(&self.pool).len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T: Reusable + Send + 'static> ObjectPool<T> {
    /// Creates a pool pre-filled with `initial_size` objects that retains up
    /// to `capacity` idle objects.
    pub fn new<F>(initial_size: usize, capacity: usize, create_fn: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let capacity = capacity.max(initial_size);
        let mut pool = VecDeque::with_capacity(initial_size);

        for _ in 0..initial_size {
            pool.push_back(create_fn());
        }

        Self {
            pool: Arc::new(Mutex::new(pool)),
            create_fn: Arc::new(create_fn),
            capacity,
        }
    }

    /// Acquires a reset object from the pool, creating one if the pool is
    /// empty.
    #[inline]
    pub fn acquire(&self) -> PooledObject<T> {
        let object = lock(&self.pool).pop_front();

        let object = match object {
            Some(mut object) => {
                object.reset();
                object
            }
            None => (self.create_fn)(),
        };

        PooledObject {
            object: Some(object),
            pool: Arc::clone(&self.pool),
            capacity: self.capacity,
        }
    }

    /// Returns the number of idle objects currently in the pool.
    pub fn available(&self) -> usize {
        lock(&self.pool).len()
    }
}

/// A guard that returns the object to the pool when dropped.
pub struct PooledObject<T> {
    object: Option<T>,
    pool: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
}

impl<T> Deref for PooledObject<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.object.as_ref().expect("PooledObject is empty")
    }
}

impl<T> DerefMut for PooledObject<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_mut().expect("PooledObject is empty")
    }
}

impl<T: fmt::Debug> fmt::Debug for PooledObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledObject").field(&self.object).finish()
    }
}

impl<T> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            let mut pool = lock(&self.pool);
            if pool.len() < self.capacity {
                pool.push_back(object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_prefilled() {
        let pool = ObjectPool::new(4, 8, || BytesMut::with_capacity(64));
        assert_eq!(pool.available(), 4);

        let buf = pool.acquire();
        assert_eq!(pool.available(), 3);
        drop(buf);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_acquire_returns_reset_object() {
        let pool = ObjectPool::new(1, 1, || BytesMut::with_capacity(64));
        {
            let mut buf = pool.acquire();
            buf.put_slice(b"stale request");
        }

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
    }

    #[test]
    fn test_creates_on_empty_and_bounds_retention() {
        let pool = ObjectPool::new(0, 2, BytesMut::new);
        assert_eq!(pool.available(), 0);

        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(held);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_clones_share_storage() {
        let pool = ObjectPool::new(2, 2, BytesMut::new);
        let other = pool.clone();
        let _a = other.acquire();
        assert_eq!(pool.available(), 1);
    }
}
