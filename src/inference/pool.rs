use anyhow::{anyhow, bail, Result};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

/// Fixed set of model replicas shared between blocking generation tasks.
///
/// `checkout` blocks the calling thread until a replica is free; the replica
/// goes back into the queue when the lease is dropped.
pub struct ModelPool<T> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T> {
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
    size: usize,
}

pub struct Lease<T> {
    pool: Arc<PoolInner<T>>,
    item: Option<T>,
}

#[cfg(test)]
impl<T> Clone for ModelPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ModelPool<T> {
    pub fn new(items: Vec<T>) -> Result<Self> {
        if items.is_empty() {
            bail!("model pool size must be at least 1");
        }
        let size = items.len();
        Ok(Self {
            inner: Arc::new(PoolInner {
                queue: Mutex::new(items.into()),
                available: Condvar::new(),
                size,
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.inner
            .queue
            .lock()
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    pub fn checkout(&self) -> Result<Lease<T>> {
        let mut queue = self
            .inner
            .queue
            .lock()
            .map_err(|_| anyhow!("model pool lock poisoned"))?;
        loop {
            if let Some(item) = queue.pop_front() {
                return Ok(Lease {
                    pool: Arc::clone(&self.inner),
                    item: Some(item),
                });
            }
            queue = self
                .inner
                .available
                .wait(queue)
                .map_err(|_| anyhow!("model pool lock poisoned"))?;
        }
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item
            .as_ref()
            .expect("replica should not be None in active lease")
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item
            .as_mut()
            .expect("replica should not be None in active lease")
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            let mut queue = self
                .pool
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue.push_back(item);
            self.pool.available.notify_one();
        }
    }
}
