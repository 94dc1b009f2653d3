//! Fixed-size pool of execution slots
//!
//! Bounds the number of tasks executing at once. Acquisition is
//! first-requested, first-served (tokio's semaphore queues waiters in
//! order), and a [`Slot`] gives its place back when dropped, so a handler
//! that errors or panics can never leak concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Slot pool errors
#[derive(Debug, thiserror::Error)]
pub enum SlotPoolError {
    /// The pool was closed; no further slots will be handed out
    #[error("slot pool is closed")]
    Closed,

    /// Every slot is taken (only from [`SlotPool::try_acquire`])
    #[error("no free execution slot")]
    Exhausted,
}

struct SlotPoolInner {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    free: Mutex<Vec<usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Execution slot pool
///
/// Cloning is cheap; clones share the same slots.
///
/// # Example
///
/// ```
/// use taskward_engine::worker::SlotPool;
///
/// let pool = SlotPool::new(2);
/// let first = pool.try_acquire().unwrap();
/// let _second = pool.try_acquire().unwrap();
/// assert!(pool.try_acquire().is_err());
///
/// pool.release(first);
/// assert_eq!(pool.active(), 1);
/// ```
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<SlotPoolInner>,
}

impl SlotPool {
    /// Create a pool with `capacity` slots (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(SlotPoolInner {
                capacity,
                semaphore: Arc::new(Semaphore::new(capacity)),
                free: Mutex::new((0..capacity).rev().collect()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a free slot
    ///
    /// Waiters are served in the order they called `acquire`. Dropping the
    /// returned future gives up the place in line.
    pub async fn acquire(&self) -> Result<Slot, SlotPoolError> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| SlotPoolError::Closed)?;
        self.occupy(permit)
    }

    /// Take a free slot without waiting
    pub fn try_acquire(&self) -> Result<Slot, SlotPoolError> {
        let permit = Arc::clone(&self.inner.semaphore)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => SlotPoolError::Closed,
                TryAcquireError::NoPermits => SlotPoolError::Exhausted,
            })?;
        self.occupy(permit)
    }

    /// Return a slot to the pool
    pub fn release(&self, slot: Slot) {
        drop(slot);
    }

    /// Stop handing out slots; pending and future `acquire` calls fail
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of slots currently held
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Highest number of slots ever held at once
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }

    fn occupy(&self, permit: OwnedSemaphorePermit) -> Result<Slot, SlotPoolError> {
        // A permit guarantees a free index; lowest index first keeps slot numbers stable in logs
        let index = {
            let mut free = self.inner.free.lock();
            let lowest = free
                .iter()
                .enumerate()
                .min_by_key(|(_, index)| **index)
                .map(|(pos, _)| pos)
                .ok_or(SlotPoolError::Exhausted)?;
            free.swap_remove(lowest)
        };

        let active = self.inner.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak.fetch_max(active, Ordering::AcqRel);

        Ok(Slot {
            index,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity())
            .field("active", &self.active())
            .finish()
    }
}

/// A held execution slot; released on drop
pub struct Slot {
    index: usize,
    pool: Arc<SlotPoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    /// Index of the slot, in `0..capacity`
    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("index", &self.index).finish()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Index goes back before the permit is released (fields drop after this body)
        self.pool.free.lock().push(self.index);
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
    }
}
