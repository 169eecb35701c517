use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::shared::frame::ReleaseHook;

/// Bounds how many camera buffers may be checked out to the pipeline.
///
/// A camera hands out a small fixed set of buffers; holding all of them
/// stalls capture. Each frame carries a [`BufferLease`] that returns its
/// slot when the frame is dropped.
#[derive(Clone, Debug)]
pub struct BufferPool {
    outstanding: Arc<AtomicUsize>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            outstanding: Arc::new(AtomicUsize::new(0)),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Checks out a buffer, or `None` when all are in use.
    pub fn try_lease(&self) -> Option<BufferLease> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()
            .map(|_| BufferLease {
                outstanding: self.outstanding.clone(),
            })
    }
}

/// One checked-out buffer. Returned to the pool on drop.
#[derive(Debug)]
pub struct BufferLease {
    outstanding: Arc<AtomicUsize>,
}

impl BufferLease {
    /// Turns the lease into a frame release hook.
    pub fn into_release_hook(self) -> ReleaseHook {
        Box::new(move || drop(self))
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
