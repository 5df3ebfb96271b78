//! Outstanding work request tracking.

use std::sync::atomic::{AtomicU16, Ordering};

/// Keeps track of work requests in flight on a queue. The verbs API offers
/// no way to ask how many elements are currently enqueued or completed, so
/// submissions are counted here; the count tells the pollers how many
/// completions they must reap to neither over- nor underrun the queues.
///
/// The tracker itself is the sole source of truth for the outstanding
/// count. It does not order poster against poller; the verbs library does.
#[derive(Debug)]
pub struct QueueTracker {
    capacity: u16,
    outstanding: AtomicU16,
}

impl QueueTracker {
    /// Create a tracker bounded by the queue size it shadows.
    pub fn new(capacity: u16) -> Self {
        QueueTracker {
            capacity,
            outstanding: AtomicU16::new(0),
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Count a submitted work request.
    ///
    /// Returns false if the queue is already at capacity.
    #[inline]
    pub fn add(&self) -> bool {
        let mut outstanding = self.outstanding.load(Ordering::Relaxed);
        loop {
            if outstanding == self.capacity {
                return false;
            }
            match self.outstanding.compare_exchange_weak(
                outstanding,
                outstanding + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => outstanding = current,
            }
        }
    }

    /// Count a successfully polled completion.
    ///
    /// Returns false if nothing is outstanding.
    #[inline]
    pub fn sub(&self) -> bool {
        let mut outstanding = self.outstanding.load(Ordering::Relaxed);
        loop {
            if outstanding == 0 {
                return false;
            }
            match self.outstanding.compare_exchange_weak(
                outstanding,
                outstanding - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => outstanding = current,
            }
        }
    }

    /// Current number of outstanding work requests.
    #[inline]
    pub fn current(&self) -> u16 {
        self.outstanding.load(Ordering::Relaxed)
    }
}
