//! Busy-turn accounting

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of model calls (or chain runs) in flight for a session.
///
/// Cloning shares the counter.
#[derive(Debug, Clone, Default)]
pub struct RespondingCounter {
    count: Arc<AtomicUsize>,
}

impl RespondingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_responding(&self) -> bool {
        self.count() > 0
    }

    /// Increment now and decrement when the guard is dropped
    pub fn enter(&self) -> RespondingGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        RespondingGuard {
            count: Arc::clone(&self.count),
        }
    }
}

/// Decrements the owning counter on drop, including when the future holding
/// it is cancelled or a panic unwinds through it.
#[derive(Debug)]
pub struct RespondingGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for RespondingGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}
