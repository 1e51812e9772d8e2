//! Loop waker
//!
//! This module provides the Waker handed to futures driven by
//! [`OwnerLoop::block_on`](crate::executor::OwnerLoop::block_on). Waking it
//! drops a `Wake` message into the loop inbox so the loop re-polls.

use futures::task::ArcWake;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Waker;

use crate::dispatcher::LoopHandle;

/// Waker that nudges an owner loop
pub struct LoopWaker {
    handle: LoopHandle,
    // Coalesces wake-ups between two polls into a single inbox message.
    notified: AtomicBool,
}

impl LoopWaker {
    /// Create a new waker for the given loop
    pub fn new(handle: LoopHandle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            notified: AtomicBool::new(false),
        })
    }

    /// Build a std Waker backed by this loop waker
    pub fn waker(self: &Arc<Self>) -> Waker {
        futures::task::waker(self.clone())
    }

    /// Clear the notified flag before polling again
    pub(crate) fn reset(&self) {
        self.notified.store(false, Ordering::Release);
    }

    pub(crate) fn was_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }
}

impl ArcWake for LoopWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.notified.swap(true, Ordering::AcqRel) {
            arc_self.handle.wake();
        }
    }
}
