//! Cancellation utilities for cooperative job cancellation
//!
//! This module provides the token shared between the owner thread, which
//! requests cancellation, and a worker thread, which checks for it between
//! steps. Cancellation never interrupts a call that is already in flight.

use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type CancelObserver = Box<dyn FnOnce(Option<&str>) + Send>;

/// A token that can be used to signal cancellation to a job
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    canceled: AtomicBool,
    reason: OnceCell<String>,
    observers: Mutex<Vec<CancelObserver>>,
    // Paired with `wakeup`; only used to park waiters in `wait_timeout`.
    parked: Mutex<()>,
    wakeup: Condvar,
}

impl CancelToken {
    /// Create a new cancel token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                canceled: AtomicBool::new(false),
                reason: OnceCell::new(),
                observers: Mutex::new(Vec::new()),
                parked: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Request cancellation
    ///
    /// Returns `true` for the call that flipped the token; later calls are
    /// no-ops and return `false`.
    pub fn cancel(&self) -> bool {
        self.cancel_inner(None)
    }

    /// Request cancellation and attach a reason
    ///
    /// The first reason offered is kept; later ones are dropped.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) -> bool {
        self.cancel_inner(Some(reason.into()))
    }

    fn cancel_inner(&self, reason: Option<String>) -> bool {
        // The reason goes in before the flag so any thread that observes the
        // flag also observes the payload.
        if self.inner.canceled.load(Ordering::Acquire) {
            return false;
        }
        if let Some(reason) = reason {
            let _ = self.inner.reason.set(reason);
        }
        if self
            .inner
            .canceled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        {
            let _parked = lock(&self.inner.parked);
            self.inner.wakeup.notify_all();
        }

        let observers = std::mem::take(&mut *lock(&self.inner.observers));
        let reason = self.reason();
        for observer in observers {
            observer(reason);
        }

        tracing::trace!("Cancel token flipped (reason: {:?})", reason);
        true
    }

    /// Check if cancellation has been requested
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// The reason attached when the token was canceled, if any
    pub fn reason(&self) -> Option<&str> {
        if self.is_canceled() {
            self.inner.reason.get().map(String::as_str)
        } else {
            None
        }
    }

    /// Register a closure to run once the token is canceled
    ///
    /// Observers run on the thread that cancels the token. If the token is
    /// already canceled the observer runs immediately on the calling thread.
    pub fn on_cancel<F>(&self, observer: F)
    where
        F: FnOnce(Option<&str>) + Send + 'static,
    {
        {
            let mut observers = lock(&self.inner.observers);
            if !self.is_canceled() {
                observers.push(Box::new(observer));
                return;
            }
        }
        observer(self.reason());
    }

    /// Sleep for up to `timeout`, waking early if the token is canceled
    ///
    /// Returns `true` if the token is canceled when the wait ends.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut parked = lock(&self.inner.parked);
        loop {
            if self.is_canceled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            parked = match self.inner.wakeup.wait_timeout(parked, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .field("reason", &self.reason())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
