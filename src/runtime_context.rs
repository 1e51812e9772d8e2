//! Owner-thread callback registry
//!
//! Managed callbacks are not `Send`: they live in a thread-local table on the
//! owner thread and are looked up by id whenever a queued call is run there.
//! Handles on other threads only ever carry the id.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CallbackError;

/// Boxed managed callback
pub type CallbackFn<A, R> = Box<dyn FnMut(A) -> Result<R, CallbackError>>;

/// Boxed owner-thread finalizer
pub type Finalizer = Box<dyn FnOnce()>;

type SharedCallback<A, R> = Rc<RefCell<CallbackFn<A, R>>>;

/// Identifies a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    fn next() -> Self {
        static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);
        CallbackId(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

struct Entry {
    callback: Box<dyn Any>,
    finalizer: Option<Finalizer>,
}

thread_local! {
    static CALLBACKS: RefCell<HashMap<CallbackId, Entry>> = RefCell::new(HashMap::new());
}

/// Register a callback on the current thread
pub(crate) fn register<A, R>(callback: CallbackFn<A, R>, finalizer: Option<Finalizer>) -> CallbackId
where
    A: 'static,
    R: 'static,
{
    let id = CallbackId::next();
    let shared: SharedCallback<A, R> = Rc::new(RefCell::new(callback));
    CALLBACKS.with(|callbacks| {
        callbacks.borrow_mut().insert(
            id,
            Entry {
                callback: Box::new(shared),
                finalizer,
            },
        );
    });
    id
}

/// Invoke a registered callback
///
/// Must run on the thread that registered `id`. Panics inside the callback
/// are caught and reported as a [`CallbackError`].
pub(crate) fn invoke<A, R>(id: CallbackId, args: A) -> Result<R, CallbackError>
where
    A: 'static,
    R: 'static,
{
    // Clone the Rc out so the table is not borrowed while user code runs.
    let callback = CALLBACKS.with(|callbacks| {
        callbacks
            .borrow()
            .get(&id)
            .and_then(|entry| entry.callback.downcast_ref::<SharedCallback<A, R>>())
            .cloned()
    });

    let callback = callback
        .ok_or_else(|| CallbackError::new(format!("callback {} is not registered on this thread", id.0)))?;
    let mut callback = callback
        .try_borrow_mut()
        .map_err(|_| CallbackError::new(format!("callback {} re-entered while running", id.0)))?;

    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (&mut **callback)(args))) {
        Ok(result) => result,
        Err(payload) => Err(CallbackError::from_panic(payload)),
    }
}

/// Drop the callback registered under `id` and run its finalizer
///
/// Returns `false` if nothing was registered under `id` on this thread.
pub(crate) fn unregister(id: CallbackId) -> bool {
    let entry = CALLBACKS.with(|callbacks| callbacks.borrow_mut().remove(&id));
    let Some(entry) = entry else {
        return false;
    };

    drop(entry.callback);
    if let Some(finalizer) = entry.finalizer {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(finalizer)).is_err() {
            tracing::error!("Finalizer for callback {} panicked", id.0);
        }
    }
    true
}

/// Number of callbacks registered on the current thread
pub fn registered_callbacks() -> usize {
    CALLBACKS.with(|callbacks| callbacks.borrow().len())
}
