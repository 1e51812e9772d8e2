//! Owner-thread promises
//!
//! A [`JobPromise`] is the read side of a job result and a [`Deferred`] is
//! the write side. The promise can be awaited (it implements
//! `std::future::Future`) or given a continuation with
//! [`on_settled`](JobPromise::on_settled) / [`then`](JobPromise::then).
//!
//! Continuations always run on the owner thread of the dispatcher the
//! promise was created with. A continuation registered before settlement
//! runs inline when the owner thread settles the promise; one registered
//! after settlement is posted and runs on a later loop turn.
//!
//! A promise settles at most once. Dropping every `Deferred` without
//! settling rejects the promise so no waiter is stranded.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use crate::dispatcher::Dispatcher;
use crate::error::JobError;
use crate::executor::OwnerLoop;

type Continuation<T> = Box<dyn FnOnce(Result<T, JobError>) + Send + 'static>;

struct State<T> {
    result: Option<Result<T, JobError>>,
    waker: Option<Waker>,
    continuation: Option<Continuation<T>>,
    consumed: bool,
}

struct Inner<T> {
    settled: AtomicBool,
    state: Mutex<State<T>>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl<T> Inner<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Send + 'static> Inner<T> {
    fn settle(&self, result: Result<T, JobError>) -> bool {
        if self
            .settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let mut state = self.state();
        match state.continuation.take() {
            Some(continuation) => {
                drop(state);
                self.run_continuation(continuation, result);
            }
            None => {
                state.result = Some(result);
                if let Some(waker) = state.waker.take() {
                    drop(state);
                    waker.wake();
                }
            }
        }
        true
    }

    /// Run `continuation` inline on the owner thread, post it otherwise
    fn run_continuation(&self, continuation: Continuation<T>, result: Result<T, JobError>) {
        if self.dispatcher.is_owner_thread() {
            continuation(result);
        } else {
            self.post_continuation(continuation, result);
        }
    }

    fn post_continuation(&self, continuation: Continuation<T>, result: Result<T, JobError>) {
        if self
            .dispatcher
            .post(Box::new(move || continuation(result)))
            .is_err()
        {
            tracing::warn!("Owner loop stopped; promise continuation dropped");
        }
    }
}

/// The write side of a [`JobPromise`]
///
/// Clones share the same promise; the first `resolve`/`reject` wins.
pub struct Deferred<T: Send + 'static> {
    settler: Arc<Settler<T>>,
}

struct Settler<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Drop for Settler<T> {
    fn drop(&mut self) {
        if !self.inner.settled.load(Ordering::Acquire) {
            tracing::debug!("Deferred dropped without settling; rejecting promise");
            self.inner
                .settle(Err(JobError::Failed("promise abandoned before settling".to_string())));
        }
    }
}

impl<T: Send + 'static> Deferred<T> {
    /// Create a pending promise whose continuations run on `dispatcher`'s owner thread
    pub fn new<D>(dispatcher: &D) -> (Deferred<T>, JobPromise<T>)
    where
        D: Dispatcher + Clone + 'static,
    {
        Self::with_dispatcher(Arc::new(dispatcher.clone()))
    }

    pub(crate) fn with_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> (Deferred<T>, JobPromise<T>) {
        let inner = Arc::new(Inner {
            settled: AtomicBool::new(false),
            state: Mutex::new(State {
                result: None,
                waker: None,
                continuation: None,
                consumed: false,
            }),
            dispatcher,
        });

        let deferred = Deferred {
            settler: Arc::new(Settler {
                inner: inner.clone(),
            }),
        };
        (deferred, JobPromise { inner })
    }

    /// Fulfill the promise; returns `false` if it was already settled
    pub fn resolve(&self, value: T) -> bool {
        self.settler.inner.settle(Ok(value))
    }

    /// Reject the promise; returns `false` if it was already settled
    pub fn reject(&self, error: JobError) -> bool {
        self.settler.inner.settle(Err(error))
    }

    pub fn settle(&self, result: Result<T, JobError>) -> bool {
        self.settler.inner.settle(result)
    }

    pub fn is_settled(&self) -> bool {
        self.settler.inner.settled.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            settler: self.settler.clone(),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// A promise for the outcome of a job
pub struct JobPromise<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> JobPromise<T> {
    /// Whether the promise has been resolved or rejected
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::Acquire)
    }

    /// Run `f` on the owner thread once the promise settles
    pub fn on_settled<F>(self, f: F)
    where
        F: FnOnce(Result<T, JobError>) + Send + 'static,
    {
        let mut state = self.inner.state();
        match state.result.take() {
            Some(result) => {
                state.consumed = true;
                drop(state);
                self.inner.post_continuation(Box::new(f), result);
            }
            None => {
                state.continuation = Some(Box::new(f));
            }
        }
    }

    /// Attach separate fulfillment and rejection handlers
    pub fn then<F, E>(self, on_resolve: F, on_reject: E)
    where
        F: FnOnce(T) + Send + 'static,
        E: FnOnce(JobError) + Send + 'static,
    {
        self.on_settled(move |result| match result {
            Ok(value) => on_resolve(value),
            Err(error) => on_reject(error),
        });
    }

    /// Run `owner` until the promise settles and return its outcome
    pub fn wait_on(self, owner: &OwnerLoop) -> Result<T, JobError> {
        owner.block_on(self)
    }
}

impl<T> std::future::Future for JobPromise<T> {
    type Output = Result<T, JobError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state();
        if let Some(result) = state.result.take() {
            state.consumed = true;
            return Poll::Ready(result);
        }
        if state.consumed {
            panic!("JobPromise polled after completion");
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> fmt::Debug for JobPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobPromise")
            .field("settled", &self.inner.settled.load(Ordering::Acquire))
            .finish()
    }
}
