//! Promise jobs
//!
//! A [`PromiseJob`] ties a step callback, a [`JobRunner`] and a promise
//! together: the callback is registered on the owner thread, the runner is
//! queued on a [`WorkerPool`], and the caller gets a [`JobPromise`] back.
//! [`start_cancellable`](PromiseJob::start_cancellable) also hands out a
//! [`CancelHandle`].
//!
//! A job that is canceled before a worker picks it up never runs: its
//! promise is rejected on the next owner-loop turn. A running job checks the
//! token between steps.
//!
//! [`run_blocking`] and [`run_cancellable`] run a plain closure on the pool
//! and settle a promise with its value.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancelToken;
use crate::config::UnobservedErrorPolicy;
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, CallbackError, JobError, Result};
use crate::handle::CallbackBuilder;
use crate::pool::WorkerPool;
use crate::promise::{Deferred, JobPromise};
use crate::runner::{JobOutcome, JobRunner, JobSpec, StepArgs, StepPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SlotState {
    Queued = 0,
    Running = 1,
    Finished = 2,
    Abandoned = 3,
}

/// Decides which of the worker and the canceler gets to a queued job first
#[derive(Debug)]
struct JobSlot {
    state: AtomicU8,
}

impl JobSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(SlotState::Queued as u8),
        })
    }

    fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the job for a worker
    fn begin(&self) -> bool {
        self.transition(SlotState::Queued, SlotState::Running)
    }

    /// Claim the job for the canceler
    fn abandon(&self) -> bool {
        self.transition(SlotState::Queued, SlotState::Abandoned)
    }

    fn finish(&self) {
        self.transition(SlotState::Running, SlotState::Finished);
    }
}

/// Reject `deferred` if `token` is canceled while the job is still queued
fn reject_if_abandoned<T: Send + 'static>(
    token: &CancelToken,
    slot: Arc<JobSlot>,
    deferred: Deferred<T>,
    dispatcher: Arc<dyn Dispatcher>,
    label: String,
) {
    token.on_cancel(move |reason| {
        if !slot.abandon() {
            return;
        }
        tracing::debug!("Job '{}' canceled before it started", label);

        let error = JobError::Canceled {
            label,
            at: None,
            reason: reason.map(str::to_string),
            native: false,
        };
        let rejecter = deferred.clone();
        if dispatcher
            .post(Box::new(move || {
                rejecter.reject(error);
            }))
            .is_err()
        {
            deferred.reject(JobError::Failed("owner loop stopped".to_string()));
        }
    });
}

/// Requests cancellation of one job
#[derive(Clone)]
pub struct CancelHandle {
    token: CancelToken,
    label: Arc<str>,
}

impl CancelHandle {
    /// Request cancellation; a no-op once the job has settled
    pub fn cancel(&self) {
        if self.token.cancel() {
            tracing::debug!("Job '{}' cancel requested", self.label);
        }
    }

    /// Request cancellation with a reason carried by the rejection
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        if self.token.cancel_with_reason(reason) {
            tracing::debug!("Job '{}' cancel requested", self.label);
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("label", &self.label)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// A started job together with the means to cancel it
#[derive(Debug)]
pub struct CancellableJob<T = JobOutcome> {
    pub promise: JobPromise<T>,
    cancel: CancelHandle,
}

impl<T: Send + 'static> CancellableJob<T> {
    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn into_parts(self) -> (JobPromise<T>, CancelHandle) {
        (self.promise, self.cancel)
    }
}

/// Builder for a step-loop job
///
/// `P` picks how step results are read: [`ContinueAlways`](crate::ContinueAlways)
/// runs every step, [`StopOnTrue`](crate::StopOnTrue) stops on the first
/// `true`.
pub struct PromiseJob<P: StepPolicy> {
    spec: JobSpec,
    policy: UnobservedErrorPolicy,
    _policy: PhantomData<P>,
}

impl<P: StepPolicy> PromiseJob<P> {
    /// A job that calls its callback with indices `0..=count`, `delay` apart
    pub fn new(label: impl Into<String>, count: u64, delay: Duration) -> Self {
        Self {
            spec: JobSpec::new(label, count, delay),
            policy: UnobservedErrorPolicy::default(),
            _policy: PhantomData,
        }
    }

    /// Error policy for the job's callback handle
    pub fn error_policy(mut self, policy: UnobservedErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Start the job; must be called on the owner thread
    pub fn start<D, F>(self, dispatcher: &D, pool: &WorkerPool, callback: F) -> Result<JobPromise<JobOutcome>>
    where
        D: Dispatcher + Clone + 'static,
        F: FnMut(StepArgs) -> std::result::Result<P::Output, CallbackError> + 'static,
    {
        self.launch(Arc::new(dispatcher.clone()), pool, callback, CancelToken::new(), false)
    }

    /// Start the job and return a handle that can cancel it
    pub fn start_cancellable<D, F>(self, dispatcher: &D, pool: &WorkerPool, callback: F) -> Result<CancellableJob>
    where
        D: Dispatcher + Clone + 'static,
        F: FnMut(StepArgs) -> std::result::Result<P::Output, CallbackError> + 'static,
    {
        let label: Arc<str> = Arc::from(self.spec.label.as_str());
        let token = CancelToken::new();
        let promise = self.launch(Arc::new(dispatcher.clone()), pool, callback, token.clone(), true)?;
        Ok(CancellableJob {
            promise,
            cancel: CancelHandle { token, label },
        })
    }

    fn launch<F>(
        self,
        dispatcher: Arc<dyn Dispatcher>,
        pool: &WorkerPool,
        callback: F,
        token: CancelToken,
        cancellable: bool,
    ) -> Result<JobPromise<JobOutcome>>
    where
        F: FnMut(StepArgs) -> std::result::Result<P::Output, CallbackError> + 'static,
    {
        if !dispatcher.is_owner_thread() {
            return Err(BridgeError::NotOwnerThread);
        }

        let handle = CallbackBuilder::new()
            .name(self.spec.label.clone())
            .error_policy(self.policy)
            .build_shared::<StepArgs, P::Output, _>(dispatcher.clone(), callback)?;
        let (deferred, promise) = Deferred::with_dispatcher(dispatcher.clone());
        let slot = JobSlot::new();

        if cancellable {
            reject_if_abandoned(
                &token,
                slot.clone(),
                deferred.clone(),
                dispatcher,
                self.spec.label.clone(),
            );
        }

        let spec = self.spec;
        tracing::trace!("Queueing job '{}'", spec.label);
        pool.submit(move || {
            if !slot.begin() {
                tracing::trace!("Skipping canceled job '{}'", spec.label);
                return;
            }
            let mut runner = JobRunner::<P>::new(spec, handle, token, deferred);
            let _ = runner.run();
            slot.finish();
        })?;

        Ok(promise)
    }
}

impl<P: StepPolicy> fmt::Debug for PromiseJob<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseJob")
            .field("spec", &self.spec)
            .field("policy", &self.policy)
            .finish()
    }
}

fn panic_error(payload: Box<dyn std::any::Any + Send>) -> JobError {
    JobError::Failed(CallbackError::from_panic(payload).message().to_string())
}

/// Run `f` on the pool and resolve with its return value
///
/// A panic in `f` rejects the promise with status `error`.
pub fn run_blocking<D, T, F>(dispatcher: &D, pool: &WorkerPool, f: F) -> Result<JobPromise<T>>
where
    D: Dispatcher + Clone + 'static,
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (deferred, promise) = Deferred::new(dispatcher);
    pool.submit(move || {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            Ok(value) => deferred.resolve(value),
            Err(payload) => deferred.reject(panic_error(payload)),
        };
    })?;
    Ok(promise)
}

/// Run `f` on the pool with a cancel token
///
/// If the token is canceled by the time `f` returns, the promise rejects with
/// status `canceled` and the value is dropped. A job canceled before it
/// starts never runs.
pub fn run_cancellable<D, T, F>(dispatcher: &D, pool: &WorkerPool, f: F) -> Result<CancellableJob<T>>
where
    D: Dispatcher + Clone + 'static,
    T: Send + 'static,
    F: FnOnce(&CancelToken) -> T + Send + 'static,
{
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher.clone());
    let token = CancelToken::new();
    let slot = JobSlot::new();
    let (deferred, promise) = Deferred::with_dispatcher(dispatcher.clone());
    reject_if_abandoned(&token, slot.clone(), deferred.clone(), dispatcher, String::new());

    let worker_token = token.clone();
    pool.submit(move || {
        if !slot.begin() {
            return;
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&worker_token)));
        match result {
            Ok(_) if worker_token.is_canceled() => {
                deferred.reject(JobError::Canceled {
                    label: String::new(),
                    at: None,
                    reason: worker_token.reason().map(str::to_string),
                    native: true,
                });
            }
            Ok(value) => {
                deferred.resolve(value);
            }
            Err(payload) => {
                deferred.reject(panic_error(payload));
            }
        }
        slot.finish();
    })?;

    Ok(CancellableJob {
        promise,
        cancel: CancelHandle {
            token,
            label: Arc::from(""),
        },
    })
}
