//! Worker-side step loop
//!
//! A [`JobRunner`] runs on a worker thread. For every index in `0..=count`
//! it checks its [`CancelToken`], waits out the step delay, and makes a
//! blocking call through its [`ThreadSafeCallbackHandle`]. The
//! [`StepPolicy`] decides whether the callback's return value stops the job.
//!
//! When the loop ends the result is settled through the same handle, so the
//! owner thread sees every step before the promise settles.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use crate::cancellation::CancelToken;
use crate::error::{BridgeError, JobError};
use crate::handle::ThreadSafeCallbackHandle;
use crate::promise::Deferred;

/// Arguments passed to a step callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepArgs {
    pub label: String,
    pub index: u64,
}

/// Decides whether a step result ends the job
pub trait StepPolicy: Send + 'static {
    /// What the step callback returns
    type Output: Send + 'static;

    fn should_stop(output: &Self::Output) -> bool;
}

/// Run every step; the callback returns nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueAlways;

impl StepPolicy for ContinueAlways {
    type Output = ();

    fn should_stop(_: &()) -> bool {
        false
    }
}

/// Stop as soon as the callback returns `true`
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOnTrue;

impl StepPolicy for StopOnTrue {
    type Output = bool;

    fn should_stop(output: &bool) -> bool {
        *output
    }
}

/// Where a job is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Stepping,
    Terminating,
    Done,
}

/// Label, step count and delay of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub label: String,
    /// Highest step index; the job runs indices `0..=count`
    pub count: u64,
    pub delay: Duration,
}

impl JobSpec {
    pub fn new(label: impl Into<String>, count: u64, delay: Duration) -> Self {
        Self {
            label: label.into(),
            count,
            delay,
        }
    }
}

/// How a job finished when it was not canceled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every step ran
    Completed,
    /// The step callback asked to stop
    Stopped {
        label: String,
        /// Marker reported in the message: the step before the stopping one,
        /// or 0 when step 0 stopped
        at: u64,
        /// Index whose callback returned the stop signal
        step: u64,
    },
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed => write!(f, "completed"),
            JobOutcome::Stopped { label, at, .. } => write!(f, "stopped at {}{}", label, at),
        }
    }
}

/// Runs one job's step loop on the current thread
pub struct JobRunner<P: StepPolicy> {
    spec: JobSpec,
    handle: Option<ThreadSafeCallbackHandle<StepArgs, P::Output>>,
    token: CancelToken,
    deferred: Option<Deferred<JobOutcome>>,
    state: RunnerState,
    steps_run: u64,
    _policy: PhantomData<P>,
}

impl<P: StepPolicy> JobRunner<P> {
    pub fn new(
        spec: JobSpec,
        handle: ThreadSafeCallbackHandle<StepArgs, P::Output>,
        token: CancelToken,
        deferred: Deferred<JobOutcome>,
    ) -> Self {
        Self {
            spec,
            handle: Some(handle),
            token,
            deferred: Some(deferred),
            state: RunnerState::Idle,
            steps_run: 0,
            _policy: PhantomData,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Number of step calls that completed
    pub fn steps_run(&self) -> u64 {
        self.steps_run
    }

    /// Run the step loop, then settle the promise and release the handle
    ///
    /// Blocks the calling thread. Returns the result the promise was settled
    /// with.
    pub fn run(&mut self) -> Result<JobOutcome, JobError> {
        let (Some(handle), Some(deferred)) = (self.handle.take(), self.deferred.take()) else {
            return Err(JobError::Failed(format!(
                "job '{}' already ran",
                self.spec.label
            )));
        };

        tracing::debug!(
            "Job '{}' started (count: {}, delay: {:?})",
            self.spec.label,
            self.spec.count,
            self.spec.delay
        );
        self.state = RunnerState::Stepping;

        let mut result = self.step_loop(&handle);
        // A cancel that raced the last step still wins over the natural outcome.
        if result.is_ok() && self.token.is_canceled() {
            result = Err(self.canceled(None));
        }
        if result.as_ref().is_err_and(JobError::is_canceled) {
            self.state = RunnerState::Terminating;
        }

        match &result {
            Ok(outcome) => tracing::debug!("Job '{}' finished: {}", self.spec.label, outcome),
            Err(error) => tracing::debug!("Job '{}' rejected: {}", self.spec.label, error),
        }

        self.settle(handle, deferred, result.clone());
        self.state = RunnerState::Done;
        result
    }

    fn step_loop(&mut self, handle: &ThreadSafeCallbackHandle<StepArgs, P::Output>) -> Result<JobOutcome, JobError> {
        if self.spec.count == 0 {
            return Ok(JobOutcome::Completed);
        }

        for index in 0..=self.spec.count {
            if self.token.is_canceled() {
                return Err(self.canceled(Some(index)));
            }
            if !self.spec.delay.is_zero() && self.token.wait_timeout(self.spec.delay) {
                return Err(self.canceled(Some(index)));
            }

            let args = StepArgs {
                label: self.spec.label.clone(),
                index,
            };
            let output = match handle.call(args) {
                Ok(output) => output,
                Err(BridgeError::Callback(err)) => return Err(JobError::Callback(err)),
                Err(err) if err.is_cancellation() => return Err(self.canceled(Some(index))),
                Err(err) => return Err(JobError::Failed(err.to_string())),
            };
            self.steps_run += 1;

            if P::should_stop(&output) {
                return Ok(JobOutcome::Stopped {
                    label: self.spec.label.clone(),
                    at: index.saturating_sub(1),
                    step: index,
                });
            }
        }

        Ok(JobOutcome::Completed)
    }

    fn canceled(&self, at: Option<u64>) -> JobError {
        JobError::Canceled {
            label: self.spec.label.clone(),
            at,
            reason: self.token.reason().map(str::to_string),
            native: true,
        }
    }

    /// Queue the settlement behind every step call, then drop our reference
    fn settle(
        &self,
        handle: ThreadSafeCallbackHandle<StepArgs, P::Output>,
        deferred: Deferred<JobOutcome>,
        result: Result<JobOutcome, JobError>,
    ) {
        let settler = deferred.clone();
        let fallback = result.clone();
        if let Err(err) = handle.post_task(move || {
            settler.settle(result);
        }) {
            tracing::warn!("Job '{}' could not queue its settlement: {}", self.spec.label, err);
            deferred.settle(fallback);
        }
        handle.release();
    }
}

impl<P: StepPolicy> fmt::Debug for JobRunner<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("spec", &self.spec)
            .field("state", &self.state)
            .field("steps_run", &self.steps_run)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use crate::executor::OwnerLoop;
    use crate::promise::JobPromise;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    fn start<P, F>(
        owner: &OwnerLoop,
        spec: JobSpec,
        token: CancelToken,
        callback: F,
    ) -> (thread::JoinHandle<(Result<JobOutcome, JobError>, RunnerState)>, JobPromise<JobOutcome>)
    where
        P: StepPolicy,
        F: FnMut(StepArgs) -> Result<P::Output, CallbackError> + 'static,
    {
        let handle = ThreadSafeCallbackHandle::new(&owner.handle(), callback).unwrap();
        let (deferred, promise) = Deferred::new(&owner.handle());
        let mut runner = JobRunner::<P>::new(spec, handle, token, deferred);
        assert_eq!(runner.state(), RunnerState::Idle);

        let worker = thread::spawn(move || {
            let result = runner.run();
            (result, runner.state())
        });
        (worker, promise)
    }

    #[test]
    fn test_continue_always_runs_every_index() {
        let owner = OwnerLoop::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();

        let (worker, promise) = start::<ContinueAlways, _>(
            &owner,
            JobSpec::new("a", 4, Duration::ZERO),
            CancelToken::new(),
            move |args: StepArgs| {
                seen_clone.borrow_mut().push(args.index);
                Ok(())
            },
        );

        assert_eq!(owner.block_on_timeout(promise, WAIT).unwrap(), Ok(JobOutcome::Completed));
        let (result, state) = worker.join().unwrap();
        assert_eq!(result, Ok(JobOutcome::Completed));
        assert_eq!(state, RunnerState::Done);
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_count_never_calls() {
        let owner = OwnerLoop::new();
        let calls = Rc::new(RefCell::new(0));
        let calls_clone = calls.clone();

        let (worker, promise) = start::<ContinueAlways, _>(
            &owner,
            JobSpec::new("zero", 0, Duration::from_millis(10)),
            CancelToken::new(),
            move |_| {
                *calls_clone.borrow_mut() += 1;
                Ok(())
            },
        );

        assert_eq!(owner.block_on_timeout(promise, WAIT).unwrap(), Ok(JobOutcome::Completed));
        worker.join().unwrap();
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn test_stop_on_true_reports_previous_index() {
        let owner = OwnerLoop::new();
        let (worker, promise) = start::<StopOnTrue, _>(
            &owner,
            JobSpec::new("scan-", 10, Duration::ZERO),
            CancelToken::new(),
            |args: StepArgs| Ok(args.index > 3),
        );

        let outcome = owner.block_on_timeout(promise, WAIT).unwrap().unwrap();
        assert_eq!(outcome.to_string(), "stopped at scan-3");
        assert_eq!(worker.join().unwrap().0, Ok(outcome));
    }

    #[test]
    fn test_stop_at_first_and_second_step_are_distinguishable() {
        let owner = OwnerLoop::new();
        let mut outcomes = Vec::new();
        for stop_at in [0u64, 1] {
            let (worker, promise) = start::<StopOnTrue, _>(
                &owner,
                JobSpec::new("s", 5, Duration::ZERO),
                CancelToken::new(),
                move |args: StepArgs| Ok(args.index >= stop_at),
            );
            outcomes.push(owner.block_on_timeout(promise, WAIT).unwrap().unwrap());
            worker.join().unwrap();
        }

        assert_eq!(outcomes[0].to_string(), outcomes[1].to_string());
        assert_eq!(
            outcomes[0],
            JobOutcome::Stopped { label: "s".to_string(), at: 0, step: 0 }
        );
        assert_eq!(
            outcomes[1],
            JobOutcome::Stopped { label: "s".to_string(), at: 0, step: 1 }
        );
    }

    #[test]
    fn test_pre_canceled_token_rejects_without_steps() {
        let owner = OwnerLoop::new();
        let token = CancelToken::new();
        token.cancel_with_reason("shutting down");
        let calls = Rc::new(RefCell::new(0));
        let calls_clone = calls.clone();

        let (worker, promise) = start::<ContinueAlways, _>(
            &owner,
            JobSpec::new("c", 3, Duration::ZERO),
            token,
            move |_| {
                *calls_clone.borrow_mut() += 1;
                Ok(())
            },
        );

        let error = owner.block_on_timeout(promise, WAIT).unwrap().unwrap_err();
        assert_eq!(error.status(), "canceled");
        assert_eq!(error.to_string(), "canceled at c0: shutting down");
        let (_, state) = worker.join().unwrap();
        assert_eq!(state, RunnerState::Done);
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn test_callback_error_rejects() {
        let owner = OwnerLoop::new();
        let (worker, promise) = start::<StopOnTrue, _>(
            &owner,
            JobSpec::new("e", 5, Duration::ZERO),
            CancelToken::new(),
            |args: StepArgs| {
                if args.index == 2 {
                    Err(CallbackError::new("bad step"))
                } else {
                    Ok(false)
                }
            },
        );

        let error = owner.block_on_timeout(promise, WAIT).unwrap().unwrap_err();
        assert_eq!(error, JobError::Callback(CallbackError::new("bad step")));
        assert_eq!(error.status(), "error");
        worker.join().unwrap();
    }

    #[test]
    fn test_closing_handle_is_treated_as_cancel() {
        let owner = OwnerLoop::new();
        let handle = ThreadSafeCallbackHandle::new(&owner.handle(), |_: StepArgs| Ok(())).unwrap();
        handle.close();

        let (deferred, promise) = Deferred::new(&owner.handle());
        let mut runner = JobRunner::<ContinueAlways>::new(
            JobSpec::new("closing", 3, Duration::ZERO),
            handle.relocate(),
            CancelToken::new(),
            deferred,
        );
        let worker = thread::spawn(move || runner.run());

        let error = owner.block_on_timeout(promise, WAIT).unwrap().unwrap_err();
        assert!(error.is_canceled());
        assert_eq!(worker.join().unwrap(), Err(error));
    }

    #[test]
    fn test_run_twice_fails() {
        let owner = OwnerLoop::new();
        let handle = ThreadSafeCallbackHandle::new(&owner.handle(), |_: StepArgs| Ok(())).unwrap();
        let (deferred, promise) = Deferred::new(&owner.handle());
        let mut runner = JobRunner::<ContinueAlways>::new(
            JobSpec::new("once", 0, Duration::ZERO),
            handle,
            CancelToken::new(),
            deferred,
        );

        assert_eq!(runner.run(), Ok(JobOutcome::Completed));
        assert!(matches!(runner.run(), Err(JobError::Failed(_))));
        assert_eq!(promise.wait_on(&owner), Ok(JobOutcome::Completed));
    }
}
