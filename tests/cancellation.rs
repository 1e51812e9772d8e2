//! Cancellation of running, queued and finished jobs
//!
//! Tests covering:
//! 1. Cancel before start
//! 2. Cancel during execution
//! 3. Cancel after completion
//! 4. Many concurrent cancellable jobs

mod common;

use common::{run_for, setup_tracing, WAIT};
use miniss_bridge::runtime_context::registered_callbacks;
use miniss_bridge::{JobError, JobOutcome, OwnerLoop, PromiseJob, StopOnTrue, WorkerPool};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_cancel_during_execution_rejects() {
    setup_tracing();
    let owner = OwnerLoop::new();
    let pool = WorkerPool::with_threads(1).unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();

    let job = PromiseJob::<StopOnTrue>::new("x", 20, Duration::from_millis(100))
        .start_cancellable(&owner.handle(), &pool, move |step| {
            seen_clone.borrow_mut().push(step.index);
            Ok(false)
        })
        .unwrap();

    run_for(&owner, Duration::from_millis(300));
    let canceled_at = Instant::now();
    job.cancel();

    let error = owner.block_on_timeout(job.promise, WAIT).unwrap().unwrap_err();
    // The delay wait is interrupted, so the job stops well within one step.
    assert!(canceled_at.elapsed() < Duration::from_millis(250));
    assert_eq!(error.status(), "canceled");
    assert!(error.to_string().starts_with("canceled at x"));

    let steps_at_settle = seen.borrow().len();
    assert!(steps_at_settle < 20);
    assert!(!seen.borrow().contains(&20));

    // No further steps after the cancellation was observed.
    run_for(&owner, Duration::from_millis(250));
    assert_eq!(seen.borrow().len(), steps_at_settle);
    pool.join().unwrap();
}

#[test]
fn test_cancel_reports_step_and_reason() {
    setup_tracing();
    let owner = OwnerLoop::new();
    let pool = WorkerPool::with_threads(1).unwrap();
    let calls = Rc::new(RefCell::new(0u64));
    let calls_clone = calls.clone();

    let job = PromiseJob::<StopOnTrue>::new("r", 50, Duration::from_millis(20))
        .start_cancellable(&owner.handle(), &pool, move |_| {
            *calls_clone.borrow_mut() += 1;
            Ok(false)
        })
        .unwrap();

    assert!(owner.run_until(|| *calls.borrow() >= 2, WAIT));
    job.cancel_handle().cancel_with_reason("user abort");

    match owner.block_on_timeout(job.promise, WAIT).unwrap() {
        Err(JobError::Canceled {
            label,
            at: Some(at),
            reason,
            native,
        }) => {
            assert_eq!(label, "r");
            assert_eq!(at, *calls.borrow());
            assert_eq!(reason.as_deref(), Some("user abort"));
            assert!(native);
        }
        other => panic!("expected cancellation, got {:?}", other),
    }
    pool.join().unwrap();
}

#[test]
fn test_cancel_before_start_never_calls() {
    setup_tracing();
    let owner = OwnerLoop::new();
    let pool = WorkerPool::with_threads(1).unwrap();
    let calls = Rc::new(RefCell::new(0));
    let calls_clone = calls.clone();

    let job = PromiseJob::<StopOnTrue>::new("early", 5, Duration::from_millis(200))
        .start_cancellable(&owner.handle(), &pool, move |_| {
            *calls_clone.borrow_mut() += 1;
            Ok(false)
        })
        .unwrap();

    // Canceled before the owner loop ever ran, so no step could complete.
    job.cancel();
    let error = owner.block_on_timeout(job.promise, WAIT).unwrap().unwrap_err();
    assert!(error.is_canceled());

    pool.join().unwrap();
    owner.run_until_idle();
    assert_eq!(*calls.borrow(), 0);
    assert_eq!(registered_callbacks(), 0);
}

#[test]
fn test_cancel_after_settle_keeps_outcome() {
    setup_tracing();
    let owner = OwnerLoop::new();
    let pool = WorkerPool::with_threads(1).unwrap();

    let job = PromiseJob::<StopOnTrue>::new("s", 3, Duration::ZERO)
        .start_cancellable(&owner.handle(), &pool, |_| Ok(false))
        .unwrap();
    let (promise, cancel) = job.into_parts();

    let settled = Arc::new(AtomicUsize::new(0));
    let outcome = Arc::new(std::sync::Mutex::new(None));
    let settled_clone = settled.clone();
    let outcome_clone = outcome.clone();
    promise.on_settled(move |result| {
        settled_clone.fetch_add(1, Ordering::SeqCst);
        *outcome_clone.lock().unwrap() = Some(result);
    });

    assert!(owner.run_until(|| settled.load(Ordering::SeqCst) == 1, WAIT));
    cancel.cancel();
    run_for(&owner, Duration::from_millis(20));

    assert_eq!(settled.load(Ordering::SeqCst), 1);
    assert_eq!(*outcome.lock().unwrap(), Some(Ok(JobOutcome::Completed)));
    pool.join().unwrap();
}

#[test]
fn test_ten_thousand_cancellable_jobs_settle() {
    setup_tracing();
    const JOBS: usize = 10_000;

    let owner = OwnerLoop::new();
    let pool = WorkerPool::with_threads(8).unwrap();
    let settled = Arc::new(AtomicUsize::new(0));
    let canceled = Arc::new(AtomicUsize::new(0));
    let mut cancels = Vec::with_capacity(JOBS);

    for i in 0..JOBS {
        // Natural completion needs 21 steps of 5ms each.
        let job = PromiseJob::<StopOnTrue>::new(format!("job{}-", i), 20, Duration::from_millis(5))
            .start_cancellable(&owner.handle(), &pool, |_| Ok(false))
            .unwrap();
        let (promise, cancel) = job.into_parts();

        let settled = settled.clone();
        let canceled = canceled.clone();
        promise.on_settled(move |result| {
            if result.as_ref().is_err_and(JobError::is_canceled) {
                canceled.fetch_add(1, Ordering::SeqCst);
            }
            settled.fetch_add(1, Ordering::SeqCst);
        });
        cancels.push(cancel);
    }

    run_for(&owner, Duration::from_millis(20));
    for cancel in &cancels {
        cancel.cancel();
    }

    let finished = owner.run_until(
        || settled.load(Ordering::SeqCst) == JOBS && registered_callbacks() == 0,
        Duration::from_secs(60),
    );
    assert!(
        finished,
        "settled {} of {} jobs, {} handles still open",
        settled.load(Ordering::SeqCst),
        JOBS,
        registered_callbacks()
    );
    assert_eq!(canceled.load(Ordering::SeqCst), JOBS);

    pool.join().unwrap();
}
