use criterion::{criterion_group, criterion_main, Criterion};
use miniss_bridge::{OwnerLoop, PromiseJob, StopOnTrue, ThreadSafeCallbackHandle, WorkerPool};
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// Measures the round trip of a blocking call: a worker thread queues a call,
// the owner loop runs the callback and the result travels back.
fn blocking_call_round_trip(c: &mut Criterion) {
    init_tracing();
    let owner = OwnerLoop::new();
    let handle = ThreadSafeCallbackHandle::new(&owner.handle(), |x: u64| Ok(x + 1)).expect("handle on owner thread");

    c.bench_function("blocking_call_round_trip", |b| {
        b.iter_custom(|iters| {
            let worker_handle = handle.relocate();
            let start = Instant::now();
            let worker = thread::spawn(move || {
                for i in 0..iters {
                    let _ = worker_handle.call(i);
                }
            });
            // The owner thread has to keep turning while the worker waits.
            owner.run_until(|| worker.is_finished(), Duration::from_secs(60));
            let elapsed = start.elapsed();
            worker.join().expect("worker thread");
            elapsed
        })
    });
}

// Measures how fast fire-and-forget calls drain on the owner thread.
fn non_blocking_drain(c: &mut Criterion) {
    init_tracing();
    let owner = OwnerLoop::new();
    let handle = ThreadSafeCallbackHandle::new(&owner.handle(), |_: u64| Ok(())).expect("handle on owner thread");

    c.bench_function("non_blocking_drain_1000", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let _ = handle.post(i);
            }
            owner.run_until_idle();
        })
    });
}

// Measures start-to-settle of a short predicate job on a small pool.
fn short_job_settle(c: &mut Criterion) {
    init_tracing();
    let owner = OwnerLoop::new();
    let pool = WorkerPool::with_threads(2).expect("worker pool");

    c.bench_function("short_job_settle", |b| {
        b.iter(|| {
            let promise = PromiseJob::<StopOnTrue>::new("bench-", 4, Duration::ZERO)
                .start(&owner.handle(), &pool, |step| Ok(step.index > 2))
                .expect("job start");
            let _ = owner.block_on(promise);
        })
    });

    let _ = pool.join();
}

criterion_group!(dispatch_benches, blocking_call_round_trip, non_blocking_drain, short_job_settle);
criterion_main!(dispatch_benches);
