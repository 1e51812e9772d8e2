//! Cancellable job demonstration
//!
//! This demo starts a few step-loop jobs on a worker pool, lets them make
//! progress on the owner thread, and cancels one of them.

use miniss_bridge::{run_blocking, ContinueAlways, OwnerLoop, PromiseJob, StopOnTrue, WorkerPool};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Cancellable Job Demo");
    println!("====================");

    let owner = OwnerLoop::new();
    let pool = WorkerPool::with_threads(4)?;

    // Demo 1: a job that runs every step
    println!("\n1. Running every step:");
    let promise = PromiseJob::<ContinueAlways>::new("tick-", 5, Duration::from_millis(20))
        .start(&owner.handle(), &pool, |step| {
            println!("   step {}{}", step.label, step.index);
            Ok(())
        })?;
    println!("   result: {:?}", promise.wait_on(&owner));

    // Demo 2: a predicate job that stops itself
    println!("\n2. Stopping from the callback:");
    let promise = PromiseJob::<StopOnTrue>::new("scan-", 20, Duration::from_millis(10))
        .start(&owner.handle(), &pool, |step| Ok(step.index > 3))?;
    match promise.wait_on(&owner) {
        Ok(outcome) => println!("   resolved: {}", outcome),
        Err(error) => println!("   rejected: {}", error),
    }

    // Demo 3: canceling a running job
    println!("\n3. Canceling a running job:");
    let job = PromiseJob::<StopOnTrue>::new("slow-", 20, Duration::from_millis(100))
        .start_cancellable(&owner.handle(), &pool, |step| {
            println!("   step {}{}", step.label, step.index);
            Ok(false)
        })?;
    owner.run_until(|| false, Duration::from_millis(350));
    job.cancel_handle().cancel_with_reason("demo timeout");
    match job.promise.wait_on(&owner) {
        Ok(outcome) => println!("   resolved: {}", outcome),
        Err(error) => println!("   rejected ({}): {}", error.status(), error),
    }

    // Demo 4: plain blocking work
    println!("\n4. Blocking work on the pool:");
    let promise = run_blocking(&owner.handle(), &pool, || (1..=10u64).product::<u64>())?;
    println!("   10! = {:?}", promise.wait_on(&owner));

    pool.join()?;
    owner.run_until_idle();
    Ok(())
}
