//! Configuration constants for the bridge
//!
//! This module contains tunable parameters that affect how owner loops,
//! worker pools and blocking callback calls behave.

/// How long an idle owner loop waits for new messages before re-checking
/// its exit condition (in milliseconds)
///
/// A smaller value makes `run_until` and `block_on_timeout` more precise
/// but spends more wake-ups while idle.
pub const OWNER_IDLE_TIMEOUT_MS: u64 = 10;

/// Poll interval for a worker blocked on a callback result (in milliseconds)
///
/// A blocked worker re-checks whether the owner loop is still alive at this
/// interval, so a dropped loop never strands a worker forever.
pub const BLOCKING_CALL_POLL_MS: u64 = 50;

/// Name prefix for worker pool threads
pub const WORKER_THREAD_PREFIX: &str = "miniss-bridge-worker";

/// Stack size for worker pool threads
///
/// Jobs only run a step loop and a blocking call, so they need far less
/// than the platform default.
pub const WORKER_STACK_SIZE: usize = 512 * 1024;

/// What a handle does when a fire-and-forget call fails and nobody can
/// observe the error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnobservedErrorPolicy {
    /// Log the error and begin closing the handle. Already queued calls
    /// still drain; new submissions fail with `HandleClosing`.
    #[default]
    CloseHandle,
    /// Log the error and abort the process.
    AbortProcess,
}
