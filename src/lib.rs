//! miniss-bridge: cross-thread callbacks with cancellable promise jobs
//!
//! This crate lets worker threads drive callbacks that must only ever run on
//! a single owner thread, and exposes the work as promises the owner thread
//! can observe and cancel:
//! - A single-threaded [`OwnerLoop`] that runs posted tasks in FIFO order
//! - Reference-counted [`ThreadSafeCallbackHandle`]s that queue calls from any
//!   thread and run them on the owner thread
//! - Step-loop jobs ([`PromiseJob`]) run on a [`WorkerPool`], settled through
//!   the same handle that carries their steps
//! - Cooperative cancellation via [`CancelToken`]
//!
//! ## Threads
//!
//! The thread that creates an [`OwnerLoop`] becomes its owner thread. Managed
//! callbacks are registered there and are never moved off it: other threads
//! only hold handles that point at the callback's control block. A worker
//! thread asking for a result blocks until the owner thread runs the call;
//! the owner thread itself never blocks on a worker.
//!
//! ## Example
//!
//! ```rust,no_run
//! use miniss_bridge::{OwnerLoop, PromiseJob, StopOnTrue, WorkerPool};
//! use std::time::Duration;
//!
//! let owner = OwnerLoop::new();
//! let pool = WorkerPool::with_threads(2).unwrap();
//!
//! let job = PromiseJob::<StopOnTrue>::new("scan-", 20, Duration::from_millis(10))
//!     .start_cancellable(&owner.handle(), &pool, |step| Ok(step.index > 5))
//!     .unwrap();
//!
//! let outcome = owner.block_on(job.promise);
//! println!("{:?}", outcome);
//! ```

pub mod cancellation;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod handle;
pub mod job;
pub mod pool;
pub mod promise;
pub mod runner;
pub mod runtime_context;
pub mod waker;

// Re-export core types
pub use cancellation::CancelToken;
pub use config::UnobservedErrorPolicy;
pub use dispatcher::{Dispatcher, LocalTask, LoopHandle};
pub use error::{BridgeError, CallbackError, JobError, TimeoutError};
pub use executor::OwnerLoop;
pub use handle::{CallMode, CallbackBuilder, HandlePhase, Submission, ThreadSafeCallbackHandle, WeakCallbackHandle};
pub use job::{run_blocking, run_cancellable, CancelHandle, CancellableJob, PromiseJob};
pub use pool::{global_pool, init_pool, PoolStats, WorkerPool};
pub use promise::{Deferred, JobPromise};
pub use runner::{ContinueAlways, JobOutcome, JobRunner, JobSpec, RunnerState, StepArgs, StepPolicy, StopOnTrue};

/// Error types for the bridge
pub mod error {
    use std::any::Any;
    use thiserror::Error;

    /// An error raised by a managed callback while it ran on the owner thread
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    #[error("{message}")]
    pub struct CallbackError {
        message: String,
    }

    impl CallbackError {
        pub fn new(message: impl Into<String>) -> Self {
            Self {
                message: message.into(),
            }
        }

        pub fn message(&self) -> &str {
            &self.message
        }

        /// Build an error from a caught panic payload
        pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                format!("callback panicked: {}", s)
            } else if let Some(s) = payload.downcast_ref::<String>() {
                format!("callback panicked: {}", s)
            } else {
                "callback panicked".to_string()
            };
            Self { message }
        }
    }

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum BridgeError {
        #[error("Callback handle is closed")]
        HandleClosed,

        #[error("Callback handle is closing")]
        HandleClosing,

        #[error("Owner loop is no longer running")]
        DispatcherClosed,

        #[error("Operation must run on the owner thread")]
        NotOwnerThread,

        #[error("Worker pool is not running")]
        PoolShutdown,

        #[error("Callback failed: {0}")]
        Callback(#[from] CallbackError),

        #[error("Failed to spawn worker thread: {0}")]
        Spawn(String),
    }

    impl BridgeError {
        /// Whether a worker should treat this error as an implicit cancellation
        pub fn is_cancellation(&self) -> bool {
            matches!(self, BridgeError::HandleClosing)
        }
    }

    /// Why a job promise was rejected
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum JobError {
        /// The job was stopped through its cancel token
        #[error("{}", canceled_message(label, *at, reason.as_deref()))]
        Canceled {
            label: String,
            /// Step index at which the worker observed the cancellation,
            /// `None` when the job never started
            at: Option<u64>,
            reason: Option<String>,
            /// Whether the rejection came from the worker side rather than
            /// directly from the owner thread
            native: bool,
        },

        #[error("Callback failed: {0}")]
        Callback(CallbackError),

        #[error("Job failed: {0}")]
        Failed(String),
    }

    fn canceled_message(label: &str, at: Option<u64>, reason: Option<&str>) -> String {
        let mut message = match at {
            Some(step) => format!("canceled at {}{}", label, step),
            None => "canceled".to_string(),
        };
        if let Some(reason) = reason {
            message.push_str(": ");
            message.push_str(reason);
        }
        message
    }

    impl JobError {
        /// Status string carried by the rejection
        pub fn status(&self) -> &'static str {
            match self {
                JobError::Canceled { .. } => "canceled",
                JobError::Callback(_) | JobError::Failed(_) => "error",
            }
        }

        pub fn is_canceled(&self) -> bool {
            matches!(self, JobError::Canceled { .. })
        }
    }

    /// Returned when a blocking wait on the owner loop runs out of time
    #[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
    #[error("Timed out waiting on the owner loop")]
    pub struct TimeoutError;

    pub type Result<T> = std::result::Result<T, BridgeError>;
}
