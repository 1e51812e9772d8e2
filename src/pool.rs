//! Worker thread pool for job bodies
//!
//! Jobs run their step loop on a fixed set of named worker threads fed from
//! a single unbounded channel. Workers never touch managed callbacks
//! directly; they only hold handles and block on calls routed to the owner
//! thread.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::config::{WORKER_STACK_SIZE, WORKER_THREAD_PREFIX};
use crate::error::{BridgeError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PoolState {
    Initializing = 0,
    Running = 1,
    ShuttingDown = 2,
    Terminated = 3,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Initializing,
            1 => PoolState::Running,
            2 => PoolState::ShuttingDown,
            _ => PoolState::Terminated,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
    panicked: AtomicUsize,
}

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    num_threads: usize,
    // Dropped on shutdown so idle workers see a disconnected channel.
    sender: Mutex<Option<Sender<Job>>>,
    join_handles: Mutex<Vec<thread::JoinHandle<()>>>,
    state: AtomicU8,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.num_threads)
            .field("state", &self.state())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool with one worker per logical CPU
    pub fn new_optimal() -> Result<Self> {
        Self::new(None)
    }

    /// Create a pool with exactly `num_threads` workers
    pub fn with_threads(num_threads: usize) -> Result<Self> {
        Self::new(Some(num_threads))
    }

    /// Create a new pool
    pub fn new(num_threads: Option<usize>) -> Result<Self> {
        let num_threads = num_threads.unwrap_or_else(num_cpus::get);
        if num_threads == 0 {
            return Err(BridgeError::Spawn(
                "Cannot create worker pool with 0 threads".to_string(),
            ));
        }

        tracing::info!("Creating worker pool with {} threads", num_threads);

        let (sender, receiver) = unbounded::<Job>();
        let counters = Arc::new(Counters::default());
        let pool = Self {
            num_threads,
            sender: Mutex::new(Some(sender)),
            join_handles: Mutex::new(Vec::with_capacity(num_threads)),
            state: AtomicU8::new(PoolState::Initializing as u8),
            counters: counters.clone(),
        };

        for worker_id in 0..num_threads {
            let receiver = receiver.clone();
            let counters = counters.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", WORKER_THREAD_PREFIX, worker_id))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || worker_loop(worker_id, receiver, counters))
                .map_err(|e| BridgeError::Spawn(format!("Failed to spawn worker thread: {}", e)))?;
            pool.lock_handles().push(handle);
        }

        pool.state.store(PoolState::Running as u8, Ordering::Release);
        Ok(pool)
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<thread::JoinHandle<()>>> {
        self.join_handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Queue `job` to run on a worker thread
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state() != PoolState::Running {
            return Err(BridgeError::PoolShutdown);
        }

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(BridgeError::PoolShutdown);
        };

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        sender.send(Box::new(job)).map_err(|_| {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            BridgeError::PoolShutdown
        })
    }

    /// Stop accepting jobs; workers exit once the queue is drained
    pub fn shutdown(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(
                PoolState::Running as u8,
                PoolState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Already shutting down or terminated
            return Ok(());
        }

        tracing::info!("Shutting down worker pool");
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        Ok(())
    }

    /// Shut down and wait for every worker thread to exit
    pub fn join(&self) -> Result<()> {
        self.shutdown()?;

        let handles: Vec<_> = self.lock_handles().drain(..).collect();
        for (worker_id, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.join() {
                tracing::error!("Failed to join worker {} thread: {:?}", worker_id, e);
                return Err(BridgeError::Spawn(format!("Thread join failed: {:?}", e)));
            }
        }

        self.state
            .store(PoolState::Terminated as u8, Ordering::Release);
        tracing::info!("All workers completed");
        Ok(())
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            num_threads: self.num_threads,
            queued: self.counters.queued.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            is_shutdown: matches!(state, PoolState::ShuttingDown | PoolState::Terminated),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.num_threads
    }
}

fn worker_loop(worker_id: usize, receiver: Receiver<Job>, counters: Arc<Counters>) {
    tracing::debug!("Worker {} started", worker_id);

    while let Ok(job) = receiver.recv() {
        counters.queued.fetch_sub(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::Relaxed);

        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Job panicked on worker {}", worker_id);
        }

        counters.active.fetch_sub(1, Ordering::Relaxed);
        counters.completed.fetch_add(1, Ordering::Relaxed);
    }

    tracing::debug!("Worker {} exiting", worker_id);
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub num_threads: usize,
    /// Jobs waiting for a worker
    pub queued: usize,
    /// Jobs currently running
    pub active: usize,
    /// Jobs that finished, including ones that panicked
    pub completed: usize,
    pub panicked: usize,
    pub is_shutdown: bool,
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.state() == PoolState::Running {
            tracing::warn!("Worker pool dropped without explicit shutdown");
            let _ = self.shutdown();
        }
    }
}

/// Global pool instance for convenience functions
static GLOBAL_POOL: std::sync::OnceLock<WorkerPool> = std::sync::OnceLock::new();

/// Initialize the global worker pool
pub fn init_pool(num_threads: Option<usize>) -> Result<()> {
    let pool = WorkerPool::new(num_threads)?;
    GLOBAL_POOL.set(pool).map_err(|pool| {
        let _ = pool.shutdown();
        BridgeError::Spawn("Global worker pool already initialized".to_string())
    })
}

/// Get the global worker pool, creating it with default settings on first use
pub fn global_pool() -> Result<&'static WorkerPool> {
    if let Some(pool) = GLOBAL_POOL.get() {
        return Ok(pool);
    }
    let pool = WorkerPool::new_optimal()?;
    // Another thread may have won the race; its pool is used and ours shuts down.
    if let Err(pool) = GLOBAL_POOL.set(pool) {
        let _ = pool.shutdown();
    }
    GLOBAL_POOL
        .get()
        .ok_or_else(|| BridgeError::Spawn("Global worker pool unavailable".to_string()))
}
