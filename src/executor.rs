//! Single-threaded owner loop with panic isolation
//!
//! This module provides the reference [`Dispatcher`](crate::Dispatcher)
//! implementation: a loop bound to the thread that created it. Tasks posted
//! through any [`LoopHandle`] clone run here, one at a time, in the order
//! they arrived.
//!
//! ## Panic Handling
//!
//! Every posted task runs inside `std::panic::catch_unwind`. When a task
//! panics the panic is logged and the loop moves on to the next task; it is
//! never propagated to the caller of `tick`/`block_on`.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::OWNER_IDLE_TIMEOUT_MS;
use crate::dispatcher::{LocalTask, LoopHandle, LoopMessage};
use crate::error::TimeoutError;
use crate::waker::LoopWaker;

/// The owner-thread event loop
///
/// `OwnerLoop` is deliberately `!Send`: the thread that creates it is the
/// owner thread for every callback registered against its handle.
pub struct OwnerLoop {
    receiver: Receiver<LoopMessage>,
    handle: LoopHandle,
    alive: Arc<AtomicBool>,
    tasks_run: Cell<u64>,
    _not_send: PhantomData<*const ()>,
}

impl OwnerLoop {
    /// Create a new loop owned by the current thread
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        let alive = Arc::new(AtomicBool::new(true));
        let owner = thread::current().id();
        tracing::debug!("Owner loop created on thread {:?}", owner);

        Self {
            receiver,
            handle: LoopHandle::new(sender, owner, alive.clone()),
            alive,
            tasks_run: Cell::new(0),
            _not_send: PhantomData,
        }
    }

    /// Get a handle for posting work to this loop
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run every task currently queued
    ///
    /// Returns `true` if at least one task ran.
    pub fn tick(&self) -> bool {
        let mut made_progress = false;
        while let Ok(message) = self.receiver.try_recv() {
            made_progress |= self.handle_message(message);
        }
        made_progress
    }

    /// Keep ticking until the inbox is empty
    pub fn run_until_idle(&self) {
        while self.tick() {}
    }

    /// Run the loop until `done` returns `true` or `timeout` elapses
    ///
    /// Returns whether `done` was satisfied.
    pub fn run_until<F>(&self, mut done: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.tick();
            if done() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(OWNER_IDLE_TIMEOUT_MS));
            if let Ok(message) = self.receiver.recv_timeout(wait) {
                self.handle_message(message);
            }
        }
    }

    /// Run a future to completion, processing posted tasks while it is pending
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        match self.drive(future, None) {
            Ok(output) => output,
            // Without a deadline `drive` only returns once the future is ready.
            Err(_) => unreachable!("block_on without deadline timed out"),
        }
    }

    /// Like [`block_on`](Self::block_on) but gives up after `timeout`
    pub fn block_on_timeout<F>(&self, future: F, timeout: Duration) -> Result<F::Output, TimeoutError>
    where
        F: Future,
    {
        self.drive(future, Some(Instant::now() + timeout))
    }

    fn drive<F>(&self, future: F, deadline: Option<Instant>) -> Result<F::Output, TimeoutError>
    where
        F: Future,
    {
        let mut future = Box::pin(future);

        let loop_waker = LoopWaker::new(self.handle.clone());
        let waker = loop_waker.waker();
        let mut context = Context::from_waker(&waker);

        loop {
            loop_waker.reset();
            if let Poll::Ready(output) = future.as_mut().poll(&mut context) {
                return Ok(output);
            }

            // Anything already queued may settle the future; run it before
            // waiting on the inbox.
            if self.tick() || loop_waker.was_notified() {
                continue;
            }

            let mut wait = Duration::from_millis(OWNER_IDLE_TIMEOUT_MS);
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TimeoutError);
                }
                wait = wait.min(deadline - now);
            }

            match self.receiver.recv_timeout(wait) {
                Ok(message) => {
                    self.handle_message(message);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // The loop holds a sender itself, so this only happens
                    // while the loop is being torn down.
                    thread::yield_now();
                }
            }
        }
    }

    fn handle_message(&self, message: LoopMessage) -> bool {
        match message {
            LoopMessage::Task(task) => {
                self.run_task(task);
                true
            }
            LoopMessage::Wake => false,
        }
    }

    fn run_task(&self, task: LocalTask) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
        self.tasks_run.set(self.tasks_run.get() + 1);
        if result.is_err() {
            tracing::error!("Owner task panicked; continuing with the next task");
        }
    }

    /// Number of posted tasks this loop has run
    pub fn tasks_run(&self) -> u64 {
        self.tasks_run.get()
    }

    /// Number of messages waiting in the inbox
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for OwnerLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OwnerLoop {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        let dropped = self.receiver.len();
        if dropped > 0 {
            tracing::warn!("Owner loop dropped with {} queued messages", dropped);
        } else {
            tracing::debug!("Owner loop shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[test]
    fn test_loop_creation() {
        let owner = OwnerLoop::new();
        assert!(owner.handle().is_owner_thread());
        assert!(owner.handle().is_alive());
        assert_eq!(owner.tasks_run(), 0);
    }

    #[test]
    fn test_tick_runs_posted_tasks() {
        let owner = OwnerLoop::new();
        let counter = Arc::new(AtomicU32::new(0));

        // No tasks initially
        assert!(!owner.tick());

        for i in 0..5 {
            let counter = counter.clone();
            owner.handle().post(move || {
                counter.fetch_add(i, Ordering::SeqCst);
            }).unwrap();
        }

        assert!(owner.tick());
        assert_eq!(counter.load(Ordering::SeqCst), 0 + 1 + 2 + 3 + 4);
        assert_eq!(owner.tasks_run(), 5);
    }

    #[test]
    fn test_fifo_per_poster() {
        let owner = OwnerLoop::new();
        let results = Arc::new(Mutex::new(Vec::new()));

        let handle = owner.handle();
        let poster_results = results.clone();
        thread::spawn(move || {
            for i in 0..100 {
                let results = poster_results.clone();
                handle.post(move || results.lock().unwrap().push(i)).unwrap();
            }
        })
        .join()
        .unwrap();

        owner.run_until_idle();

        let results = results.lock().unwrap();
        assert_eq!(*results, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_post_never_runs_inline() {
        let owner = OwnerLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        owner.handle().post(move || ran_clone.store(true, Ordering::SeqCst)).unwrap();
        assert!(!ran.load(Ordering::SeqCst));

        owner.tick();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_task_panic_isolated() {
        let owner = OwnerLoop::new();
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        owner.handle().post(|| panic!("boom")).unwrap();
        owner.handle().post(move || flag_clone.store(true, Ordering::SeqCst)).unwrap();

        owner.run_until_idle();
        assert!(flag.load(Ordering::SeqCst), "Task after the panic should have run");
    }

    #[test]
    fn test_block_on_immediate() {
        let owner = OwnerLoop::new();
        assert_eq!(owner.block_on(async { 42 }), 42);
    }

    #[test]
    fn test_block_on_with_future_chain() {
        let owner = OwnerLoop::new();
        let result = owner.block_on(async {
            let x = async { 10 }.await;
            let y = async { 20 }.await;
            x + y
        });
        assert_eq!(result, 30);
    }

    #[test]
    fn test_block_on_timeout_expires() {
        let owner = OwnerLoop::new();
        let result = owner.block_on_timeout(futures::future::pending::<()>(), Duration::from_millis(30));
        assert_eq!(result, Err(TimeoutError));
    }

    #[test]
    fn test_run_until_sees_worker_posts() {
        let owner = OwnerLoop::new();
        let counter = Arc::new(AtomicU32::new(0));

        let handle = owner.handle();
        let worker_counter = counter.clone();
        let worker = thread::spawn(move || {
            for _ in 0..10 {
                let counter = worker_counter.clone();
                handle.post(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
        });

        assert!(owner.run_until(|| counter.load(Ordering::SeqCst) == 10, Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn test_handle_fails_after_drop() {
        let owner = OwnerLoop::new();
        let handle = owner.handle();
        drop(owner);

        assert!(!handle.is_alive());
        assert_eq!(handle.post(|| {}), Err(crate::BridgeError::DispatcherClosed));
    }

    #[test]
    fn test_is_owner_thread_on_other_thread() {
        let owner = OwnerLoop::new();
        let handle = owner.handle();
        let on_owner = thread::spawn(move || handle.is_owner_thread()).join().unwrap();
        assert!(!on_owner);
    }
}
