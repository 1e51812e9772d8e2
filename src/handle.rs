//! Thread-safe callback handles
//!
//! A [`ThreadSafeCallbackHandle`] lets any thread call a managed callback
//! that lives on the owner thread. Every clone of a handle points at one
//! shared control block holding:
//!
//! - the id of the callback in the owner thread's registry
//! - a FIFO queue of pending requests
//! - the holder count, the in-flight count and the open/closing/closed phase
//!
//! Each request pushed from a worker thread is paired with one drain task
//! posted to the dispatcher; drain tasks pop from the shared queue, so calls
//! on one handle run in submission order no matter which thread sent them.
//!
//! ## Lifetime
//!
//! Cloning (or [`relocate`](ThreadSafeCallbackHandle::relocate)) bumps the
//! holder count, dropping lowers it. Once no holder is left and no request is
//! in flight, exactly one thread moves the phase to `Closed` and the callback
//! is dropped on the owner thread, followed by the optional finalizer.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use crossbeam_queue::SegQueue;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::config::{UnobservedErrorPolicy, BLOCKING_CALL_POLL_MS};
use crate::dispatcher::{Dispatcher, LocalTask};
use crate::error::{BridgeError, CallbackError, Result};
use crate::runtime_context::{self, CallbackId, Finalizer};

/// Lifecycle phase of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlePhase {
    /// Accepting calls
    Open = 0,
    /// No new calls accepted; queued calls still drain
    Closing = 1,
    /// Callback released; nothing left to run
    Closed = 2,
}

/// Whether `submit` waits for the callback's result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Block the calling thread until the owner thread has run the call
    Blocking,
    /// Return as soon as the call is queued
    NonBlocking,
}

/// What a successful `submit` produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission<R> {
    /// The callback ran and returned this value
    Completed(R),
    /// The call was queued; its result is not observed
    Queued,
}

enum Request<A, R> {
    Call {
        args: A,
        reply: Option<crossbeam_channel::Sender<std::result::Result<R, CallbackError>>>,
    },
    Task(LocalTask),
}

#[derive(Debug)]
struct Counters {
    refs: usize,
    in_flight: usize,
    phase: HandlePhase,
}

impl Counters {
    /// Move to `Closed` if nothing holds or uses the handle any more
    ///
    /// Returns `true` for the single caller that performs the transition.
    fn try_close(&mut self) -> bool {
        if self.refs == 0 && self.in_flight == 0 && self.phase != HandlePhase::Closed {
            self.phase = HandlePhase::Closed;
            true
        } else {
            false
        }
    }
}

struct Shared<A, R> {
    id: CallbackId,
    name: String,
    dispatcher: Arc<dyn Dispatcher>,
    queue: SegQueue<Request<A, R>>,
    counters: Mutex<Counters>,
    policy: UnobservedErrorPolicy,
}

impl<A, R> Shared<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve an in-flight slot for a new request
    ///
    /// Every reserved slot is matched by exactly one queued request, which
    /// gives the slot back once it has run.
    fn begin(&self, allow_closing: bool) -> Result<()> {
        let mut counters = self.counters();
        if !self.dispatcher.is_alive() {
            return Err(BridgeError::DispatcherClosed);
        }
        match counters.phase {
            HandlePhase::Open => {}
            HandlePhase::Closing if allow_closing => {}
            HandlePhase::Closing => return Err(BridgeError::HandleClosing),
            HandlePhase::Closed => return Err(BridgeError::HandleClosed),
        }
        counters.in_flight += 1;
        Ok(())
    }

    /// Post the drain task that will run one queued request
    fn schedule_drain(self: &Arc<Self>) -> Result<()> {
        let shared = self.clone();
        let posted = self.dispatcher.post(Box::new(move || shared.drain_one()));
        if posted.is_err() {
            // The loop died after `begin`. The request stays queued and keeps
            // its slot; `begin` refuses everything from here on, so nothing
            // drains it and the count stays consistent with the queue.
            tracing::warn!("Callback handle '{}' could not reach its owner loop", self.name);
        }
        posted
    }

    fn drain_one(self: &Arc<Self>) {
        if let Some(request) = self.queue.pop() {
            self.run(request);
        }
    }

    fn drain_all(self: &Arc<Self>) {
        while let Some(request) = self.queue.pop() {
            self.run(request);
        }
    }

    /// Run one request on the owner thread
    fn run(self: &Arc<Self>, request: Request<A, R>) {
        match request {
            Request::Call { args, reply } => {
                let result = runtime_context::invoke::<A, R>(self.id, args);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(err) = result {
                            self.on_unobserved_error(err);
                        }
                    }
                }
            }
            Request::Task(task) => {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
                    tracing::error!("Task queued on callback handle '{}' panicked", self.name);
                }
            }
        }

        let close = {
            let mut counters = self.counters();
            counters.in_flight -= 1;
            counters.try_close()
        };
        if close {
            finalize_shared(&**self);
        }
    }

    fn on_unobserved_error(&self, err: CallbackError) {
        match self.policy {
            UnobservedErrorPolicy::AbortProcess => {
                tracing::error!(
                    "Unobserved error in callback '{}': {}; aborting",
                    self.name,
                    err
                );
                std::process::abort();
            }
            UnobservedErrorPolicy::CloseHandle => {
                tracing::error!(
                    "Unobserved error in callback '{}': {}; closing handle",
                    self.name,
                    err
                );
                let mut counters = self.counters();
                if counters.phase == HandlePhase::Open {
                    counters.phase = HandlePhase::Closing;
                }
            }
        }
    }
}

/// Reference-counted handle to a callback living on the owner thread
pub struct ThreadSafeCallbackHandle<A, R> {
    shared: Arc<Shared<A, R>>,
}

impl<A, R> ThreadSafeCallbackHandle<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Register `callback` on the current (owner) thread with default settings
    pub fn new<D, F>(dispatcher: &D, callback: F) -> Result<Self>
    where
        D: Dispatcher + Clone + 'static,
        F: FnMut(A) -> std::result::Result<R, CallbackError> + 'static,
    {
        CallbackBuilder::new().build(dispatcher, callback)
    }

    /// Take another reference to the handle
    ///
    /// Fails with `HandleClosed` if the handle has already fully closed.
    pub fn acquire(&self) -> Result<Self> {
        let mut counters = self.shared.counters();
        if counters.phase == HandlePhase::Closed {
            return Err(BridgeError::HandleClosed);
        }
        counters.refs += 1;
        Ok(Self {
            shared: self.shared.clone(),
        })
    }

    /// Produce a new owning reference to the same control block
    ///
    /// Safe to call while other threads are submitting through their own
    /// references; in-flight calls are unaffected.
    pub fn relocate(&self) -> Self {
        self.shared.counters().refs += 1;
        Self {
            shared: self.shared.clone(),
        }
    }

    /// Give up this reference
    pub fn release(self) {
        drop(self)
    }

    /// Queue a call to the callback
    ///
    /// With [`CallMode::Blocking`] the calling thread waits for the owner
    /// thread to run the callback and gets its result back. A blocking call
    /// made on the owner thread itself first runs every call queued ahead of
    /// it and then invokes the callback directly.
    ///
    /// Fails with `HandleClosing` once closing has begun; callers should
    /// treat that as a cancellation.
    pub fn submit(&self, args: A, mode: CallMode) -> Result<Submission<R>> {
        self.shared.begin(false)?;

        let (reply, receiver) = match mode {
            CallMode::Blocking => {
                let (sender, receiver) = bounded(1);
                (Some(sender), Some(receiver))
            }
            CallMode::NonBlocking => (None, None),
        };
        self.shared.queue.push(Request::Call { args, reply });

        let Some(receiver) = receiver else {
            self.shared.schedule_drain()?;
            return Ok(Submission::Queued);
        };

        if self.shared.dispatcher.is_owner_thread() {
            self.shared.drain_all();
            return match receiver.try_recv() {
                Ok(result) => Ok(Submission::Completed(result?)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    Err(BridgeError::HandleClosed)
                }
            };
        }

        self.shared.schedule_drain()?;
        self.wait_reply(receiver).map(Submission::Completed)
    }

    /// Blocking call; returns the callback's result
    pub fn call(&self, args: A) -> Result<R> {
        match self.submit(args, CallMode::Blocking)? {
            Submission::Completed(value) => Ok(value),
            Submission::Queued => Err(BridgeError::HandleClosed),
        }
    }

    /// Fire-and-forget call
    pub fn post(&self, args: A) -> Result<()> {
        self.submit(args, CallMode::NonBlocking).map(|_| ())
    }

    /// Queue a closure that runs on the owner thread in order with calls
    ///
    /// Accepted while the handle is closing, so work that must happen after
    /// the last call (such as settling a promise) is never lost.
    pub(crate) fn post_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.begin(true)?;
        self.shared.queue.push(Request::Task(Box::new(task)));
        self.shared.schedule_drain()
    }

    fn wait_reply(&self, receiver: Receiver<std::result::Result<R, CallbackError>>) -> Result<R> {
        let poll = Duration::from_millis(BLOCKING_CALL_POLL_MS);
        loop {
            match receiver.recv_timeout(poll) {
                Ok(result) => return result.map_err(BridgeError::Callback),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.shared.dispatcher.is_alive() {
                        return Err(BridgeError::DispatcherClosed);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(BridgeError::DispatcherClosed),
            }
        }
    }

    /// Begin closing the handle
    ///
    /// Queued calls still run; new calls fail with `HandleClosing`. Returns
    /// `true` if this call started the closing phase.
    pub fn close(&self) -> bool {
        let mut counters = self.shared.counters();
        if counters.phase == HandlePhase::Open {
            counters.phase = HandlePhase::Closing;
            tracing::debug!("Callback handle '{}' closing", self.shared.name);
            true
        } else {
            false
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> HandlePhase {
        self.shared.counters().phase
    }

    /// Number of live references
    pub fn ref_count(&self) -> usize {
        self.shared.counters().refs
    }

    /// Number of requests queued or running
    pub fn in_flight(&self) -> usize {
        self.shared.counters().in_flight
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn callback_id(&self) -> CallbackId {
        self.shared.id
    }

    /// A reference that observes the handle without keeping it open
    pub fn downgrade(&self) -> WeakCallbackHandle<A, R> {
        WeakCallbackHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl ThreadSafeCallbackHandle<(), ()> {
    /// Start building a handle with custom settings
    ///
    /// The argument and result types are picked by
    /// [`CallbackBuilder::build`].
    pub fn builder() -> CallbackBuilder {
        CallbackBuilder::new()
    }
}

impl<A, R> Clone for ThreadSafeCallbackHandle<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    fn clone(&self) -> Self {
        self.relocate()
    }
}

impl<A, R> Drop for ThreadSafeCallbackHandle<A, R> {
    fn drop(&mut self) {
        release_shared(&self.shared);
    }
}

// Drop cannot carry the `Send` bounds of the main impl block.
fn release_shared<A, R>(shared: &Arc<Shared<A, R>>) {
    let close = {
        let mut counters = shared
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.refs -= 1;
        counters.try_close()
    };
    if close {
        finalize_shared(&**shared);
    }
}

/// Drop the callback on the owner thread; runs once per handle
fn finalize_shared<A, R>(shared: &Shared<A, R>) {
    let id = shared.id;
    if shared.dispatcher.is_owner_thread() {
        runtime_context::unregister(id);
        tracing::debug!("Callback handle '{}' finalized", shared.name);
        return;
    }

    let name = shared.name.clone();
    let posted = shared.dispatcher.post(Box::new(move || {
        runtime_context::unregister(id);
        tracing::debug!("Callback handle '{}' finalized", name);
    }));
    if posted.is_err() {
        tracing::warn!(
            "Callback handle '{}' closed after its owner loop stopped; callback not finalized",
            shared.name
        );
    }
}

impl<A, R> fmt::Debug for ThreadSafeCallbackHandle<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counters = self
            .shared
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f.debug_struct("ThreadSafeCallbackHandle")
            .field("name", &self.shared.name)
            .field("id", &self.shared.id)
            .field("phase", &counters.phase)
            .field("refs", &counters.refs)
            .field("in_flight", &counters.in_flight)
            .finish()
    }
}

/// Non-owning reference to a callback handle
pub struct WeakCallbackHandle<A, R> {
    shared: Weak<Shared<A, R>>,
}

impl<A, R> WeakCallbackHandle<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Take a strong reference if the handle has not fully closed
    pub fn acquire(&self) -> Result<ThreadSafeCallbackHandle<A, R>> {
        let shared = self.shared.upgrade().ok_or(BridgeError::HandleClosed)?;
        let mut counters = shared.counters();
        if counters.phase == HandlePhase::Closed {
            return Err(BridgeError::HandleClosed);
        }
        counters.refs += 1;
        drop(counters);
        Ok(ThreadSafeCallbackHandle { shared })
    }

    pub fn phase(&self) -> HandlePhase {
        self.shared
            .upgrade()
            .map(|shared| shared.counters().phase)
            .unwrap_or(HandlePhase::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == HandlePhase::Closed
    }
}

impl<A, R> Clone for WeakCallbackHandle<A, R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// A builder for customizing handle properties
pub struct CallbackBuilder {
    name: Option<String>,
    policy: UnobservedErrorPolicy,
    finalizer: Option<Finalizer>,
}

impl CallbackBuilder {
    /// Create a new handle builder
    pub fn new() -> Self {
        Self {
            name: None,
            policy: UnobservedErrorPolicy::default(),
            finalizer: None,
        }
    }

    /// Set the handle name for debugging
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Choose what happens when a fire-and-forget call fails
    pub fn error_policy(mut self, policy: UnobservedErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run `finalizer` on the owner thread once the callback is released
    pub fn finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    /// Register the callback and return the first reference to it
    ///
    /// Must be called on the dispatcher's owner thread.
    pub fn build<A, R, D, F>(self, dispatcher: &D, callback: F) -> Result<ThreadSafeCallbackHandle<A, R>>
    where
        A: Send + 'static,
        R: Send + 'static,
        D: Dispatcher + Clone + 'static,
        F: FnMut(A) -> std::result::Result<R, CallbackError> + 'static,
    {
        self.build_shared(Arc::new(dispatcher.clone()), callback)
    }

    pub(crate) fn build_shared<A, R, F>(
        self,
        dispatcher: Arc<dyn Dispatcher>,
        callback: F,
    ) -> Result<ThreadSafeCallbackHandle<A, R>>
    where
        A: Send + 'static,
        R: Send + 'static,
        F: FnMut(A) -> std::result::Result<R, CallbackError> + 'static,
    {
        if !dispatcher.is_owner_thread() {
            return Err(BridgeError::NotOwnerThread);
        }
        if !dispatcher.is_alive() {
            return Err(BridgeError::DispatcherClosed);
        }

        let id = runtime_context::register::<A, R>(Box::new(callback), self.finalizer);
        let name = self
            .name
            .unwrap_or_else(|| format!("callback-{}", id.as_u64()));
        tracing::debug!("Callback handle '{}' created", name);

        Ok(ThreadSafeCallbackHandle {
            shared: Arc::new(Shared {
                id,
                name,
                dispatcher,
                queue: SegQueue::new(),
                counters: Mutex::new(Counters {
                    refs: 1,
                    in_flight: 0,
                    phase: HandlePhase::Open,
                }),
                policy: self.policy,
            }),
        })
    }
}

impl Default for CallbackBuilder {
    fn default() -> Self {
        Self::new()
    }
}
