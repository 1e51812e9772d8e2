//! Owner-thread dispatch contract
//!
//! A [`Dispatcher`] schedules tasks to run later on a single owner thread.
//! Handles and jobs only depend on this trait; [`LoopHandle`] is the
//! implementation backed by an [`OwnerLoop`](crate::executor::OwnerLoop).

use crossbeam_channel::Sender;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::error::{BridgeError, Result};

/// A unit of work posted to the owner thread
pub type LocalTask = Box<dyn FnOnce() + Send + 'static>;

/// Schedules tasks onto the owner thread
///
/// Implementations must run posted tasks later, on the owner thread, in the
/// order each poster submitted them. `post` never runs the task synchronously
/// on the calling thread.
pub trait Dispatcher: Send + Sync {
    /// Schedule `task` to run on the owner thread
    fn post(&self, task: LocalTask) -> Result<()>;

    /// Whether the calling thread is the owner thread
    fn is_owner_thread(&self) -> bool;

    /// Whether posted tasks can still run
    fn is_alive(&self) -> bool;
}

/// Messages processed by the owner loop
pub(crate) enum LoopMessage {
    /// Run a posted task
    Task(LocalTask),
    /// Re-poll the future passed to `block_on`
    Wake,
}

impl fmt::Debug for LoopMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMessage::Task(_) => f.debug_tuple("Task").field(&"<FnOnce>").finish(),
            LoopMessage::Wake => write!(f, "Wake"),
        }
    }
}

/// Cloneable, thread-safe handle for posting work to an owner loop
#[derive(Clone)]
pub struct LoopHandle {
    sender: Sender<LoopMessage>,
    owner: ThreadId,
    alive: Arc<AtomicBool>,
}

impl LoopHandle {
    pub(crate) fn new(sender: Sender<LoopMessage>, owner: ThreadId, alive: Arc<AtomicBool>) -> Self {
        Self {
            sender,
            owner,
            alive,
        }
    }

    /// Post a closure to run on the owner thread
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        Dispatcher::post(self, Box::new(task))
    }

    /// The owner thread of the loop behind this handle
    pub fn owner_thread(&self) -> ThreadId {
        self.owner
    }

    /// Number of messages waiting in the loop's inbox
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    pub(crate) fn wake(&self) {
        let _ = self.sender.send(LoopMessage::Wake);
    }

    /// Share this handle as a trait object
    pub fn as_dispatcher(&self) -> Arc<dyn Dispatcher> {
        Arc::new(self.clone())
    }
}

impl Dispatcher for LoopHandle {
    fn post(&self, task: LocalTask) -> Result<()> {
        if !self.is_alive() {
            return Err(BridgeError::DispatcherClosed);
        }
        self.sender
            .send(LoopMessage::Task(task))
            .map_err(|_| BridgeError::DispatcherClosed)
    }

    fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("owner", &self.owner)
            .field("alive", &self.is_alive())
            .field("pending", &self.pending())
            .finish()
    }
}
