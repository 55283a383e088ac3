//! Process orchestration: spawning, streaming and controlling external commands.
//!
//! [`ProcessController`] keeps at most one live session per terminal slot and
//! fans every [`crate::model::ProcessEvent`] out to its subscribers.

mod buffer;
mod controller;
mod session;
mod signal;

pub use buffer::{OutputBuffer, DEFAULT_CAPACITY};
pub use controller::{ProcessController, ProcessSettings, SessionHandle};

use crate::model::ProcessEvent;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A panicking subscriber must not wedge the controller, so poisoned locks are
/// entered anyway; every critical section leaves the data consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out of process events. Closed receivers are pruned on the next publish.
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ProcessEvent>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<ProcessEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub(crate) fn publish(&self, event: ProcessEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}
