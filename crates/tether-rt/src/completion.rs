//! Completion queue: finished outcomes waiting for the host thread.
//!
//! Producers are the engine's worker threads; the only consumer is the
//! bridge's drain routine on the host thread. A mutex-guarded `Vec` is
//! enough: every critical section is one push or one swap.
//!
//! `None` in the slot means the queue was closed by shutdown. A completion
//! arriving after that raced past shutdown and is a bug in the engine.

use std::sync::Arc;

use crate::error::RequestError;
use crate::sync::{lock, Mutex};
use crate::types::{Outcome, RequestHandle};
use crate::wakeup::WakeupChannel;

pub struct CompletionQueue<T> {
    slots: Mutex<Option<Vec<(RequestHandle, Outcome<T>)>>>,
}

impl<T> CompletionQueue<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Some(Vec::new())),
        }
    }

    /// Queue an outcome. Panics if the queue has been closed.
    pub fn push(&self, handle: RequestHandle, outcome: Outcome<T>) {
        if self.try_push(handle, outcome).is_err() {
            panic!("completion for {handle} pushed after the completion queue was closed");
        }
    }

    /// Queue an outcome unless the queue is closed, in which case it is
    /// handed back.
    pub fn try_push(
        &self,
        handle: RequestHandle,
        outcome: Outcome<T>,
    ) -> Result<(), (RequestHandle, Outcome<T>)> {
        let mut slots = lock(&self.slots);
        match slots.as_mut() {
            Some(queue) => {
                queue.push((handle, outcome));
                Ok(())
            }
            None => Err((handle, outcome)),
        }
    }

    /// Remove and return everything queued right now. No ordering is promised
    /// between different handles.
    pub fn drain_all(&self) -> Vec<(RequestHandle, Outcome<T>)> {
        let mut slots = lock(&self.slots);
        match slots.as_mut() {
            Some(queue) => std::mem::take(queue),
            None => Vec::new(),
        }
    }

    /// Tear the queue down. Returns whatever was still undelivered.
    pub fn close(&self) -> Vec<(RequestHandle, Outcome<T>)> {
        lock(&self.slots).take().unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.slots).is_none()
    }

    pub fn contains(&self, handle: RequestHandle) -> bool {
        lock(&self.slots)
            .as_ref()
            .is_some_and(|queue| queue.iter().any(|(h, _)| *h == handle))
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for CompletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Completer: the worker-side half of one request
// =============================================================================

/// One-shot handle an engine uses to report a request's outcome.
///
/// `complete` pushes the outcome and signals the wakeup channel; it consumes
/// the completer so a request cannot be completed twice. A completer dropped
/// without completing reports [`RequestError::Dropped`], unless the queue is
/// already closed, in which case the request is silently abandoned.
pub struct Completer<T> {
    handle: RequestHandle,
    queue: Arc<CompletionQueue<T>>,
    channel: Arc<WakeupChannel>,
    done: bool,
}

impl<T> Completer<T> {
    pub(crate) fn new(
        handle: RequestHandle,
        queue: Arc<CompletionQueue<T>>,
        channel: Arc<WakeupChannel>,
    ) -> Self {
        Self {
            handle,
            queue,
            channel,
            done: false,
        }
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    pub fn complete(mut self, outcome: Outcome<T>) {
        self.done = true;
        self.queue.push(self.handle, outcome);
        self.channel.signal();
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        match self.queue.try_push(self.handle, Err(RequestError::Dropped)) {
            Ok(()) => self.channel.signal(),
            Err(_) => log::trace!("{} abandoned after shutdown", self.handle),
        }
    }
}

impl<T> std::fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer").field("handle", &self.handle).finish()
    }
}
