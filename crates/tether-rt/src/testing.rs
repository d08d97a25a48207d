//! Test doubles for both collaborators.
//!
//! [`ManualEngine`] keeps every completer it is handed until the test decides
//! how the request ends. [`MockHost`] records watchers and fires their
//! callbacks only when told to, so a test controls exactly when the bridge
//! drains.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::completion::Completer;
use crate::engine::Engine;
use crate::error::{RequestError, SubmitError};
use crate::host::{HostLoop, ReadableCallback};
use crate::types::{BoxError, Outcome, RequestHandle, RequestStatus, WatcherId};

// =============================================================================
// ManualEngine
// =============================================================================

struct ManualState<T> {
    running: HashMap<RequestHandle, Completer<T>>,
    finished: HashSet<RequestHandle>,
    submitted: usize,
    reject_next: bool,
    shut_down: bool,
}

/// Engine whose requests finish only when the test completes them.
///
/// Clones share state, so a clone can be moved to another thread to play the
/// part of a worker.
pub struct ManualEngine<T> {
    state: Arc<Mutex<ManualState<T>>>,
}

impl<T> ManualEngine<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                running: HashMap::new(),
                finished: HashSet::new(),
                submitted: 0,
                reject_next: false,
                shut_down: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManualState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finish a running request. Returns false if the handle is not running.
    pub fn complete(&self, handle: RequestHandle, outcome: Outcome<T>) -> bool {
        let completer = {
            let mut state = self.state();
            let completer = state.running.remove(&handle);
            if completer.is_some() {
                state.finished.insert(handle);
            }
            completer
        };
        match completer {
            Some(completer) => {
                completer.complete(outcome);
                true
            }
            None => false,
        }
    }

    pub fn succeed(&self, handle: RequestHandle, value: T) -> bool {
        self.complete(handle, Ok(value))
    }

    pub fn fail(&self, handle: RequestHandle, err: impl Into<BoxError>) -> bool {
        self.complete(handle, Err(RequestError::failed(err)))
    }

    /// Drop the completer without completing, as a crashed worker would.
    pub fn abandon(&self, handle: RequestHandle) -> bool {
        let completer = self.state().running.remove(&handle);
        completer.is_some()
    }

    /// Make the next `submit` fail with [`SubmitError::Rejected`].
    pub fn reject_next(&self) {
        self.state().reject_next = true;
    }

    /// Handles still running, in issue order.
    pub fn running(&self) -> Vec<RequestHandle> {
        let mut handles: Vec<_> = self.state().running.keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn submitted(&self) -> usize {
        self.state().submitted
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }
}

impl<T> Clone for ManualEngine<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for ManualEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Engine for ManualEngine<T> {
    type Request = ();
    type Response = T;

    fn submit(&self, _request: (), completer: Completer<T>) -> Result<(), SubmitError> {
        let mut state = self.state();
        if state.shut_down {
            return Err(SubmitError::ShutDown);
        }
        if std::mem::take(&mut state.reject_next) {
            return Err(SubmitError::Rejected("rejected by manual engine".into()));
        }
        state.submitted += 1;
        state.running.insert(completer.handle(), completer);
        Ok(())
    }

    fn cancel(&self, handle: RequestHandle) -> bool {
        self.complete(handle, Err(RequestError::Cancelled))
    }

    fn query(&self, handle: RequestHandle) -> RequestStatus {
        let state = self.state();
        if state.running.contains_key(&handle) {
            RequestStatus::InFlight
        } else if state.finished.contains(&handle) {
            RequestStatus::Completed
        } else {
            RequestStatus::Unknown
        }
    }

    fn shutdown(&self) {
        let dropped: Vec<_> = {
            let mut state = self.state();
            state.shut_down = true;
            state.running.drain().map(|(_, completer)| completer).collect()
        };
        // Completers report `Dropped` outside the lock.
        drop(dropped);
    }
}

// =============================================================================
// MockHost
// =============================================================================

struct MockWatcher {
    fd: RawFd,
    callback: Option<ReadableCallback>,
    referenced: bool,
    cancelled: bool,
}

/// Host loop that never polls on its own.
#[derive(Default)]
pub struct MockHost {
    watchers: RefCell<Vec<MockWatcher>>,
    fail_next_watch: Cell<bool>,
    reference_calls: Cell<usize>,
    unreference_calls: Cell<usize>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `watch` call fail.
    pub fn fail_next_watch(&self) {
        self.fail_next_watch.set(true);
    }

    pub fn watch_count(&self) -> usize {
        self.watchers.borrow().len()
    }

    pub fn is_referenced(&self, watcher: WatcherId) -> bool {
        self.watchers
            .borrow()
            .get(watcher.0)
            .is_some_and(|w| w.referenced && !w.cancelled)
    }

    pub fn is_cancelled(&self, watcher: WatcherId) -> bool {
        self.watchers
            .borrow()
            .get(watcher.0)
            .is_some_and(|w| w.cancelled)
    }

    /// Number of live watchers that would keep a real loop running.
    pub fn referenced_count(&self) -> usize {
        self.watchers
            .borrow()
            .iter()
            .filter(|w| w.referenced && !w.cancelled)
            .count()
    }

    /// `(reference, unreference)` calls seen so far.
    pub fn reference_calls(&self) -> (usize, usize) {
        (self.reference_calls.get(), self.unreference_calls.get())
    }

    /// Whether the watched descriptor currently polls readable.
    pub fn is_readable(&self, watcher: WatcherId) -> bool {
        let Some(fd) = self.watchers.borrow().get(watcher.0).map(|w| w.fd) else {
            return false;
        };
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pollfd, 1, 0) };
        n == 1 && pollfd.revents & libc::POLLIN != 0
    }

    /// Run a watcher's callback whether or not its descriptor is readable.
    /// Returns false for unknown or cancelled watchers.
    pub fn fire(&self, watcher: WatcherId) -> bool {
        let callback = {
            let mut watchers = self.watchers.borrow_mut();
            match watchers.get_mut(watcher.0) {
                Some(w) if !w.cancelled => w.callback.take(),
                _ => None,
            }
        };
        let Some(mut callback) = callback else {
            return false;
        };

        callback();

        let mut watchers = self.watchers.borrow_mut();
        if let Some(w) = watchers.get_mut(watcher.0) {
            if !w.cancelled && w.callback.is_none() {
                w.callback = Some(callback);
            }
        }
        true
    }

    /// Fire every live watcher whose descriptor is readable, like one turn of
    /// a real loop. Returns how many fired.
    pub fn turn(&self) -> usize {
        let ids: Vec<_> = (0..self.watch_count()).map(WatcherId).collect();
        ids.into_iter()
            .filter(|&id| self.is_readable(id) && self.fire(id))
            .count()
    }
}

impl HostLoop for MockHost {
    fn watch(&self, fd: RawFd, on_readable: ReadableCallback) -> io::Result<WatcherId> {
        if self.fail_next_watch.replace(false) {
            return Err(io::Error::new(io::ErrorKind::Other, "watch refused by mock host"));
        }
        let mut watchers = self.watchers.borrow_mut();
        watchers.push(MockWatcher {
            fd,
            callback: Some(on_readable),
            referenced: true,
            cancelled: false,
        });
        Ok(WatcherId(watchers.len() - 1))
    }

    fn reference(&self, watcher: WatcherId) {
        self.reference_calls.set(self.reference_calls.get() + 1);
        if let Some(w) = self.watchers.borrow_mut().get_mut(watcher.0) {
            w.referenced = true;
        }
    }

    fn unreference(&self, watcher: WatcherId) {
        self.unreference_calls.set(self.unreference_calls.get() + 1);
        if let Some(w) = self.watchers.borrow_mut().get_mut(watcher.0) {
            w.referenced = false;
        }
    }

    fn cancel(&self, watcher: WatcherId) {
        let callback = self
            .watchers
            .borrow_mut()
            .get_mut(watcher.0)
            .and_then(|w| {
                w.cancelled = true;
                w.callback.take()
            });
        drop(callback);
    }
}
