//! The bridge façade: issue requests, drain completions, manage references.
//!
//! A [`Bridge`] lives on the host thread. It owns the engine, the host loop
//! handle, the completion queue and the registry. Worker threads only ever
//! touch the queue and the wakeup channel through a [`Completer`]; every
//! future is resolved inside [`Bridge::drain`], which the host runs when the
//! channel turns readable.
//!
//! Lost wakeups are ruled out by ordering: a worker pushes, then signals; the
//! drain clears the channel, then empties the queue. A push that lands after
//! the clear re-arms the channel and produces another drain.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use crate::completion::{CompletionQueue, Completer};
use crate::config::BridgeConfig;
use crate::engine::Engine;
use crate::error::BridgeError;
use crate::host::HostLoop;
use crate::lifecycle::{EngineLifecycle, InitStatus, LifecycleState};
use crate::registry::{self, PendingFuture, RequestRegistry};
use crate::types::{HandleAllocator, RequestHandle, RequestStatus};
use crate::wakeup::WakeupChannel;

/// Cross-runtime bridge between a host event loop and a native engine.
///
/// Cloning is cheap and yields another handle to the same bridge. The last
/// handle to go away shuts the bridge down.
pub struct Bridge<E: Engine, H: HostLoop> {
    inner: Rc<Inner<E, H>>,
}

struct Inner<E: Engine, H: HostLoop> {
    engine: E,
    host: H,
    lifecycle: EngineLifecycle,
    handles: HandleAllocator,
    queue: Arc<CompletionQueue<E::Response>>,
    channel: RefCell<Option<Arc<WakeupChannel>>>,
    registry: RefCell<RequestRegistry<E::Response>>,
}

impl<E, H> Bridge<E, H>
where
    E: Engine + 'static,
    H: HostLoop + 'static,
{
    pub fn new(engine: E, host: H) -> Self {
        Self::with_config(engine, host, BridgeConfig::default())
    }

    pub fn with_config(engine: E, host: H, config: BridgeConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                engine,
                host,
                lifecycle: EngineLifecycle::new(config.start_referenced),
                handles: HandleAllocator::new(),
                queue: Arc::new(CompletionQueue::new()),
                channel: RefCell::new(None),
                registry: RefCell::new(RequestRegistry::new()),
            }),
        }
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Create the wakeup channel and register it with the host, once.
    ///
    /// Safe to call any number of times, including from inside host
    /// callbacks; only the first successful call touches the host. On failure
    /// nothing is registered and a later call retries.
    pub fn initialize(&self) -> Result<InitStatus, BridgeError> {
        let inner = &self.inner;
        let status = inner.lifecycle.init(|| {
            let channel = Arc::new(WakeupChannel::new().map_err(BridgeError::ChannelCreate)?);
            let weak = Rc::downgrade(inner);
            let watcher = inner
                .host
                .watch(
                    channel.as_raw_fd(),
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.drain();
                        }
                    }),
                )
                .map_err(BridgeError::Watch)?;
            *inner.channel.borrow_mut() = Some(channel);
            Ok(watcher)
        })?;

        if status == InitStatus::Terminated {
            return Err(BridgeError::ShutDown);
        }
        inner.sync_reference();
        Ok(status)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Hand `request` to the engine and return a future for its outcome.
    ///
    /// Initializes the bridge on first use. Returns before the request
    /// completes; the future resolves during a later drain.
    pub fn issue(&self, request: E::Request) -> Result<PendingFuture<E::Response>, BridgeError> {
        self.initialize()?;
        let inner = &self.inner;
        let channel = inner
            .channel
            .borrow()
            .clone()
            .ok_or(BridgeError::Initializing)?;

        let handle = inner.handles.next();
        let (future, back_ref) = registry::pending(handle);
        if let Err(err) = inner.registry.borrow_mut().register(handle, back_ref) {
            err.raise();
        }

        let completer = Completer::new(handle, Arc::clone(&inner.queue), channel);
        let submitted = inner.engine.submit(request, completer);
        inner.sync_reference();

        match submitted {
            Ok(()) => {
                log::trace!("issued {handle}");
                Ok(future)
            }
            // The engine dropped the completer, so `Dropped` is already
            // queued and the next drain clears the registry entry.
            Err(source) => {
                log::debug!("engine refused {handle}: {source}");
                Err(BridgeError::Submit { handle, source })
            }
        }
    }

    /// Deliver every queued completion. Returns how many were delivered.
    ///
    /// The host calls this when the channel is readable; calling it at any
    /// other time is harmless.
    pub fn drain(&self) -> usize {
        self.inner.drain()
    }

    /// Ask the engine to stop a request early. The future still resolves
    /// exactly once, usually with [`RequestError::Cancelled`](crate::RequestError::Cancelled).
    pub fn cancel(&self, handle: RequestHandle) -> bool {
        if !self.inner.registry.borrow().contains(handle) {
            return false;
        }
        self.inner.engine.cancel(handle)
    }

    pub fn status(&self, handle: RequestHandle) -> RequestStatus {
        let inner = &self.inner;
        if !inner.registry.borrow().contains(handle) {
            return RequestStatus::Unknown;
        }
        if inner.queue.contains(handle) {
            return RequestStatus::Completed;
        }
        match inner.engine.query(handle) {
            RequestStatus::Completed => RequestStatus::Completed,
            _ => RequestStatus::InFlight,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.registry.borrow().pending_count()
    }

    // =========================================================================
    // Reference state
    // =========================================================================

    /// Let pending requests keep the host loop alive (the default).
    pub fn reference(&self) {
        let pending = self.pending_count();
        self.inner.lifecycle.reference(&self.inner.host, pending);
    }

    /// Let the host loop exit even while requests are pending. Requests keep
    /// running and are still delivered if the loop drains again.
    pub fn unreference(&self) {
        let pending = self.pending_count();
        self.inner.lifecycle.unreference(&self.inner.host, pending);
    }

    /// Whether pending requests are allowed to keep the host alive.
    pub fn is_referenced(&self) -> bool {
        self.inner.lifecycle.is_referenced()
    }

    /// Whether the watcher currently keeps the host alive.
    pub fn keeps_host_alive(&self) -> bool {
        self.inner.lifecycle.host_referenced()
    }

    // =========================================================================
    // Accessors and teardown
    // =========================================================================

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn engine(&self) -> &E {
        &self.inner.engine
    }

    pub fn host(&self) -> &H {
        &self.inner.host
    }

    /// Read end of the wakeup channel, once initialized.
    pub fn readiness_fd(&self) -> Option<RawFd> {
        self.inner
            .channel
            .borrow()
            .as_ref()
            .map(|channel| channel.as_raw_fd())
    }

    /// Tear the bridge down: remove the watcher, stop the engine and abandon
    /// every pending future. Returns how many futures were abandoned.
    pub fn shutdown(&self) -> usize {
        self.inner.shutdown()
    }
}

impl<E: Engine, H: HostLoop> Inner<E, H> {
    fn drain(&self) -> usize {
        let channel = self.channel.borrow().clone();
        if let Some(channel) = channel {
            channel.drain();
        }

        let batch = self.queue.drain_all();
        if batch.is_empty() {
            log::trace!("spurious wakeup, nothing to drain");
            return 0;
        }

        let count = batch.len();
        for (handle, outcome) in batch {
            // Resolve outside the registry borrow: wakers may issue requests.
            let back_ref = self
                .registry
                .borrow_mut()
                .take(handle)
                .unwrap_or_else(|err| err.raise());
            if !back_ref.resolve(outcome).unwrap_or_else(|err| err.raise()) {
                log::trace!("{handle} completed after its future was dropped");
            }
        }
        log::trace!("drained {count} completions");

        self.sync_reference();
        count
    }

    fn sync_reference(&self) {
        let pending = self.registry.borrow().pending_count();
        self.lifecycle.sync(&self.host, pending);
    }

    fn shutdown(&self) -> usize {
        let watcher = match self.lifecycle.begin_shutdown() {
            Ok(watcher) => watcher,
            Err(state) => {
                log::debug!("shutdown skipped, lifecycle is {state:?}");
                return 0;
            }
        };

        if let Some(watcher) = watcher {
            if self.lifecycle.host_referenced() {
                self.host.unreference(watcher);
            }
            self.host.cancel(watcher);
        }

        // Engine first so completers it drops still find the queue open.
        self.engine.shutdown();
        let undelivered = self.queue.close();
        let abandoned = self.registry.borrow_mut().abandon_all();
        self.channel.borrow_mut().take();
        self.lifecycle.finish_shutdown();

        log::debug!(
            "bridge shut down: {abandoned} pending abandoned, {} undelivered discarded",
            undelivered.len()
        );
        abandoned
    }
}

impl<E: Engine, H: HostLoop> Drop for Inner<E, H> {
    fn drop(&mut self) {
        if self.lifecycle.state() != LifecycleState::Terminated {
            self.shutdown();
        }
    }
}

impl<E: Engine, H: HostLoop> Clone for Bridge<E, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E: Engine, H: HostLoop> std::fmt::Debug for Bridge<E, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("lifecycle", &self.inner.lifecycle)
            .field("pending", &self.inner.registry.borrow().pending_count())
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}
