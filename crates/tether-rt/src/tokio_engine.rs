//! Native engine backed by a tokio multi-thread runtime.
//!
//! Requests are boxed `Send` futures. Each one runs as a tokio task raced
//! against a cancellation signal; whichever finishes first produces the
//! outcome that goes through the request's [`Completer`].
//!
//! Completion is gated: a task completes only while holding the gate open
//! for reading, and shutdown closes it for writing before stopping the
//! runtime. A worker still stuck in a poll after the shutdown timeout finds
//! the gate closed and drops its completer instead of completing.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;

use crate::completion::Completer;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{RequestError, SubmitError};
use crate::types::{BoxError, RequestHandle, RequestStatus};

/// A request for [`TokioEngine`].
pub type BoxRequest<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send + 'static>>;

/// Box any fallible `Send` future as a [`BoxRequest`].
pub fn request<T, E, F>(future: F) -> BoxRequest<T>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
{
    Box::pin(async move { future.await.map_err(Into::into) })
}

type CancelMap = HashMap<RequestHandle, oneshot::Sender<()>>;

pub struct TokioEngine<T> {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    in_flight: Arc<Mutex<CancelMap>>,
    // `true` while completions may still reach the queue.
    gate: Arc<RwLock<bool>>,
    shutdown_timeout: Duration,
    _response: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> TokioEngine<T> {
    pub fn new() -> io::Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> io::Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name(config.thread_name.clone());
        if let Some(threads) = config.worker_threads {
            builder.worker_threads(threads);
        }
        let runtime = builder.build()?;
        let handle = runtime.handle().clone();
        log::debug!(
            "tokio engine started (workers={:?}, name={})",
            config.worker_threads,
            config.thread_name
        );

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            gate: Arc::new(RwLock::new(true)),
            shutdown_timeout: config.shutdown_timeout,
            _response: PhantomData,
        })
    }

    /// Handle to the worker runtime, for spawning helpers next to requests.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Number of requests currently running on the workers.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.runtime).is_none()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send + 'static> Engine for TokioEngine<T> {
    type Request = BoxRequest<T>;
    type Response = T;

    fn submit(&self, request: BoxRequest<T>, completer: Completer<T>) -> Result<(), SubmitError> {
        if self.is_shut_down() {
            return Err(SubmitError::ShutDown);
        }

        let handle = completer.handle();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        lock(&self.in_flight).insert(handle, cancel_tx);

        let in_flight = Arc::clone(&self.in_flight);
        let gate = Arc::clone(&self.gate);
        self.handle.spawn(async move {
            let outcome = tokio::select! {
                result = request => result.map_err(RequestError::Failed),
                _ = cancel_rx => Err(RequestError::Cancelled),
            };
            lock(&in_flight).remove(&handle);

            let open = gate.read().unwrap_or_else(PoisonError::into_inner);
            if *open {
                completer.complete(outcome);
            } else {
                log::trace!("{handle} finished after engine shutdown; outcome dropped");
                drop(completer);
            }
        });
        Ok(())
    }

    fn cancel(&self, handle: RequestHandle) -> bool {
        match lock(&self.in_flight).remove(&handle) {
            Some(cancel) => cancel.send(()).is_ok(),
            None => false,
        }
    }

    fn query(&self, handle: RequestHandle) -> RequestStatus {
        if lock(&self.in_flight).contains_key(&handle) {
            RequestStatus::InFlight
        } else {
            RequestStatus::Unknown
        }
    }

    fn shutdown(&self) {
        let Some(runtime) = lock(&self.runtime).take() else {
            return;
        };
        // Waits for completions in progress; none start afterwards.
        *self.gate.write().unwrap_or_else(PoisonError::into_inner) = false;

        let running = self.in_flight();
        // Tasks still queued are dropped here; their completers report
        // `Dropped` while the bridge's queue is still open.
        runtime.shutdown_timeout(self.shutdown_timeout);
        log::debug!("tokio engine shut down ({running} requests were running)");
    }
}

impl<T> std::fmt::Debug for TokioEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioEngine")
            .field("in_flight", &lock(&self.in_flight).len())
            .finish()
    }
}
