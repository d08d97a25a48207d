//! Error types for the bridge.
//!
//! Three families, kept apart on purpose:
//!
//! - [`RequestError`]: a request finished unsuccessfully. Delivered to the
//!   application through its `PendingFuture`, exactly like a success.
//! - [`BridgeError`]: the bridge itself could not do what was asked
//!   (initialization, submission, use after shutdown).
//! - [`ConsistencyError`]: the handoff's bookkeeping is broken. Never returned
//!   to application code; see [`ConsistencyError::raise`].

use std::io;

use thiserror::Error;

use crate::types::{BoxError, RequestHandle};

/// Failure of an individual request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The engine ran the request and it failed.
    #[error("request failed: {0}")]
    Failed(#[source] BoxError),

    /// The request was cancelled before it finished.
    #[error("request cancelled")]
    Cancelled,

    /// The engine dropped the request without producing an outcome
    /// (e.g. its worker pool was shut down).
    #[error("engine dropped the request without completing it")]
    Dropped,
}

impl RequestError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        RequestError::Failed(err.into())
    }
}

/// Reason an engine refused a request.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("engine is shut down")]
    ShutDown,

    #[error("engine rejected the request: {0}")]
    Rejected(#[source] BoxError),
}

/// Error returned by bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The wakeup pipe could not be created.
    #[error("could not create wakeup channel: {0}")]
    ChannelCreate(#[source] io::Error),

    /// The host loop refused to watch the wakeup channel.
    #[error("could not register wakeup watcher: {0}")]
    Watch(#[source] io::Error),

    /// Called re-entrantly while the bridge is still being initialized.
    #[error("bridge is still initializing")]
    Initializing,

    #[error("engine refused {handle}: {source}")]
    Submit {
        handle: RequestHandle,
        #[source]
        source: SubmitError,
    },

    #[error("bridge has been shut down")]
    ShutDown,
}

/// Broken invariant in the handle/future bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("unknown request handle {0}")]
    UnknownHandle(RequestHandle),

    #[error("request handle {0} registered twice")]
    DuplicateHandle(RequestHandle),

    #[error("request {0} resolved more than once")]
    AlreadyResolved(RequestHandle),
}

impl ConsistencyError {
    /// Report the violation and panic.
    ///
    /// A consistency failure means an outcome was delivered for a handle the
    /// bridge never issued, or delivered twice. Continuing would resolve the
    /// wrong future, so the current operation is torn down loudly.
    #[cold]
    #[track_caller]
    pub fn raise(self) -> ! {
        log::error!("bridge consistency failure: {self}");
        panic!("bridge consistency failure: {self}");
    }
}
