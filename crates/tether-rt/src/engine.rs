//! Native-engine collaborator contract.
//!
//! An engine runs requests on its own threads and reports each outcome
//! through the [`Completer`] it was handed at submission. The operation set
//! is fixed: submit, cancel, query, shutdown.

use crate::completion::Completer;
use crate::error::SubmitError;
use crate::types::{RequestHandle, RequestStatus};

pub trait Engine {
    /// What the application hands to [`Bridge::issue`](crate::Bridge::issue).
    type Request;
    /// Successful payload of a request.
    type Response: Send + 'static;

    /// Start `request`. Must return before the request completes.
    ///
    /// The engine guarantees that `completer` is eventually completed or
    /// dropped, exactly once. When returning an error the engine drops the
    /// completer, which delivers [`RequestError::Dropped`] to the future.
    ///
    /// [`RequestError::Dropped`]: crate::RequestError::Dropped
    fn submit(
        &self,
        request: Self::Request,
        completer: Completer<Self::Response>,
    ) -> Result<(), SubmitError>;

    /// Best-effort cancellation. A cancelled request still yields exactly one
    /// outcome, normally [`RequestError::Cancelled`](crate::RequestError::Cancelled).
    /// Returns false if the engine no longer knows the request.
    fn cancel(&self, handle: RequestHandle) -> bool;

    /// Engine-side view of a request: `InFlight` while it runs, `Completed`
    /// if the engine knows it finished, `Unknown` otherwise.
    fn query(&self, handle: RequestHandle) -> RequestStatus;

    /// Stop the worker pool. Requests it drops report `Dropped`.
    fn shutdown(&self) {}
}
