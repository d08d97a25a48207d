//! Plain data types shared by the bridge, engines and host loops.

use std::fmt;

use crate::error::RequestError;
use crate::sync::{AtomicU64, Ordering};

/// Result of one request: the engine's response or the reason it failed.
pub type Outcome<T> = Result<T, RequestError>;

/// Boxed error used for request failures reported by an engine.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Request handles
// =============================================================================

/// Opaque token identifying one in-flight request.
///
/// Handles are allocated by the bridge when a request is issued and are never
/// reused for the lifetime of the bridge that issued them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(u64);

impl RequestHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Monotonic source of [`RequestHandle`]s. Starts at 1; 0 is never handed out.
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> RequestHandle {
        RequestHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Host-loop and status types
// =============================================================================

/// Identifies a readiness watcher installed in the host loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatcherId(pub usize);

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watcher#{}", self.0)
    }
}

/// Where a request currently is, as seen from the host thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// Never issued, already resolved, or abandoned by shutdown.
    Unknown,
    /// Submitted to the engine and not finished yet.
    InFlight,
    /// Finished by the engine; the outcome waits for the next drain.
    Completed,
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique_and_nonzero() {
        let alloc = HandleAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert_ne!(a, b);
        assert_eq!(a.into_raw(), 1);
        assert_eq!(RequestHandle::from_raw(b.into_raw()), b);
    }

    #[test]
    fn handle_display() {
        assert_eq!(RequestHandle::from_raw(7).to_string(), "req#7");
        assert_eq!(WatcherId(3).to_string(), "watcher#3");
    }
}
