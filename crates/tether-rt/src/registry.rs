//! Request registry: handle → host-visible future.
//!
//! The application owns the [`PendingFuture`]; the registry keeps only a
//! [`FutureRef`], a weak back-reference that lets the drain routine deliver
//! the outcome without keeping the future alive. If the application drops
//! the future first, its outcome is discarded when it arrives.
//!
//! Everything here lives on the host thread (`Rc`/`RefCell`, not `Send`).

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::ConsistencyError;
use crate::types::{Outcome, RequestHandle};

enum SlotState<T> {
    Pending,
    Ready(Outcome<T>),
    Taken,
}

struct Slot<T> {
    state: SlotState<T>,
    waker: Option<Waker>,
}

/// Create an unresolved future and the registry's back-reference to it.
pub fn pending<T>(handle: RequestHandle) -> (PendingFuture<T>, FutureRef<T>) {
    let slot = Rc::new(RefCell::new(Slot {
        state: SlotState::Pending,
        waker: None,
    }));
    let weak = Rc::downgrade(&slot);
    (
        PendingFuture { handle, slot },
        FutureRef { handle, slot: weak },
    )
}

// =============================================================================
// PendingFuture
// =============================================================================

/// Placeholder for a request that has not completed yet.
///
/// Resolves to the request's [`Outcome`]. Dropping it detaches the request:
/// the engine keeps working and the outcome is thrown away on delivery.
pub struct PendingFuture<T> {
    handle: RequestHandle,
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> PendingFuture<T> {
    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// True once the outcome has been delivered (taken or not).
    pub fn is_resolved(&self) -> bool {
        !matches!(self.slot.borrow().state, SlotState::Pending)
    }

    /// Take the outcome without awaiting, if it has been delivered.
    pub fn try_take(&mut self) -> Option<Outcome<T>> {
        let mut slot = self.slot.borrow_mut();
        match std::mem::replace(&mut slot.state, SlotState::Taken) {
            SlotState::Ready(outcome) => Some(outcome),
            other => {
                slot.state = other;
                None
            }
        }
    }
}

impl<T> Future for PendingFuture<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match std::mem::replace(&mut slot.state, SlotState::Taken) {
            SlotState::Ready(outcome) => Poll::Ready(outcome),
            SlotState::Pending => {
                slot.state = SlotState::Pending;
                match &mut slot.waker {
                    Some(existing) => existing.clone_from(cx.waker()),
                    None => slot.waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
            SlotState::Taken => panic!("PendingFuture for {} polled after completion", self.handle),
        }
    }
}

impl<T> std::fmt::Debug for PendingFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingFuture")
            .field("handle", &self.handle)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

// =============================================================================
// FutureRef
// =============================================================================

/// Non-owning back-reference to a [`PendingFuture`].
pub struct FutureRef<T> {
    handle: RequestHandle,
    slot: Weak<RefCell<Slot<T>>>,
}

impl<T> FutureRef<T> {
    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// Deliver the outcome and wake whoever awaits the future.
    ///
    /// Returns `Ok(false)` if the future was already dropped. The waker runs
    /// after the slot borrow is released, so it may poll the future directly.
    pub fn resolve(self, outcome: Outcome<T>) -> Result<bool, ConsistencyError> {
        let Some(slot) = self.slot.upgrade() else {
            return Ok(false);
        };
        let waker = {
            let mut slot = slot.borrow_mut();
            if !matches!(slot.state, SlotState::Pending) {
                return Err(ConsistencyError::AlreadyResolved(self.handle));
            }
            slot.state = SlotState::Ready(outcome);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(true)
    }
}

// =============================================================================
// RequestRegistry
// =============================================================================

pub struct RequestRegistry<T> {
    entries: HashMap<RequestHandle, FutureRef<T>>,
}

impl<T> RequestRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Record a freshly issued request. Must happen before the engine can
    /// complete it.
    pub fn register(
        &mut self,
        handle: RequestHandle,
        future: FutureRef<T>,
    ) -> Result<(), ConsistencyError> {
        if self.entries.contains_key(&handle) {
            return Err(ConsistencyError::DuplicateHandle(handle));
        }
        self.entries.insert(handle, future);
        Ok(())
    }

    /// Detach an entry so its outcome can be delivered outside any borrow of
    /// the registry.
    pub fn take(&mut self, handle: RequestHandle) -> Result<FutureRef<T>, ConsistencyError> {
        self.entries
            .remove(&handle)
            .ok_or(ConsistencyError::UnknownHandle(handle))
    }

    /// Remove the entry and resolve its future, reporting bookkeeping errors.
    ///
    /// `Ok(false)` means the handle was known but its future had been dropped.
    pub fn try_resolve(
        &mut self,
        handle: RequestHandle,
        outcome: Outcome<T>,
    ) -> Result<bool, ConsistencyError> {
        self.take(handle)?.resolve(outcome)
    }

    /// Remove the entry and resolve its future. An unknown handle is fatal.
    pub fn resolve(&mut self, handle: RequestHandle, outcome: Outcome<T>) -> bool {
        self.try_resolve(handle, outcome)
            .unwrap_or_else(|err| err.raise())
    }

    pub fn contains(&self, handle: RequestHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Forget every entry. Their futures never resolve.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}

impl<T> Default for RequestRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::error::RequestError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn h(raw: u64) -> RequestHandle {
        RequestHandle::from_raw(raw)
    }

    #[test]
    fn resolve_wakes_and_delivers() {
        let mut registry = RequestRegistry::new();
        let (mut future, future_ref) = pending::<u32>(h(1));
        registry.register(h(1), future_ref).unwrap();

        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());

        assert!(registry.resolve(h(1), Ok(7)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_count(), 0);

        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Ready(Ok(v)) => assert_eq!(v, 7),
            other => panic!("unexpected poll result: {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn error_outcome_travels_the_same_path() {
        let mut registry = RequestRegistry::new();
        let (mut future, future_ref) = pending::<u32>(h(2));
        registry.register(h(2), future_ref).unwrap();
        registry.resolve(h(2), Err(RequestError::Cancelled));
        assert!(matches!(future.try_take(), Some(Err(RequestError::Cancelled))));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = RequestRegistry::<()>::new();
        let (_a, ref_a) = pending(h(3));
        let (_b, ref_b) = pending(h(3));
        registry.register(h(3), ref_a).unwrap();
        assert_eq!(
            registry.register(h(3), ref_b),
            Err(ConsistencyError::DuplicateHandle(h(3)))
        );
    }

    #[test]
    fn unknown_handle_is_reported() {
        let mut registry = RequestRegistry::<()>::new();
        assert_eq!(
            registry.try_resolve(h(4), Ok(())),
            Err(ConsistencyError::UnknownHandle(h(4)))
        );
    }

    #[test]
    #[should_panic(expected = "unknown request handle req#5")]
    fn unknown_handle_resolution_is_fatal() {
        let mut registry = RequestRegistry::<()>::new();
        registry.resolve(h(5), Ok(()));
    }

    #[test]
    #[should_panic(expected = "unknown request handle")]
    fn second_resolution_is_fatal() {
        let mut registry = RequestRegistry::new();
        let (_future, future_ref) = pending::<()>(h(6));
        registry.register(h(6), future_ref).unwrap();
        registry.resolve(h(6), Ok(()));
        registry.resolve(h(6), Ok(()));
    }

    #[test]
    fn dropped_future_discards_outcome() {
        let mut registry = RequestRegistry::new();
        let (future, future_ref) = pending::<()>(h(7));
        registry.register(h(7), future_ref).unwrap();
        drop(future);
        assert_eq!(registry.try_resolve(h(7), Ok(())), Ok(false));
        assert!(!registry.contains(h(7)));
    }

    #[test]
    fn abandon_all_leaves_futures_pending() {
        let mut registry = RequestRegistry::new();
        let (future, future_ref) = pending::<()>(h(8));
        registry.register(h(8), future_ref).unwrap();
        assert_eq!(registry.abandon_all(), 1);
        assert!(!future.is_resolved());
        assert_eq!(registry.pending_count(), 0);
    }
}
