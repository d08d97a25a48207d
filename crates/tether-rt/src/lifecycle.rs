//! Engine lifecycle: one-time setup and the watcher's reference state.
//!
//! ```text
//! Uninitialized ──init──▶ Initializing ──ok──▶ Active ──shutdown──▶ ShuttingDown ──▶ Terminated
//!       ▲                      │
//!       └────────error─────────┘
//! ```
//!
//! The state is a single atomic; the winner of the `Uninitialized →
//! Initializing` compare-exchange runs the setup closure exactly once. Other
//! threads wait for it to finish. A re-entrant call from the initializing
//! thread itself (for instance from inside the watcher callback) returns at
//! once instead of deadlocking.
//!
//! The host watcher is referenced only while the bridge *wants* pending work
//! to keep the host alive and some work is actually pending. An idle bridge
//! never holds the host loop open.

use crate::host::HostLoop;
use crate::sync::{lock, thread, AtomicBool, AtomicU8, Mutex, Ordering};
use crate::types::WatcherId;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized = 0,
    Initializing = 1,
    Active = 2,
    ShuttingDown = 3,
    Terminated = 4,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Uninitialized,
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Active,
            3 => LifecycleState::ShuttingDown,
            _ => LifecycleState::Terminated,
        }
    }
}

/// What a call to [`EngineLifecycle::init`] found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitStatus {
    /// This call ran the setup.
    Initialized,
    /// Setup had already completed.
    AlreadyActive,
    /// Called from inside the running setup on the same thread.
    Reentrant,
    /// The lifecycle has been shut down.
    Terminated,
}

pub struct EngineLifecycle {
    state: AtomicU8,
    initializer: Mutex<Option<thread::ThreadId>>,
    watcher: Mutex<Option<WatcherId>>,
    /// Whether pending work should keep the host alive.
    wants_reference: AtomicBool,
    /// What the host loop was last told.
    host_referenced: AtomicBool,
}

impl EngineLifecycle {
    pub fn new(start_referenced: bool) -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Uninitialized as u8),
            initializer: Mutex::new(None),
            watcher: Mutex::new(None),
            wants_reference: AtomicBool::new(start_referenced),
            host_referenced: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn watcher(&self) -> Option<WatcherId> {
        *lock(&self.watcher)
    }

    /// Whether pending work is meant to keep the host alive.
    pub fn is_referenced(&self) -> bool {
        self.wants_reference.load(Ordering::Acquire)
    }

    /// Whether the host loop currently counts the watcher as work.
    pub fn host_referenced(&self) -> bool {
        self.host_referenced.load(Ordering::Acquire)
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Run `setup` exactly once. `setup` creates the channel, installs the
    /// watcher and returns its id; on error the lifecycle goes back to
    /// `Uninitialized` so a later call can retry.
    pub fn init<E>(
        &self,
        setup: impl FnOnce() -> Result<WatcherId, E>,
    ) -> Result<InitStatus, E> {
        loop {
            match self.state.compare_exchange(
                LifecycleState::Uninitialized as u8,
                LifecycleState::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return self.run_setup(setup),
                Err(current) => match LifecycleState::from_u8(current) {
                    LifecycleState::Uninitialized => continue,
                    LifecycleState::Initializing => {
                        if self.is_initializer() {
                            return Ok(InitStatus::Reentrant);
                        }
                        thread::yield_now();
                    }
                    LifecycleState::Active => return Ok(InitStatus::AlreadyActive),
                    LifecycleState::ShuttingDown | LifecycleState::Terminated => {
                        return Ok(InitStatus::Terminated)
                    }
                },
            }
        }
    }

    fn run_setup<E>(
        &self,
        setup: impl FnOnce() -> Result<WatcherId, E>,
    ) -> Result<InitStatus, E> {
        *lock(&self.initializer) = Some(thread::current().id());
        let unwind = ResetOnUnwind(self);
        let result = setup();
        std::mem::forget(unwind);
        *lock(&self.initializer) = None;

        match result {
            Ok(watcher) => {
                *lock(&self.watcher) = Some(watcher);
                self.host_referenced.store(true, Ordering::Release);
                self.state
                    .store(LifecycleState::Active as u8, Ordering::Release);
                log::debug!("bridge lifecycle active ({watcher})");
                Ok(InitStatus::Initialized)
            }
            Err(err) => {
                self.state
                    .store(LifecycleState::Uninitialized as u8, Ordering::Release);
                log::debug!("bridge initialization failed; lifecycle reset");
                Err(err)
            }
        }
    }

    fn is_initializer(&self) -> bool {
        *lock(&self.initializer) == Some(thread::current().id())
    }

    // =========================================================================
    // Reference state
    // =========================================================================

    /// Let pending work keep the host alive.
    pub fn reference<H: HostLoop + ?Sized>(&self, host: &H, pending: usize) {
        self.wants_reference.store(true, Ordering::Release);
        self.sync(host, pending);
    }

    /// Let the host exit even with work pending. In-flight requests keep
    /// running and are delivered if the host drains again.
    pub fn unreference<H: HostLoop + ?Sized>(&self, host: &H, pending: usize) {
        self.wants_reference.store(false, Ordering::Release);
        self.sync(host, pending);
    }

    /// Bring the host's view of the watcher in line with the pending count.
    pub fn sync<H: HostLoop + ?Sized>(&self, host: &H, pending: usize) {
        if self.state() != LifecycleState::Active {
            return;
        }
        let Some(watcher) = self.watcher() else {
            return;
        };
        let desired = pending > 0 && self.wants_reference.load(Ordering::Acquire);
        if self.host_referenced.swap(desired, Ordering::AcqRel) != desired {
            if desired {
                host.reference(watcher);
            } else {
                host.unreference(watcher);
            }
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Move to `ShuttingDown`. Returns the installed watcher (if setup ever
    /// completed), or the current state if another call already shut down.
    pub fn begin_shutdown(&self) -> Result<Option<WatcherId>, LifecycleState> {
        loop {
            let current = self.state.load(Ordering::Acquire);
            match LifecycleState::from_u8(current) {
                LifecycleState::Initializing => {
                    if self.is_initializer() {
                        return Err(LifecycleState::Initializing);
                    }
                    thread::yield_now();
                }
                state @ (LifecycleState::ShuttingDown | LifecycleState::Terminated) => {
                    return Err(state)
                }
                LifecycleState::Uninitialized | LifecycleState::Active => {
                    if self
                        .state
                        .compare_exchange(
                            current,
                            LifecycleState::ShuttingDown as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return Ok(lock(&self.watcher).take());
                    }
                }
            }
        }
    }

    pub fn finish_shutdown(&self) {
        self.host_referenced.store(false, Ordering::Release);
        self.state
            .store(LifecycleState::Terminated as u8, Ordering::Release);
        log::debug!("bridge lifecycle terminated");
    }
}

/// Puts a lifecycle whose setup panicked back to `Uninitialized`, so the
/// initializing thread is not treated as re-entrant forever and other threads
/// stop waiting.
struct ResetOnUnwind<'a>(&'a EngineLifecycle);

impl Drop for ResetOnUnwind<'_> {
    fn drop(&mut self) {
        *lock(&self.0.initializer) = None;
        self.0
            .state
            .store(LifecycleState::Uninitialized as u8, Ordering::Release);
        log::warn!("bridge setup panicked; lifecycle reset");
    }
}

impl std::fmt::Debug for EngineLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLifecycle")
            .field("state", &self.state())
            .field("watcher", &self.watcher())
            .field("referenced", &self.is_referenced())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::host::ReadableCallback;
    use std::cell::RefCell;
    use std::io;
    use std::os::fd::RawFd;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    #[derive(Default)]
    struct RecordingHost {
        calls: RefCell<Vec<(&'static str, WatcherId)>>,
    }

    impl HostLoop for RecordingHost {
        fn watch(&self, _fd: RawFd, _cb: ReadableCallback) -> io::Result<WatcherId> {
            unreachable!("lifecycle never watches by itself")
        }

        fn reference(&self, watcher: WatcherId) {
            self.calls.borrow_mut().push(("ref", watcher));
        }

        fn unreference(&self, watcher: WatcherId) {
            self.calls.borrow_mut().push(("unref", watcher));
        }
    }

    fn active(start_referenced: bool) -> EngineLifecycle {
        let lifecycle = EngineLifecycle::new(start_referenced);
        let status = lifecycle.init(|| Ok::<_, ()>(WatcherId(1))).unwrap();
        assert_eq!(status, InitStatus::Initialized);
        lifecycle
    }

    #[test]
    fn init_is_idempotent() {
        let lifecycle = active(true);
        let status = lifecycle
            .init(|| -> Result<WatcherId, ()> { panic!("setup ran twice") })
            .unwrap();
        assert_eq!(status, InitStatus::AlreadyActive);
        assert_eq!(lifecycle.state(), LifecycleState::Active);
        assert_eq!(lifecycle.watcher(), Some(WatcherId(1)));
    }

    #[test]
    fn failed_init_can_be_retried() {
        let lifecycle = EngineLifecycle::new(true);
        assert_eq!(lifecycle.init(|| Err::<WatcherId, _>("no pipe")), Err("no pipe"));
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
        assert_eq!(lifecycle.watcher(), None);

        let status = lifecycle.init(|| Ok::<_, &str>(WatcherId(2))).unwrap();
        assert_eq!(status, InitStatus::Initialized);
        assert_eq!(lifecycle.watcher(), Some(WatcherId(2)));
    }

    #[test]
    fn reentrant_init_returns_immediately() {
        let lifecycle = EngineLifecycle::new(true);
        let status = lifecycle
            .init(|| {
                let inner = lifecycle.init(|| -> Result<WatcherId, ()> { panic!("nested setup") });
                assert_eq!(inner, Ok(InitStatus::Reentrant));
                Ok::<_, ()>(WatcherId(3))
            })
            .unwrap();
        assert_eq!(status, InitStatus::Initialized);
    }

    #[test]
    fn concurrent_init_runs_setup_once() {
        let lifecycle = Arc::new(EngineLifecycle::new(true));
        let setups = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(10));

        let entry_points: Vec<_> = (0..10)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                let setups = Arc::clone(&setups);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    lifecycle
                        .init(|| {
                            setups.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok::<_, ()>(WatcherId(42))
                        })
                        .unwrap()
                })
            })
            .collect();

        let statuses: Vec<_> = entry_points.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(setups.load(Ordering::SeqCst), 1);
        assert_eq!(
            statuses.iter().filter(|s| **s == InitStatus::Initialized).count(),
            1
        );
        assert!(statuses
            .iter()
            .all(|s| matches!(s, InitStatus::Initialized | InitStatus::AlreadyActive)));
        assert_eq!(lifecycle.watcher(), Some(WatcherId(42)));
    }

    #[test]
    fn watcher_follows_pending_work() {
        let host = RecordingHost::default();
        let lifecycle = active(true);

        // Idle bridge must not hold the host open.
        lifecycle.sync(&host, 0);
        lifecycle.sync(&host, 1);
        lifecycle.sync(&host, 3);
        lifecycle.sync(&host, 0);

        assert_eq!(
            *host.calls.borrow(),
            vec![
                ("unref", WatcherId(1)),
                ("ref", WatcherId(1)),
                ("unref", WatcherId(1)),
            ]
        );
    }

    #[test]
    fn unreference_keeps_watcher_installed() {
        let host = RecordingHost::default();
        let lifecycle = active(true);

        lifecycle.sync(&host, 2);
        lifecycle.unreference(&host, 2);
        assert!(!lifecycle.is_referenced());
        assert!(!lifecycle.host_referenced());
        assert_eq!(lifecycle.watcher(), Some(WatcherId(1)));
        assert_eq!(lifecycle.state(), LifecycleState::Active);

        lifecycle.reference(&host, 2);
        assert!(lifecycle.host_referenced());
    }

    #[test]
    fn start_unreferenced() {
        let host = RecordingHost::default();
        let lifecycle = active(false);
        lifecycle.sync(&host, 5);
        assert!(!lifecycle.host_referenced());
        assert_eq!(*host.calls.borrow(), vec![("unref", WatcherId(1))]);
    }

    #[test]
    fn panicking_setup_can_be_retried() {
        let lifecycle = EngineLifecycle::new(true);
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lifecycle.init(|| -> Result<WatcherId, ()> { panic!("watch exploded") })
        }));
        assert!(unwound.is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
        assert_eq!(lifecycle.watcher(), None);

        let status = lifecycle.init(|| Ok::<_, ()>(WatcherId(4))).unwrap();
        assert_eq!(status, InitStatus::Initialized);
        assert_eq!(lifecycle.state(), LifecycleState::Active);
    }

    #[test]
    fn panicking_setup_releases_waiting_threads() {
        let lifecycle = Arc::new(EngineLifecycle::new(true));
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lifecycle.init(|| -> Result<WatcherId, ()> { panic!("watch exploded") })
        }));

        let other = {
            let lifecycle = Arc::clone(&lifecycle);
            std::thread::spawn(move || lifecycle.init(|| Ok::<_, ()>(WatcherId(5))))
        };
        assert_eq!(other.join().unwrap(), Ok(InitStatus::Initialized));
        assert_eq!(lifecycle.watcher(), Some(WatcherId(5)));
    }

    #[test]
    fn shutdown_is_one_way() {
        let lifecycle = active(true);
        assert_eq!(lifecycle.begin_shutdown(), Ok(Some(WatcherId(1))));
        assert_eq!(lifecycle.begin_shutdown(), Err(LifecycleState::ShuttingDown));
        lifecycle.finish_shutdown();
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
        assert_eq!(
            lifecycle.init(|| Ok::<_, ()>(WatcherId(9))),
            Ok(InitStatus::Terminated)
        );
    }

    #[test]
    fn shutdown_before_init() {
        let lifecycle = EngineLifecycle::new(true);
        assert_eq!(lifecycle.begin_shutdown(), Ok(None));
        lifecycle.finish_shutdown();
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }
}
