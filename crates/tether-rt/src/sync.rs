//! Synchronization primitives abstraction for loom testing.
//!
//! When compiled with `--cfg loom`, the wakeup channel's armed flag, the
//! completion queue, handle allocator and lifecycle state use loom's types so
//! the cross-thread handoff can be model checked. Otherwise, they use std types.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

#[cfg(loom)]
pub(crate) use loom::sync::{Mutex, MutexGuard};

#[cfg(not(loom))]
pub(crate) use std::sync::{Mutex, MutexGuard};

#[cfg(loom)]
pub(crate) use loom::thread;

#[cfg(not(loom))]
pub(crate) use std::thread;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate is a handful of container operations,
/// so the protected data is never left half-updated by a panic.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
