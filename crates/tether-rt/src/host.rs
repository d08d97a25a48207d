//! Host-loop collaborator contract.
//!
//! The bridge needs exactly three things from the host's event loop: watch a
//! descriptor for readability, and mark that watcher as keeping the loop
//! alive or not. `cancel` is used only when the bridge shuts down.

use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::types::WatcherId;

/// Callback run on the host thread whenever a watched descriptor is readable.
pub type ReadableCallback = Box<dyn FnMut() + 'static>;

pub trait HostLoop {
    /// Watch `fd` for readability. New watchers start referenced.
    ///
    /// The callback may call back into the host loop and into the bridge.
    fn watch(&self, fd: RawFd, on_readable: ReadableCallback) -> io::Result<WatcherId>;

    /// Count the watcher as work that keeps the loop running.
    fn reference(&self, watcher: WatcherId);

    /// Let the loop exit even though the watcher is still installed.
    fn unreference(&self, watcher: WatcherId);

    /// Remove the watcher for good.
    fn cancel(&self, _watcher: WatcherId) {}
}

impl<H: HostLoop + ?Sized> HostLoop for &H {
    fn watch(&self, fd: RawFd, on_readable: ReadableCallback) -> io::Result<WatcherId> {
        (**self).watch(fd, on_readable)
    }

    fn reference(&self, watcher: WatcherId) {
        (**self).reference(watcher)
    }

    fn unreference(&self, watcher: WatcherId) {
        (**self).unreference(watcher)
    }

    fn cancel(&self, watcher: WatcherId) {
        (**self).cancel(watcher)
    }
}

impl<H: HostLoop + ?Sized> HostLoop for Rc<H> {
    fn watch(&self, fd: RawFd, on_readable: ReadableCallback) -> io::Result<WatcherId> {
        (**self).watch(fd, on_readable)
    }

    fn reference(&self, watcher: WatcherId) {
        (**self).reference(watcher)
    }

    fn unreference(&self, watcher: WatcherId) {
        (**self).unreference(watcher)
    }

    fn cancel(&self, watcher: WatcherId) {
        (**self).cancel(watcher)
    }
}
