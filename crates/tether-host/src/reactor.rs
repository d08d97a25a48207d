//! Readiness reactor using the `polling` crate.
//!
//! Each watcher is a file descriptor registered level-triggered for
//! readability, plus the callback to run when it fires. A watcher is either
//! referenced (it keeps the loop running) or not; unreferenced watchers still
//! fire while something else keeps the loop awake.

use polling::{Event, Events, PollMode, Poller};
use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tether_rt::ReadableCallback;

// =============================================================================
// Per-watcher state
// =============================================================================

struct Watch {
    fd: RawFd,
    // `None` while the callback is out being run.
    callback: Option<ReadableCallback>,
    referenced: bool,
}

// =============================================================================
// Reactor
// =============================================================================

pub struct Reactor {
    poller: Arc<Poller>,
    watches: HashMap<usize, Watch>,
    next_token: usize,
    events: Events,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            watches: HashMap::new(),
            next_token: 1,
            events: Events::new(),
        })
    }

    /// Shared poller, for waking a blocked `poll` from another thread.
    pub fn poller(&self) -> Arc<Poller> {
        Arc::clone(&self.poller)
    }

    /// Watch `fd` for readability. New watchers are referenced.
    pub fn register(&mut self, fd: RawFd, callback: ReadableCallback) -> io::Result<usize> {
        let token = self.next_token;
        self.next_token += 1;

        // Safety: the caller keeps `fd` open until it deregisters the token.
        unsafe {
            self.poller
                .add_with_mode(fd, Event::readable(token), PollMode::Level)?;
        }

        self.watches.insert(
            token,
            Watch {
                fd,
                callback: Some(callback),
                referenced: true,
            },
        );
        log::trace!("reactor: register fd={fd} token={token}");
        Ok(token)
    }

    /// Stop watching. Returns the callback so the caller can drop it outside
    /// any borrow of the reactor.
    pub fn deregister(&mut self, token: usize) -> Option<ReadableCallback> {
        let watch = self.watches.remove(&token)?;
        // Errors are ignored: the fd may already be closed.
        let borrowed = unsafe { BorrowedFd::borrow_raw(watch.fd) };
        let _ = self.poller.delete(borrowed);
        log::trace!("reactor: deregister token={token} fd={}", watch.fd);
        watch.callback
    }

    pub fn set_referenced(&mut self, token: usize, referenced: bool) {
        if let Some(watch) = self.watches.get_mut(&token) {
            watch.referenced = referenced;
        }
    }

    pub fn is_referenced(&self, token: usize) -> bool {
        self.watches.get(&token).is_some_and(|w| w.referenced)
    }

    /// Watchers that keep the loop alive.
    pub fn referenced_count(&self) -> usize {
        self.watches.values().filter(|w| w.referenced).count()
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Wait for readiness and return the tokens that fired.
    ///
    /// `None` blocks until an event or a [`Poller::notify`].
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<usize>> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }

        let mut fired = Vec::new();
        for ev in self.events.iter() {
            let Some(watch) = self.watches.get(&ev.key) else {
                continue;
            };
            if ev.readable {
                fired.push(ev.key);
            }
            // Keep the registration armed on backends that need it.
            let borrowed = unsafe { BorrowedFd::borrow_raw(watch.fd) };
            let _ = self.poller.modify_with_mode(
                borrowed,
                Event::readable(ev.key),
                PollMode::Level,
            );
        }
        if !fired.is_empty() {
            log::trace!("reactor: {} watchers readable", fired.len());
        }
        Ok(fired)
    }

    /// Take a watcher's callback out to run it without holding the reactor.
    pub fn take_callback(&mut self, token: usize) -> Option<ReadableCallback> {
        self.watches.get_mut(&token)?.callback.take()
    }

    /// Put a callback back after running it. Dropped if the watcher was
    /// deregistered in the meantime.
    pub fn restore_callback(&mut self, token: usize, callback: ReadableCallback) -> Option<ReadableCallback> {
        match self.watches.get_mut(&token) {
            Some(watch) if watch.callback.is_none() => {
                watch.callback = Some(callback);
                None
            }
            _ => Some(callback),
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for (_, watch) in self.watches.drain() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(watch.fd) };
            let _ = self.poller.delete(borrowed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::rc::Rc;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_byte(fd: &OwnedFd) {
        let byte = 1u8;
        let n = unsafe { libc::write(fd.as_raw_fd(), &byte as *const u8 as *const _, 1) };
        assert_eq!(n, 1);
    }

    #[test]
    fn readable_fd_fires_its_token() {
        let mut reactor = Reactor::new().unwrap();
        let (reader, writer) = pipe();
        let token = reactor.register(reader.as_raw_fd(), Box::new(|| {})).unwrap();

        assert!(reactor.poll(Some(Duration::ZERO)).unwrap().is_empty());
        write_byte(&writer);
        assert_eq!(reactor.poll(Some(Duration::from_secs(1))).unwrap(), vec![token]);
        // Level-triggered: still readable until drained.
        assert_eq!(reactor.poll(Some(Duration::ZERO)).unwrap(), vec![token]);

        reactor.deregister(token);
        assert!(reactor.poll(Some(Duration::ZERO)).unwrap().is_empty());
    }

    #[test]
    fn reference_flags_are_counted() {
        let mut reactor = Reactor::new().unwrap();
        let (a, _wa) = pipe();
        let (b, _wb) = pipe();
        let ta = reactor.register(a.as_raw_fd(), Box::new(|| {})).unwrap();
        let tb = reactor.register(b.as_raw_fd(), Box::new(|| {})).unwrap();
        assert_eq!(reactor.referenced_count(), 2);

        reactor.set_referenced(ta, false);
        assert_eq!(reactor.referenced_count(), 1);
        assert!(!reactor.is_referenced(ta));
        assert!(reactor.is_referenced(tb));

        reactor.deregister(tb);
        assert_eq!(reactor.referenced_count(), 0);
        assert_eq!(reactor.len(), 1);
    }

    #[test]
    fn callbacks_can_be_taken_and_restored() {
        let mut reactor = Reactor::new().unwrap();
        let (reader, _writer) = pipe();
        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        let token = reactor
            .register(reader.as_raw_fd(), Box::new(move || counter.set(counter.get() + 1)))
            .unwrap();

        let mut callback = reactor.take_callback(token).unwrap();
        assert!(reactor.take_callback(token).is_none());
        callback();
        assert!(reactor.restore_callback(token, callback).is_none());

        let callback = reactor.take_callback(token).unwrap();
        reactor.deregister(token);
        assert!(reactor.restore_callback(token, callback).is_some());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn notify_interrupts_a_blocking_poll() {
        let mut reactor = Reactor::new().unwrap();
        let poller = reactor.poller();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poller.notify().unwrap();
        });
        assert!(reactor.poll(Some(Duration::from_secs(5))).unwrap().is_empty());
        waker.join().unwrap();
    }
}
