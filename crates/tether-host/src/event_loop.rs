//! The host loop: reactor plus executor on one thread.
//!
//! A turn polls every ready task, then waits on the reactor and runs the
//! callbacks of readable watchers. The loop stays alive while a referenced
//! watcher exists; pending tasks alone do not keep it running.

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use tether_rt::{HostLoop, ReadableCallback, WatcherId};

use crate::executor::Executor;
use crate::reactor::Reactor;

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("reactor failed: {0}")]
    Io(#[from] io::Error),
    /// The future is pending and nothing referenced can wake it.
    #[error("future cannot make progress: no referenced watchers remain")]
    Stalled,
}

/// Single-threaded event loop. Clones share the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

struct LoopInner {
    reactor: RefCell<Reactor>,
    executor: Executor,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let reactor = Reactor::new()?;
        let executor = Executor::new(reactor.poller());
        Ok(Self {
            inner: Rc::new(LoopInner {
                reactor: RefCell::new(reactor),
                executor,
            }),
        })
    }

    /// Run a task on this loop. Tasks do not keep the loop alive.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.inner.executor.spawn(future);
    }

    /// Run until no referenced watcher remains and no task is ready.
    pub fn run(&self) -> Result<(), LoopError> {
        loop {
            // Left over from an earlier `block_on`; nothing to poll here.
            self.inner.executor.take_main_wake();
            self.inner.executor.run_ready();
            if self.inner.executor.has_ready() {
                self.turn(Some(Duration::ZERO))?;
                continue;
            }
            if self.referenced_count() == 0 {
                log::debug!("event loop idle, exiting");
                return Ok(());
            }
            self.turn(None)?;
        }
    }

    /// Drive `future` to completion on this thread, running spawned tasks
    /// and watchers alongside it.
    ///
    /// Fails with [`LoopError::Stalled`] if the future is pending while no
    /// task is ready and no referenced watcher remains.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, LoopError> {
        let mut future = pin!(future);
        let waker = self.inner.executor.main_waker();
        let mut cx = Context::from_waker(&waker);
        let mut poll_main = true;

        loop {
            if poll_main || self.inner.executor.take_main_wake() {
                poll_main = false;
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Ok(output);
                }
            }

            self.inner.executor.run_ready();
            if self.inner.executor.has_ready() {
                self.turn(Some(Duration::ZERO))?;
                continue;
            }
            if self.referenced_count() == 0 {
                log::debug!("block_on stalled: nothing referenced can wake the future");
                return Err(LoopError::Stalled);
            }
            self.turn(None)?;
        }
    }

    /// One reactor wait plus callback dispatch. Returns how many callbacks ran.
    pub fn turn(&self, timeout: Option<Duration>) -> Result<usize, LoopError> {
        let fired = self.inner.reactor.borrow_mut().poll(timeout)?;
        let mut ran = 0;
        for token in fired {
            // Callbacks may re-enter the loop (reference, cancel, spawn).
            let Some(mut callback) = self.inner.reactor.borrow_mut().take_callback(token) else {
                continue;
            };
            callback();
            ran += 1;
            let leftover = self
                .inner
                .reactor
                .borrow_mut()
                .restore_callback(token, callback);
            drop(leftover);
        }
        Ok(ran)
    }

    /// Watchers currently keeping the loop alive.
    pub fn referenced_count(&self) -> usize {
        self.inner.reactor.borrow().referenced_count()
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.reactor.borrow().len()
    }

    pub fn task_count(&self) -> usize {
        self.inner.executor.task_count()
    }
}

impl HostLoop for EventLoop {
    fn watch(&self, fd: RawFd, on_readable: ReadableCallback) -> io::Result<WatcherId> {
        let token = self.inner.reactor.borrow_mut().register(fd, on_readable)?;
        Ok(WatcherId(token))
    }

    fn reference(&self, watcher: WatcherId) {
        self.inner.reactor.borrow_mut().set_referenced(watcher.0, true);
    }

    fn unreference(&self, watcher: WatcherId) {
        self.inner.reactor.borrow_mut().set_referenced(watcher.0, false);
    }

    fn cancel(&self, watcher: WatcherId) {
        let callback = self.inner.reactor.borrow_mut().deregister(watcher.0);
        drop(callback);
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("watchers", &self.watcher_count())
            .field("referenced", &self.referenced_count())
            .field("tasks", &self.task_count())
            .finish()
    }
}
