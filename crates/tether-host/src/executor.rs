//! Slab-based single-threaded task executor.
//!
//! Tasks are `!Send` futures stored in a slab on the loop thread. Wakers are
//! `Send`: waking pushes the task id onto a lock-free `SegQueue`, and a wake
//! from a foreign thread also notifies the poller so a blocked loop turn
//! returns.
//!
//! # Invariants
//!
//! - The slab borrow is never held across a poll. A task is taken out of its
//!   slot, polled, then put back, so it may spawn freely.
//! - A stale wake (task already finished, slot reused) costs one spurious
//!   poll and nothing else.

use crossbeam_queue::SegQueue;
use polling::Poller;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Wake, Waker};
use std::thread::{self, ThreadId};

type LocalTask = Pin<Box<dyn Future<Output = ()> + 'static>>;

// =============================================================================
// Wake queue (shared with wakers, any thread)
// =============================================================================

pub(crate) struct WakeQueue {
    ready: SegQueue<usize>,
    main: AtomicBool,
    poller: Arc<Poller>,
    owner: ThreadId,
}

impl WakeQueue {
    fn push(&self, id: usize) {
        self.ready.push(id);
        self.notify_if_remote();
    }

    fn wake_main(&self) {
        self.main.store(true, Ordering::Release);
        self.notify_if_remote();
    }

    // Same-thread wakes are seen before the loop blocks again.
    fn notify_if_remote(&self) {
        if thread::current().id() != self.owner {
            if let Err(err) = self.poller.notify() {
                log::warn!("executor: poller notify failed: {err}");
            }
        }
    }
}

struct TaskWaker {
    id: usize,
    queue: Arc<WakeQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.id);
    }
}

struct MainWaker(Arc<WakeQueue>);

impl Wake for MainWaker {
    fn wake(self: Arc<Self>) {
        self.0.wake_main();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.wake_main();
    }
}

// =============================================================================
// Executor
// =============================================================================

struct Slot {
    // `None` while the task is out being polled.
    task: Option<LocalTask>,
    waker: Waker,
}

pub(crate) struct Executor {
    slots: RefCell<Vec<Option<Slot>>>,
    free: RefCell<Vec<usize>>,
    wakes: Arc<WakeQueue>,
}

impl Executor {
    pub fn new(poller: Arc<Poller>) -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            wakes: Arc::new(WakeQueue {
                ready: SegQueue::new(),
                main: AtomicBool::new(false),
                poller,
                owner: thread::current().id(),
            }),
        }
    }

    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> usize {
        let id = self.free.borrow_mut().pop().unwrap_or_else(|| {
            let mut slots = self.slots.borrow_mut();
            slots.push(None);
            slots.len() - 1
        });
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            queue: Arc::clone(&self.wakes),
        }));
        self.slots.borrow_mut()[id] = Some(Slot {
            task: Some(Box::pin(future)),
            waker,
        });
        self.wakes.ready.push(id);
        log::trace!("executor: spawn task={id}");
        id
    }

    /// Waker for the future driven by `block_on`.
    pub fn main_waker(&self) -> Waker {
        Waker::from(Arc::new(MainWaker(Arc::clone(&self.wakes))))
    }

    pub fn take_main_wake(&self) -> bool {
        self.wakes.main.swap(false, Ordering::AcqRel)
    }

    /// Whether a task or the main future is waiting to be polled.
    pub fn has_ready(&self) -> bool {
        !self.wakes.ready.is_empty() || self.wakes.main.load(Ordering::Acquire)
    }

    /// Live (unfinished) tasks.
    pub fn task_count(&self) -> usize {
        self.slots.borrow().iter().filter(|slot| slot.is_some()).count()
    }

    /// Poll every task woken so far. Tasks woken during this pass are polled
    /// in the same pass. Returns how many polls ran.
    pub fn run_ready(&self) -> usize {
        let mut polled = 0;
        while let Some(id) = self.wakes.ready.pop() {
            let taken = {
                let mut slots = self.slots.borrow_mut();
                match slots.get_mut(id).and_then(Option::as_mut) {
                    Some(slot) => slot.task.take().map(|task| (task, slot.waker.clone())),
                    None => None,
                }
            };
            // Stale wake, or the task is already being polled further up.
            let Some((mut task, waker)) = taken else {
                continue;
            };

            let mut cx = Context::from_waker(&waker);
            let finished = task.as_mut().poll(&mut cx).is_ready();
            polled += 1;

            if finished {
                let slot = self.slots.borrow_mut()[id].take();
                self.free.borrow_mut().push(id);
                log::trace!("executor: task={id} finished");
                // Drop the task (and its captures) outside the borrow.
                drop(task);
                drop(slot);
            } else if let Some(slot) = self.slots.borrow_mut()[id].as_mut() {
                slot.task = Some(task);
            }
        }
        polled
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let slots = std::mem::take(self.slots.get_mut());
        let live = slots.iter().filter(|slot| slot.is_some()).count();
        if live > 0 {
            log::debug!("executor: dropping {live} unfinished tasks");
        }
        drop(slots);
    }
}
