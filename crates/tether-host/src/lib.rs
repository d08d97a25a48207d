//! Tether host: a single-threaded event loop that tether bridges plug into.
//!
//! [`EventLoop`] implements [`tether_rt::HostLoop`]: readiness watchers that
//! are referenced or unreferenced, a local task executor, and `block_on`.
//! A bridge built on it delivers completions from engine worker threads to
//! futures awaited on the loop thread:
//!
//! ```no_run
//! use tether_host::EventLoop;
//! use tether_rt::{request, Bridge, TokioEngine};
//!
//! let event_loop = EventLoop::new()?;
//! let bridge = Bridge::new(TokioEngine::<u32>::new()?, event_loop.clone());
//! let pending = bridge.issue(request(async { Ok::<_, std::io::Error>(42) }))?;
//! let value = event_loop.block_on(pending)??;
//! assert_eq!(value, 42);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod executor;
mod reactor;

pub mod event_loop;

pub use event_loop::{EventLoop, LoopError};
