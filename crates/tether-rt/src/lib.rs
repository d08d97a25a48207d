//! Tether: delivers completions from a multithreaded engine to a
//! single-threaded host loop.
//!
//! A host event loop runs on one thread and can only touch its own futures
//! there. A native engine runs requests on a worker pool. Tether joins the
//! two:
//!
//! - **Issue**: [`Bridge::issue`] hands a request to the [`Engine`] and
//!   returns a [`PendingFuture`] right away.
//! - **Complete**: a worker finishes the request through its [`Completer`],
//!   which pushes onto the [`CompletionQueue`] and signals the
//!   [`WakeupChannel`].
//! - **Drain**: the host sees the channel readable and runs
//!   [`Bridge::drain`], which resolves every queued future on the host
//!   thread.
//!
//! Setup is lazy and happens once ([`EngineLifecycle`]). The wakeup watcher
//! keeps the host alive only while requests are pending and the bridge is
//! referenced.
//!
//! # Features
//!
//! - `tokio` (default): [`TokioEngine`], an engine on a tokio multi-thread
//!   runtime.
//! - `testing`: [`testing::ManualEngine`] and [`testing::MockHost`].

mod sync;

pub mod bridge;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod registry;
pub mod types;
pub mod wakeup;

#[cfg(feature = "tokio")]
pub mod tokio_engine;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bridge::Bridge;
pub use completion::{Completer, CompletionQueue};
pub use config::{BridgeConfig, EngineConfig};
pub use engine::Engine;
pub use error::{BridgeError, ConsistencyError, RequestError, SubmitError};
pub use host::{HostLoop, ReadableCallback};
pub use lifecycle::{EngineLifecycle, InitStatus, LifecycleState};
pub use registry::{FutureRef, PendingFuture, RequestRegistry};
pub use types::{BoxError, HandleAllocator, Outcome, RequestHandle, RequestStatus, WatcherId};
pub use wakeup::WakeupChannel;

#[cfg(feature = "tokio")]
pub use tokio_engine::{request, BoxRequest, TokioEngine};
