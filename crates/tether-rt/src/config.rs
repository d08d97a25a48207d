//! Configuration for the bridge and the bundled tokio engine.

use std::time::Duration;

/// Settings for [`Bridge`](crate::Bridge).
#[derive(Clone, Copy, Debug)]
pub struct BridgeConfig {
    /// Whether pending requests keep the host loop alive from the start.
    pub start_referenced: bool,
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn referenced(mut self, referenced: bool) -> Self {
        self.start_referenced = referenced;
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            start_referenced: true,
        }
    }
}

/// Settings for the tokio worker pool behind `TokioEngine`.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Worker thread count; `None` uses tokio's default (one per core).
    pub worker_threads: Option<usize>,
    pub thread_name: String,
    /// How long shutdown waits for running requests before abandoning them.
    pub shutdown_timeout: Duration,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads.max(1));
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name: "tether-worker".to_string(),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}
