//! Drain benchmarks: how fast a burst of worker completions reaches the host.
//!
//! Run with: cargo bench -p tether-rt

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use tether_rt::{
    Bridge, Completer, Engine, HostLoop, ReadableCallback, RequestHandle, RequestStatus,
    SubmitError, WatcherId,
};

// =============================================================================
// Minimal collaborators (no polling, no thread pool)
// =============================================================================

#[derive(Clone, Default)]
struct StashEngine {
    completers: Arc<Mutex<Vec<Completer<u64>>>>,
}

impl StashEngine {
    fn take_all(&self) -> Vec<Completer<u64>> {
        std::mem::take(&mut *self.completers.lock().unwrap())
    }
}

impl Engine for StashEngine {
    type Request = ();
    type Response = u64;

    fn submit(&self, _request: (), completer: Completer<u64>) -> Result<(), SubmitError> {
        self.completers.lock().unwrap().push(completer);
        Ok(())
    }

    fn cancel(&self, _handle: RequestHandle) -> bool {
        false
    }

    fn query(&self, _handle: RequestHandle) -> RequestStatus {
        RequestStatus::Unknown
    }
}

struct NullHost;

impl HostLoop for NullHost {
    fn watch(&self, _fd: RawFd, _on_readable: ReadableCallback) -> io::Result<WatcherId> {
        Ok(WatcherId(0))
    }

    fn reference(&self, _watcher: WatcherId) {}

    fn unreference(&self, _watcher: WatcherId) {}
}

// =============================================================================
// Benchmarks
// =============================================================================

fn issue_complete_drain(c: &mut Criterion, name: &str, burst: usize, workers: usize) {
    let engine = StashEngine::default();
    let bridge = Bridge::new(engine.clone(), NullHost);
    bridge.initialize().unwrap();

    c.bench_function(name, |b| {
        b.iter(|| {
            let futures: Vec<_> = (0..burst).map(|_| bridge.issue(()).unwrap()).collect();

            let mut completers = engine.take_all();
            let per_worker = completers.len().div_ceil(workers);
            std::thread::scope(|scope| {
                while !completers.is_empty() {
                    let batch: Vec<_> = completers
                        .drain(..per_worker.min(completers.len()))
                        .collect();
                    scope.spawn(move || {
                        for completer in batch {
                            let raw = completer.handle().into_raw();
                            completer.complete(Ok(raw));
                        }
                    });
                }
            });

            black_box(bridge.drain());
            black_box(futures);
        });
    });
}

fn drain_1k_single_worker(c: &mut Criterion) {
    issue_complete_drain(c, "drain_1k_single_worker", 1_000, 1);
}

fn drain_1k_eight_workers(c: &mut Criterion) {
    issue_complete_drain(c, "drain_1k_eight_workers", 1_000, 8);
}

fn spurious_drain(c: &mut Criterion) {
    let bridge = Bridge::new(StashEngine::default(), NullHost);
    bridge.initialize().unwrap();

    c.bench_function("spurious_drain", |b| {
        b.iter(|| black_box(bridge.drain()));
    });
}

criterion_group!(
    benches,
    drain_1k_single_worker,
    drain_1k_eight_workers,
    spurious_drain,
);
criterion_main!(benches);
