//! Interfaces to the four collaborators the index is wired up with but
//! does not itself implement: the compactor, the temporary table, a
//! clock, and a non-blocking completion sink. All four are
//! dependency-injected into [crate::index::Index]'s constructor —
//! nothing here reaches for global state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Per-data-file bookkeeping handed back to the compactor on graceful
/// stop, and accepted from it on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStats {
    pub file_id: i32,
    pub total_bytes: i32,
    pub free_bytes: i32,
    pub next_expiration_time: i64,
}

/// Interface to the (out-of-scope) compactor: registers free-space
/// statistics for data files at load, and reads them back at stop.
pub trait Compactor: Send + Sync {
    /// Registers a data file's free-space statistics on load.
    /// `immediate` requests the compactor consider the file right away
    /// instead of waiting for its normal schedule. Returns whether the
    /// file was accepted (a compactor may reject already-known ids).
    fn add_free_file(
        &self,
        id: i32,
        total_bytes: i32,
        free_bytes: i32,
        next_expiration_time: i64,
        immediate: bool,
    ) -> bool;

    /// Discards bookkeeping for a file after it has been deleted.
    fn release_stats(&self, id: i32);

    /// Snapshot of every tracked file's statistics, used when writing
    /// the `index.stats` sidecar during graceful stop.
    fn get_file_stats(&self) -> HashMap<i32, FileStats>;
}

/// Interface to the (out-of-scope) temporary table: an in-memory
/// staging area for keys written since the last index flush.
pub trait TemporaryTable: Send + Sync {
    /// Drops the staged `(file, offset)` entry for `key` in `cache_seg`
    /// iff it still matches — guards against evicting an entry that a
    /// newer write has already shadowed.
    fn remove_conditionally(&self, cache_seg: u32, key: &[u8], file: i64, offset: i64);

    /// Cache-segment count the temporary table expects; used to
    /// validate sidecar state at load.
    fn get_segment_max(&self) -> u32;
}

/// Abstracts `now()` so tests can control expiration comparisons
/// without sleeping.
pub trait TimeService: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// `TimeService` backed by the real wall clock.
pub struct SystemTimeService;

impl TimeService for SystemTimeService {
    fn now_millis(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Test double: an explicit, independently advanceable clock.
pub struct FakeTimeService(AtomicI64);

impl FakeTimeService {
    pub fn new(start_millis: i64) -> FakeTimeService {
        FakeTimeService(AtomicI64::new(start_millis))
    }

    pub fn set(&self, millis: i64) {
        self.0.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_millis: i64) {
        self.0.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl TimeService for FakeTimeService {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Completes a user-visible future from a thread other than the
/// applier, so a slow or misbehaving continuation registered by the
/// caller cannot stall the shard's write pipeline. `job` performs the
/// actual completion (typically sending a reply down a oneshot
/// channel); `complete` only guarantees it runs off the calling thread.
pub trait NonBlockingManager: Send + Sync {
    fn complete(&self, job: Box<dyn FnOnce() + Send>);
}

/// Default `NonBlockingManager`: hands jobs to a small fixed pool of
/// completion threads over an unbounded channel.
pub struct ThreadedCompletionSink {
    tx: crossbeam_channel::Sender<Box<dyn FnOnce() + Send>>,
}

impl ThreadedCompletionSink {
    pub fn new(num_threads: usize) -> Arc<ThreadedCompletionSink> {
        let (tx, rx) = crossbeam_channel::unbounded::<Box<dyn FnOnce() + Send>>();
        for _ in 0..num_threads.max(1) {
            let rx = rx.clone();
            std::thread::spawn(move || {
                for job in rx.iter() {
                    job();
                }
            });
        }
        Arc::new(ThreadedCompletionSink { tx })
    }
}

impl NonBlockingManager for ThreadedCompletionSink {
    fn complete(&self, job: Box<dyn FnOnce() + Send>) {
        // A send error means every completion thread has been dropped
        // (shutdown); the job is simply discarded, mirroring end-of-stream
        // semantics for in-flight completions during process teardown.
        let _ = self.tx.send(job);
    }
}

#[cfg(test)]
#[path = "collab_test.rs"]
mod collab_test;
