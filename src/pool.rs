//! Bounded pool of worker threads that drain many shards' request
//! queues. Shards vastly outnumber worker threads once
//! `cacheSegments > 16` (the spec's `concurrency = max(shards/16, 1)`),
//! so each worker time-shares a subset of shard queues via
//! [crossbeam_channel::Select] rather than owning one shard apiece —
//! the one-OS-thread-per-queue pattern from the teacher's own
//! `thread::Thread` does not scale to that ratio.
//!
//! Per-shard ordering (invariant I1) still holds: a shard's queue is
//! ever added to exactly one worker's select set, so exactly one
//! thread ever calls its handler.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Select, Sender};
use log::error;

use crate::request::IndexRequest;

/// Processes one `IndexRequest` for the shard it was read from.
pub type Handler = Box<dyn FnMut(IndexRequest) + Send>;

enum WorkerControl {
    Add(Receiver<IndexRequest>, Handler),
}

/// A fixed-size pool of worker threads; shard queues are assigned to
/// workers after the fact via [WorkerPool::assign].
pub struct WorkerPool {
    controls: Vec<Sender<WorkerControl>>,
    handles: Vec<thread::JoinHandle<()>>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> WorkerPool {
        let num_workers = num_workers.max(1);
        let mut controls = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let (ctl_tx, ctl_rx) = crossbeam_channel::unbounded();
            controls.push(ctl_tx);
            let handle = thread::Builder::new()
                .name(format!("shard-worker-{}", i))
                .spawn(move || worker_loop(ctl_rx))
                .expect("failed to spawn shard worker thread");
            handles.push(handle);
        }
        WorkerPool {
            controls,
            handles,
            next: AtomicUsize::new(0),
        }
    }

    /// Assigns a shard's queue to one worker, round-robin across the
    /// pool. `handler` is called once per request, in the order it
    /// arrives on `rx`, and never concurrently with itself.
    pub fn assign(&self, rx: Receiver<IndexRequest>, handler: Handler) {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.controls.len();
        // A send error means that worker's control channel is gone,
        // which only happens after `join` — assigning new shards after
        // shutdown has begun is a caller bug.
        let _ = self.controls[i].send(WorkerControl::Add(rx, handler));
    }

    pub fn num_workers(&self) -> usize {
        self.controls.len()
    }

    /// Stops accepting new assignments and waits for every worker to
    /// drain its currently-assigned shard queues to disconnection.
    pub fn join(self) {
        drop(self.controls);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(ctl_rx: Receiver<WorkerControl>) {
    let mut shards: Vec<(Receiver<IndexRequest>, Handler)> = Vec::new();
    loop {
        let mut sel = Select::new();
        let ctl_index = sel.recv(&ctl_rx);
        for (rx, _) in &shards {
            sel.recv(rx);
        }
        let oper = sel.select();
        let idx = oper.index();

        if idx == ctl_index {
            match oper.recv(&ctl_rx) {
                Ok(WorkerControl::Add(rx, handler)) => shards.push((rx, handler)),
                Err(_) => break, // pool is shutting down, no more assignments possible
            }
            continue;
        }

        let shard_idx = idx - 1;
        match oper.recv(&shards[shard_idx].0) {
            Ok(req) => {
                let handler = &mut shards[shard_idx].1;
                if let Err(cause) = catch_unwind(AssertUnwindSafe(|| handler(req))) {
                    error!(target: "pool", "shard applier panicked: {:?}", cause);
                }
            }
            Err(_) => {
                // Queue closed: this shard has stopped (graceful stop or
                // removeSegments). Drop it from the select set.
                shards.remove(shard_idx);
            }
        }
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
