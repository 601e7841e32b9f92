//! [Index]: the fan-out facade over every shard. Owns the bounded
//! [WorkerPool], the collaborator handles shards need but don't own
//! themselves, and the graceful-stop/load sidecar protocol.

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};

use crossbeam_channel::Sender;
use log::info;

use crate::collab::{Compactor, FileStats, NonBlockingManager, TemporaryTable, TimeService};
use crate::config::Config;
use crate::entry::EntryLocation;
use crate::err_at;
use crate::error::Result;
use crate::files::FileHandleProvider;
use crate::node::LookupOp;
use crate::pool::WorkerPool;
use crate::request::{IndexReply, IndexRequest, SyncAction};
use crate::shard::Shard;

const INDEX_COUNT_FILE: &str = "index-count";
const INDEX_STATS_FILE: &str = "index.stats";
const STATS_RECORD_LEN: usize = 20;

struct ShardEntry {
    shard: Arc<Shard>,
    queue_tx: Sender<IndexRequest>,
}

/// Fan-out facade over every cache segment's shard.
pub struct Index {
    config: Config,
    provider: Arc<FileHandleProvider>,
    pool: WorkerPool,
    shards: RwLock<HashMap<u32, ShardEntry>>,
    compactor: Arc<dyn Compactor>,
    temp_table: Arc<dyn TemporaryTable>,
    clock: Arc<dyn TimeService>,
    completion: Arc<dyn NonBlockingManager>,
}

impl Index {
    /// Opens every shard under `config.dir`, validating the prior run's
    /// graceful-stop sidecars. The returned `bool` is whether that prior
    /// state was trustworthy; `false` means every shard was reset to
    /// empty and the embedding application must replay its data files.
    pub fn open(
        config: Config,
        compactor: Arc<dyn Compactor>,
        temp_table: Arc<dyn TemporaryTable>,
        clock: Arc<dyn TimeService>,
        completion: Arc<dyn NonBlockingManager>,
    ) -> Result<(Index, bool)> {
        err_at!(IoError, std::fs::create_dir_all(&config.dir))?;
        let provider = Arc::new(FileHandleProvider::new(
            config.dir.clone(),
            config.max_open_files,
        ));
        let pool = WorkerPool::new(config.worker_pool_size());

        let index_count = read_index_count_sidecar(&config);
        let stats = read_index_stats_sidecar(&config);

        let mut shards = HashMap::with_capacity(config.cache_segments as usize);
        let mut all_shards_graceful = true;
        for seg in 0..config.cache_segments {
            let (entry, loaded_gracefully) = spawn_shard(
                &provider,
                &pool,
                seg,
                &config,
                clock.clone(),
                temp_table.clone(),
                completion.clone(),
            )?;
            all_shards_graceful &= loaded_gracefully;
            shards.insert(seg, entry);
        }

        let loaded_gracefully = all_shards_graceful && index_count.is_some() && stats.is_some();

        if !loaded_gracefully {
            for entry in shards.values() {
                entry.shard.reset_to_empty()?;
            }
        } else if let Some(stats) = stats {
            for s in stats {
                compactor.add_free_file(
                    s.file_id,
                    s.total_bytes,
                    s.free_bytes,
                    s.next_expiration_time,
                    false,
                );
            }
        }

        info!(
            "index opened at {:?}: {} segments, loaded_gracefully={}",
            config.dir,
            shards.len(),
            loaded_gracefully
        );

        let index = Index {
            config,
            provider,
            pool,
            shards: RwLock::new(shards),
            compactor,
            temp_table,
            clock,
            completion,
        };
        Ok((index, loaded_gracefully))
    }

    /// Installs a fresh shard and queue for every id not already live.
    /// Existing shards are untouched.
    pub fn add_segments(&self, ids: &[u32]) -> Result<()> {
        let mut shards = self.shards.write()?;
        let mut added = Vec::with_capacity(ids.len());
        for &id in ids {
            if shards.contains_key(&id) {
                continue;
            }
            let (entry, _loaded_gracefully) = spawn_shard(
                &self.provider,
                &self.pool,
                id,
                &self.config,
                self.clock.clone(),
                self.temp_table.clone(),
                self.completion.clone(),
            )?;
            shards.insert(id, entry);
            added.push(id);
        }
        if !added.is_empty() {
            info!("index added segments {:?}", added);
        }
        Ok(())
    }

    /// Swaps the named shards out under the write lock, then deletes
    /// their backing files once each shard's applier has drained every
    /// request enqueued ahead of the removal.
    pub fn remove_segments(&self, ids: &[u32]) -> Result<()> {
        let mut removed = Vec::with_capacity(ids.len());
        {
            let mut shards = self.shards.write()?;
            for id in ids {
                if let Some(entry) = shards.remove(id) {
                    removed.push((*id, entry));
                }
            }
        }
        if !removed.is_empty() {
            info!(
                "index removing segments {:?}",
                removed.iter().map(|(id, _)| *id).collect::<Vec<_>>()
            );
        }
        for (id, entry) in removed {
            let provider = self.provider.clone();
            let compactor = self.compactor.clone();
            let action: SyncAction = Box::new(move || {
                let _ = provider.delete(id as u64);
                compactor.release_stats(id as i32);
            });
            // The Sender is dropped at the end of this iteration, closing
            // the queue; the worker pool only observes the close once
            // this barrier (and everything enqueued before it) drains.
            let _ = entry.queue_tx.send(IndexRequest::sync(action, None));
        }
        Ok(())
    }

    /// Enqueues `req` onto its cache segment's queue.
    pub fn handle_request(&self, req: IndexRequest) -> Result<()> {
        let shards = self.shards.read()?;
        match shards.get(&req.cache_seg) {
            Some(entry) => {
                entry.queue_tx.send(req)?;
                Ok(())
            }
            None => err_at!(UnReachable, msg: "no shard for cache segment {}", req.cache_seg),
        }
    }

    /// Direct (non-queued) read: parallel readers never wait on a
    /// shard's applier.
    pub fn get(
        &self,
        cache_seg: u32,
        key: &[u8],
        op: LookupOp,
    ) -> Result<Option<EntryLocation>> {
        let shards = self.shards.read()?;
        match shards.get(&cache_seg) {
            Some(entry) => entry.shard.lookup(key, op),
            None => err_at!(UnReachable, msg: "no shard for cache segment {}", cache_seg),
        }
    }

    pub fn scan_segment(&self, cache_seg: u32) -> Result<Vec<(Vec<u8>, EntryLocation)>> {
        let shards = self.shards.read()?;
        match shards.get(&cache_seg) {
            Some(entry) => entry.shard.scan()?.collect(),
            None => err_at!(UnReachable, msg: "no shard for cache segment {}", cache_seg),
        }
    }

    /// Highest `seqId` stored across every shard, for re-seeding a
    /// global write-sequence counter at startup.
    pub fn max_seq_id(&self) -> Result<u64> {
        let shards = self.shards.read()?;
        let mut max_seq = 0u64;
        for entry in shards.values() {
            max_seq = max_seq.max(entry.shard.max_seq_id()?);
        }
        Ok(max_seq)
    }

    /// Broadcasts a `SYNC_REQUEST` to every shard; `action` runs exactly
    /// once, on whichever applier thread processes the last one. Does
    /// not block — used to schedule data-file deletion safely once every
    /// shard has observed the writes that made the file obsolete.
    pub fn ensure_run_on_last(&self, action: Box<dyn FnOnce() + Send>) -> Result<()> {
        let shards = self.shards.read()?;
        if shards.is_empty() {
            action();
            return Ok(());
        }
        let remaining = Arc::new(AtomicUsize::new(shards.len()));
        let action = Arc::new(Mutex::new(Some(action)));
        for entry in shards.values() {
            let remaining = remaining.clone();
            let action = action.clone();
            let sync_action: SyncAction = Box::new(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Ok(mut guard) = action.lock() {
                        if let Some(f) = guard.take() {
                            f();
                        }
                    }
                }
            });
            entry.queue_tx.send(IndexRequest::sync(sync_action, None))?;
        }
        Ok(())
    }

    /// Broadcasts `CLEAR` to every shard and waits for all of them.
    pub fn clear(&self) -> Result<()> {
        let shards = self.shards.read()?;
        let mut receivers = Vec::with_capacity(shards.len());
        for entry in shards.values() {
            let (tx, rx) = mpsc::channel();
            entry.queue_tx.send(IndexRequest::clear(Some(tx)))?;
            receivers.push(rx);
        }
        drop(shards);
        for rx in receivers {
            match rx.recv()? {
                IndexReply::Cleared => {}
                IndexReply::Failed(e) => return Err(e),
                other => {
                    return err_at!(UnReachable, msg: "unexpected reply to CLEAR: {:?}", other)
                }
            }
        }
        Ok(())
    }

    /// Sum of the live-entry counters for `segments`. A negative sum
    /// (individual shards can go negative under the overwrite-hook
    /// arithmetic) saturates to `u64::MAX` rather than wrapping; a
    /// positive sum saturates instead of overflowing.
    pub fn approximate_size(&self, segments: &[u32]) -> Result<u64> {
        let shards = self.shards.read()?;
        let mut total: i64 = 0;
        for seg in segments {
            if let Some(entry) = shards.get(seg) {
                total = total.saturating_add(entry.shard.live_count());
            }
        }
        if total < 0 {
            Ok(u64::MAX)
        } else {
            Ok(total as u64)
        }
    }

    /// Barrier-drains every shard's queue, finalizes each shard's header
    /// and free-block catalog, then writes the `index-count`/`index.stats`
    /// sidecars. Worker threads are left running — call [Index::shutdown]
    /// to also join them.
    pub fn stop(&self) -> Result<()> {
        let shards = std::mem::take(&mut *self.shards.write()?);

        let mut receivers = Vec::with_capacity(shards.len());
        for (&id, entry) in shards.iter() {
            let (tx, rx) = mpsc::channel();
            entry
                .queue_tx
                .send(IndexRequest::sync(Box::new(|| {}), Some(tx)))?;
            receivers.push((id, rx));
        }

        let mut final_counts = HashMap::with_capacity(receivers.len());
        for (id, rx) in receivers {
            match rx.recv()? {
                IndexReply::SyncDone => {}
                IndexReply::Failed(e) => return Err(e),
                other => {
                    return err_at!(UnReachable, msg: "unexpected drain reply: {:?}", other)
                }
            }
            let stats = shards.get(&id).unwrap().shard.finalize()?;
            final_counts.insert(id, stats.live_count.max(0) as u64);
        }

        // Dropping every queue_tx closes the channel; the pool's workers
        // notice on their next Select and drop these shards.
        drop(shards);

        write_index_count_sidecar(&self.config, &final_counts)?;
        write_index_stats_sidecar(&self.config, self.compactor.as_ref())?;
        info!(
            "index stopped at {:?}: {} segments drained and finalized",
            self.config.dir,
            final_counts.len()
        );
        Ok(())
    }

    /// `stop()` followed by joining every worker thread. Consumes the
    /// index; there is no re-opening a stopped one.
    pub fn shutdown(self) -> Result<()> {
        self.stop()?;
        self.pool.join();
        info!("index shut down at {:?}", self.config.dir);
        Ok(())
    }
}

fn spawn_shard(
    provider: &Arc<FileHandleProvider>,
    pool: &WorkerPool,
    id: u32,
    config: &Config,
    clock: Arc<dyn TimeService>,
    temp_table: Arc<dyn TemporaryTable>,
    completion: Arc<dyn NonBlockingManager>,
) -> Result<(ShardEntry, bool)> {
    let handle = provider.open(id as u64)?;
    let (shard, loaded_gracefully) = Shard::open(
        handle,
        id,
        config.cache_segments,
        config.min_node_size,
        config.max_node_size,
        clock,
        temp_table,
        completion,
    )?;
    let shard = Arc::new(shard);
    let (tx, rx) = crossbeam_channel::unbounded();
    let handler_shard = shard.clone();
    pool.assign(rx, Box::new(move |req| handler_shard.apply(req)));
    Ok((ShardEntry { shard, queue_tx: tx }, loaded_gracefully))
}

fn read_index_count_sidecar(config: &Config) -> Option<HashMap<u32, i64>> {
    let bytes = std::fs::read(config.dir.join(INDEX_COUNT_FILE)).ok()?;
    if bytes.len() < 4 {
        return None;
    }
    let segment_count = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
    if segment_count != config.cache_segments {
        return None;
    }
    let expected_len = 4 + segment_count as usize * 8;
    if bytes.len() != expected_len {
        return None;
    }
    let mut map = HashMap::with_capacity(segment_count as usize);
    for seg in 0..segment_count {
        let start = 4 + seg as usize * 8;
        let v = u64::from_be_bytes(bytes[start..start + 8].try_into().ok()?);
        map.insert(seg, v as i64);
    }
    Some(map)
}

fn write_index_count_sidecar(config: &Config, counts: &HashMap<u32, u64>) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + counts.len() * 8);
    buf.extend_from_slice(&config.cache_segments.to_be_bytes());
    for seg in 0..config.cache_segments {
        let v = counts.get(&seg).copied().unwrap_or(0);
        buf.extend_from_slice(&v.to_be_bytes());
    }
    err_at!(IoError, std::fs::write(config.dir.join(INDEX_COUNT_FILE), &buf))
}

fn read_index_stats_sidecar(config: &Config) -> Option<Vec<FileStats>> {
    let bytes = std::fs::read(config.dir.join(INDEX_STATS_FILE)).ok()?;
    if bytes.len() % STATS_RECORD_LEN != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(bytes.len() / STATS_RECORD_LEN);
    for chunk in bytes.chunks_exact(STATS_RECORD_LEN) {
        out.push(FileStats {
            file_id: i32::from_be_bytes(chunk[0..4].try_into().ok()?),
            total_bytes: i32::from_be_bytes(chunk[4..8].try_into().ok()?),
            free_bytes: i32::from_be_bytes(chunk[8..12].try_into().ok()?),
            next_expiration_time: i64::from_be_bytes(chunk[12..20].try_into().ok()?),
        });
    }
    Some(out)
}

fn write_index_stats_sidecar(config: &Config, compactor: &dyn Compactor) -> Result<()> {
    let stats = compactor.get_file_stats();
    let mut buf = Vec::with_capacity(stats.len() * STATS_RECORD_LEN);
    for s in stats.values() {
        buf.extend_from_slice(&s.file_id.to_be_bytes());
        buf.extend_from_slice(&s.total_bytes.to_be_bytes());
        buf.extend_from_slice(&s.free_bytes.to_be_bytes());
        buf.extend_from_slice(&s.next_expiration_time.to_be_bytes());
    }
    err_at!(IoError, std::fs::write(config.dir.join(INDEX_STATS_FILE), &buf))
}

#[cfg(test)]
#[path = "index_test.rs"]
mod index_test;
