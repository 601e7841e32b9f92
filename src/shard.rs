//! A shard (cache segment): one on-disk index file, its B+tree, and the
//! single-consumer applier that serializes every mutation against it
//! (invariant I1/P9). A reader holds the root `RwLock`'s read guard for
//! its entire descent, not just the snapshot of the root slot; the
//! applier swaps the root under the write guard, which by `RwLock`'s own
//! semantics does not complete until every reader still descending the
//! old tree has finished. Only once that swap has returned does the
//! applier recycle the slots the mutation freed — until then they stay
//! staged, unreachable from `allocate`, so a concurrent reader can never
//! observe a slot being overwritten underneath it.

use std::convert::TryInto;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use log::{debug, warn};

use crate::collab::{NonBlockingManager, TemporaryTable, TimeService};
use crate::entry::EntryLocation;
use crate::err_at;
use crate::error::Result;
use crate::files::Handle;
use crate::node::{
    self, calculate_max_seq_id, commit_free, set_position, LookupOp, Node, NodeIo, ScanIter,
    SetRequest,
};
use crate::request::{IndexReply, IndexRequest, RequestType};
use crate::space::{FreeBlockCatalog, IndexSpace};

const HEADER_LEN: u64 = 34;
const MAGIC_GRACEFULLY: u32 = 0x512A_CEF2;
const MAGIC_DIRTY: u32 = 0xD112_770C;

struct Header {
    magic: u32,
    segment_count: u32,
    root_offset: u64,
    root_len: u16,
    free_blocks_offset: u64,
    element_count: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..8].copy_from_slice(&self.segment_count.to_be_bytes());
        buf[8..16].copy_from_slice(&self.root_offset.to_be_bytes());
        buf[16..18].copy_from_slice(&self.root_len.to_be_bytes());
        buf[18..26].copy_from_slice(&self.free_blocks_offset.to_be_bytes());
        buf[26..34].copy_from_slice(&self.element_count.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN as usize]) -> Header {
        Header {
            magic: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            segment_count: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            root_offset: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            root_len: u16::from_be_bytes(buf[16..18].try_into().unwrap()),
            free_blocks_offset: u64::from_be_bytes(buf[18..26].try_into().unwrap()),
            element_count: u64::from_be_bytes(buf[26..34].try_into().unwrap()),
        }
    }
}

struct ShardMutable {
    catalog: FreeBlockCatalog,
    file_size: u64,
}

/// Stats handed back to the index facade after a graceful stop, for the
/// `index-count`/`index.stats` sidecars.
pub struct ShardFinalStats {
    pub live_count: i64,
}

/// A scan in progress. Keeps the root's read guard alive for as long as
/// the caller keeps iterating.
pub struct ShardScan<'a> {
    _guard: RwLockReadGuard<'a, IndexSpace>,
    inner: ScanIter<'a>,
}

impl<'a> Iterator for ShardScan<'a> {
    type Item = Result<(Vec<u8>, EntryLocation)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// One cache segment's index file, tree, and applier state.
pub struct Shard {
    id: u32,
    segment_count: u32,
    handle: Handle,
    min_node_size: u16,
    max_node_size: u16,
    root: RwLock<IndexSpace>,
    mutable: Mutex<ShardMutable>,
    live_count: AtomicI64,
    clock: Arc<dyn TimeService>,
    temp_table: Arc<dyn TemporaryTable>,
    completion: Arc<dyn NonBlockingManager>,
}

impl Shard {
    /// Opens (or creates) this shard's index file. The returned `bool` is
    /// whether the prior run's graceful-stop header was found intact; a
    /// caller load()ing an entire index should treat `false` from *any*
    /// shard as "the whole index is dirty, rebuild from data files".
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        handle: Handle,
        id: u32,
        cache_segments: u32,
        min_node_size: u16,
        max_node_size: u16,
        clock: Arc<dyn TimeService>,
        temp_table: Arc<dyn TemporaryTable>,
        completion: Arc<dyn NonBlockingManager>,
    ) -> Result<(Shard, bool)> {
        let disk_size = handle.size()?;
        let loaded = if disk_size >= HEADER_LEN {
            try_load_graceful(&handle, cache_segments, disk_size)
        } else {
            None
        };

        let (root, catalog, file_size, live_count, loaded_gracefully) = match loaded {
            Some((root, catalog, file_size, live_count)) => {
                handle.write(&MAGIC_DIRTY.to_be_bytes(), 0)?;
                (root, catalog, file_size, live_count, true)
            }
            None => {
                let (root, catalog, file_size) =
                    init_fresh(&handle, cache_segments, min_node_size, max_node_size)?;
                (root, catalog, file_size, 0, false)
            }
        };

        Ok((
            Shard {
                id,
                segment_count: cache_segments,
                handle,
                min_node_size,
                max_node_size,
                root: RwLock::new(root),
                mutable: Mutex::new(ShardMutable { catalog, file_size }),
                live_count: AtomicI64::new(live_count),
                clock,
                temp_table,
                completion,
            },
            loaded_gracefully,
        ))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn live_count(&self) -> i64 {
        self.live_count.load(Ordering::SeqCst)
    }

    /// Read-only descent; never touches the applier's private state.
    /// Holds the root's read guard for the whole descent rather than
    /// just the snapshot, so the applier's write-lock swap can't
    /// complete (and recycle the slots this descent may still be
    /// reading) until this call returns.
    pub fn lookup(&self, key: &[u8], op: LookupOp) -> Result<Option<EntryLocation>> {
        let guard = self.root.read()?;
        let root = *guard;
        node::apply_on_leaf(&self.handle, root, key, op, self.clock.now_millis())
    }

    /// Lazily walks every leaf entry reachable from the current root.
    /// The returned iterator holds the root's read guard for as long as
    /// it is alive, so the applier's next root swap waits for the scan
    /// to be dropped before recycling anything it freed.
    pub fn scan(&self) -> Result<ShardScan<'_>> {
        let guard = self.root.read()?;
        let root = *guard;
        let inner = ScanIter::new(&self.handle, root)?;
        Ok(ShardScan { _guard: guard, inner })
    }

    /// Highest `seqId` stored in any leaf entry, used to re-seed a
    /// global write-sequence counter at startup.
    pub fn max_seq_id(&self) -> Result<u64> {
        let guard = self.root.read()?;
        let root = *guard;
        calculate_max_seq_id(&self.handle, root)
    }

    /// The applier entry point: processes exactly one request. Intended
    /// to be the sole handler registered for this shard's queue in the
    /// worker pool, so it is never called concurrently with itself.
    pub fn apply(&self, req: IndexRequest) {
        let IndexRequest {
            req_type,
            key,
            new_loc,
            prev,
            sync_action,
            reply,
            ..
        } = req;

        let result = match req_type {
            RequestType::Clear => self.reset_to_empty().map(|()| IndexReply::Cleared),
            RequestType::SyncRequest => {
                if let Some(action) = sync_action {
                    action();
                }
                Ok(IndexReply::SyncDone)
            }
            other => self.do_mutate(other, key, new_loc, prev),
        };

        let msg = match result {
            Ok(ok_reply) => {
                debug!("shard {} applied {:?} -> {:?}", self.id, req_type, ok_reply);
                ok_reply
            }
            Err(err) => {
                warn!("shard {} failed to apply {:?}: {}", self.id, req_type, err);
                IndexReply::Failed(err)
            }
        };

        let tx = match reply {
            Some(tx) => tx,
            None => return,
        };
        self.completion.complete(Box::new(move || {
            let _ = tx.send(msg);
        }));
    }

    fn do_mutate(
        &self,
        req_type: RequestType,
        key: Vec<u8>,
        new_loc: Option<EntryLocation>,
        prev: Option<(i64, i64)>,
    ) -> Result<IndexReply> {
        let (record_change, hook) = match req_type.binding() {
            Some(binding) => binding,
            None => return err_at!(UnReachable, msg: "request type {:?} has no setPosition binding", req_type),
        };
        let new_loc = match new_loc {
            Some(loc) => loc,
            None => return err_at!(UnReachable, msg: "mutating request is missing its new location"),
        };
        let set_req = SetRequest {
            key: key.clone(),
            new_loc,
            prev,
            record_change,
            hook,
        };

        let root_before = *self.root.read()?;
        let mut freed = Vec::new();
        let outcome = {
            let mut mutable = self.mutable.lock()?;
            let mutable = &mut *mutable;
            let mut io = NodeIo {
                handle: &self.handle,
                catalog: &mut mutable.catalog,
                file_size: &mut mutable.file_size,
                min_node_size: self.min_node_size,
                max_node_size: self.max_node_size,
                deferred: &mut freed,
            };
            set_position(&mut io, root_before, &set_req)?
        };

        // Blocks until every reader still descending `root_before` has
        // returned (RwLock::write waits out existing readers), so the
        // slots in `freed` are safe to recycle the moment this returns.
        *self.root.write()? = outcome.new_root;

        if !freed.is_empty() {
            let mut mutable = self.mutable.lock()?;
            let mutable = &mut *mutable;
            for space in freed {
                commit_free(&self.handle, &mut mutable.catalog, &mut mutable.file_size, space)?;
            }
        }

        if outcome.size_delta != 0 {
            self.live_count.fetch_add(outcome.size_delta, Ordering::SeqCst);
        }
        if outcome.applied {
            if let Some((file, offset)) = outcome.installed {
                self.temp_table.remove_conditionally(self.id, &key, file, offset);
            }
        }

        Ok(IndexReply::Applied {
            applied: outcome.applied,
            overwritten: outcome.overwritten,
        })
    }

    /// Resets the tree to an empty leaf, truncates the file back to just
    /// the header, and zeroes the live-entry counter. Used both for the
    /// `CLEAR` request and to force a shard into a known-empty state
    /// when the index as a whole is declared dirty at load. The empty
    /// root is the zero-length sentinel, so nothing is written past the
    /// header — the file ends up exactly `HEADER_LEN` bytes long.
    pub fn reset_to_empty(&self) -> Result<()> {
        let root = {
            let mut mutable = self.mutable.lock()?;
            self.handle.truncate(HEADER_LEN)?;
            mutable.catalog = FreeBlockCatalog::new();
            mutable.file_size = HEADER_LEN;
            IndexSpace::empty_root(HEADER_LEN)
        };
        *self.root.write()? = root;
        self.live_count.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Writes the free-block catalog and a `GRACEFULLY` header, fsyncs,
    /// and reports this shard's final live-entry count for the
    /// `index-count` sidecar. Only correct to call once every in-flight
    /// request has drained (the caller owns that ordering, per the
    /// index facade's `stop()`).
    pub fn finalize(&self) -> Result<ShardFinalStats> {
        let root = *self.root.read()?;
        let mutable = self.mutable.lock()?;
        let free_blocks_offset = mutable.file_size;
        let mut buf = Vec::with_capacity(mutable.catalog.encoded_len());
        mutable.catalog.encode(&mut buf);
        self.handle.write(&buf, free_blocks_offset)?;

        let live_count = self.live_count.load(Ordering::SeqCst);
        let header = Header {
            magic: MAGIC_GRACEFULLY,
            segment_count: self.segment_count,
            root_offset: root.offset,
            root_len: root.length,
            free_blocks_offset,
            element_count: live_count.max(0) as u64,
        };
        self.handle.write(&header.encode(), 0)?;
        self.handle.force(true)?;
        Ok(ShardFinalStats { live_count })
    }
}

/// Attempts to restore a shard from a prior graceful stop. Returns
/// `None` for anything that disqualifies the file (bad magic, segment
/// count drift, truncated/corrupt catalog) — the caller then falls back
/// to [init_fresh].
fn try_load_graceful(
    handle: &Handle,
    cache_segments: u32,
    disk_size: u64,
) -> Option<(IndexSpace, FreeBlockCatalog, u64, i64)> {
    let mut hdr_buf = [0u8; HEADER_LEN as usize];
    handle.read(&mut hdr_buf, 0).ok()?;
    let header = Header::decode(&hdr_buf);
    if header.magic != MAGIC_GRACEFULLY || header.segment_count != cache_segments {
        return None;
    }

    let catalog_len = disk_size.saturating_sub(header.free_blocks_offset);
    let mut cat_buf = vec![0u8; catalog_len as usize];
    if catalog_len > 0 {
        handle.read(&mut cat_buf, header.free_blocks_offset).ok()?;
    }
    let catalog = FreeBlockCatalog::decode(&cat_buf).ok()?;
    let root = IndexSpace::new(header.root_offset, header.root_len);
    Some((root, catalog, header.free_blocks_offset, header.element_count as i64))
}

/// Truncates the file and writes a brand-new empty tree plus a `DIRTY`
/// header, for a shard with no usable prior state.
fn init_fresh(
    handle: &Handle,
    cache_segments: u32,
    min_node_size: u16,
    max_node_size: u16,
) -> Result<(IndexSpace, FreeBlockCatalog, u64)> {
    handle.truncate(0)?;
    let mut catalog = FreeBlockCatalog::new();
    let mut file_size = HEADER_LEN;
    let root = {
        let mut deferred = Vec::new();
        let mut io = NodeIo {
            handle,
            catalog: &mut catalog,
            file_size: &mut file_size,
            min_node_size,
            max_node_size,
            deferred: &mut deferred,
        };
        io.alloc_write(&Node::empty_leaf())?
    };
    let header = Header {
        magic: MAGIC_DIRTY,
        segment_count: cache_segments,
        root_offset: root.offset,
        root_len: root.length,
        free_blocks_offset: file_size,
        element_count: 0,
    };
    handle.write(&header.encode(), 0)?;
    Ok((root, catalog, file_size))
}

#[cfg(test)]
#[path = "shard_test.rs"]
mod shard_test;
