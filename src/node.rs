//! The immutable on-disk B+tree-like node and the tree algorithms that
//! operate on it: descent for reads, and `setPosition` — the single
//! mutator that inserts/updates/tombstones a key and rebalances the
//! tree (split on overflow, merge-or-redistribute on underflow).
//!
//! Every write allocates a *fresh* [IndexSpace] slot for the node it is
//! replacing (write-new-then-swap, invariant I2) and returns the old
//! slot to the shard's [FreeBlockCatalog]. Nothing here ever mutates
//! bytes in place.

use std::convert::TryInto;

use crate::entry::EntryLocation;
use crate::err_at;
use crate::error::Result;
use crate::files::Handle;
use crate::space::{FreeBlockCatalog, IndexSpace};

const TAG_INNER: u8 = 0;
const TAG_LEAF: u8 = 1;

/// An immutable B+tree-like node, decoded from its on-disk slot.
#[derive(Debug, Clone)]
pub enum Node {
    /// `keys.len() + 1 == children.len()`. `keys[i]` is the upper bound
    /// (exclusive) separating `children[i]` from `children[i + 1]`.
    Inner {
        keys: Vec<Vec<u8>>,
        children: Vec<IndexSpace>,
    },
    /// Sorted by key.
    Leaf {
        entries: Vec<(Vec<u8>, EntryLocation)>,
    },
}

impl Node {
    pub fn empty_leaf() -> Node {
        Node::Leaf { entries: vec![] }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn num_entries(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Inner { children, .. } => children.len(),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Node::Leaf { entries } => {
                buf.push(TAG_LEAF);
                buf.extend_from_slice(&(entries.len() as u16).to_be_bytes());
                for (key, loc) in entries {
                    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
                    buf.extend_from_slice(key);
                    loc.encode(buf);
                }
            }
            Node::Inner { keys, children } => {
                buf.push(TAG_INNER);
                buf.extend_from_slice(&(keys.len() as u16).to_be_bytes());
                for child in children {
                    child.encode(buf);
                }
                for key in keys {
                    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
                    buf.extend_from_slice(key);
                }
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Leaf { entries } => {
                3 + entries
                    .iter()
                    .map(|(k, _)| 2 + k.len() + EntryLocation::ENCODED_LEN)
                    .sum::<usize>()
            }
            Node::Inner { keys, children } => {
                3 + children.len() * IndexSpace::ENCODED_LEN as usize
                    + keys.iter().map(|k| 2 + k.len()).sum::<usize>()
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Node> {
        if buf.is_empty() {
            return err_at!(InvalidNode, msg: "empty node buffer");
        }
        let mut pos = 1usize;
        let need = |pos: usize, n: usize| -> Result<()> {
            if pos + n > buf.len() {
                err_at!(InvalidNode, msg: "node buffer truncated")
            } else {
                Ok(())
            }
        };
        match buf[0] {
            TAG_LEAF => {
                need(pos, 2)?;
                let n = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
                pos += 2;
                let mut entries = Vec::with_capacity(n);
                for _ in 0..n {
                    need(pos, 2)?;
                    let klen = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
                    pos += 2;
                    need(pos, klen + EntryLocation::ENCODED_LEN)?;
                    let key = buf[pos..pos + klen].to_vec();
                    pos += klen;
                    let loc = EntryLocation::decode(&buf[pos..pos + EntryLocation::ENCODED_LEN]);
                    pos += EntryLocation::ENCODED_LEN;
                    entries.push((key, loc));
                }
                Ok(Node::Leaf { entries })
            }
            TAG_INNER => {
                need(pos, 2)?;
                let n_keys =
                    u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
                pos += 2;
                let n_children = n_keys + 1;
                need(pos, n_children * IndexSpace::ENCODED_LEN as usize)?;
                let mut children = Vec::with_capacity(n_children);
                for _ in 0..n_children {
                    children.push(IndexSpace::decode(
                        &buf[pos..pos + IndexSpace::ENCODED_LEN as usize],
                    ));
                    pos += IndexSpace::ENCODED_LEN as usize;
                }
                let mut keys = Vec::with_capacity(n_keys);
                for _ in 0..n_keys {
                    need(pos, 2)?;
                    let klen = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
                    pos += 2;
                    need(pos, klen)?;
                    keys.push(buf[pos..pos + klen].to_vec());
                    pos += klen;
                }
                Ok(Node::Inner { keys, children })
            }
            tag => err_at!(InvalidNode, msg: "unknown node tag {}", tag),
        }
    }

    /// Index of the child covering `key`, per the upper-bound convention:
    /// children left of `keys[i]` hold keys `< keys[i]`.
    fn child_index(keys: &[Vec<u8>], key: &[u8]) -> usize {
        keys.partition_point(|k| k.as_slice() <= key)
    }
}

/// Read and decode the node at `space`. A zero-length slot is the
/// sentinel for an empty root that was never materialized on disk (see
/// [IndexSpace::empty_root]) and decodes to an empty leaf without
/// touching the file.
pub fn read_node(handle: &Handle, space: IndexSpace) -> Result<Node> {
    if space.length == 0 {
        return Ok(Node::empty_leaf());
    }
    let mut buf = vec![0u8; space.length as usize];
    handle.read(&mut buf, space.offset)?;
    Node::decode(&buf)
}

/// Mutable, applier-private context threaded through every write in this
/// module. Only ever touched by the single applier thread for a shard
/// (invariant I1).
///
/// `allocate` only ever draws from `catalog`, never from `deferred`: a
/// slot a call to `set_position` frees is still reachable through the
/// root that is published until the applier swaps it in, so it must not
/// be handed back out to a concurrent allocation within the same call.
/// The caller merges `deferred` into `catalog` only after publishing the
/// new root and waiting out every reader still traversing the old one.
pub struct NodeIo<'a> {
    pub handle: &'a Handle,
    pub catalog: &'a mut FreeBlockCatalog,
    pub file_size: &'a mut u64,
    pub min_node_size: u16,
    pub max_node_size: u16,
    pub deferred: &'a mut Vec<IndexSpace>,
}

impl<'a> NodeIo<'a> {
    pub(crate) fn alloc_write(&mut self, node: &Node) -> Result<IndexSpace> {
        let mut buf = Vec::with_capacity(node.encoded_len());
        node.encode(&mut buf);
        let len: u16 = err_at!(Fatal, buf.len().try_into())?;
        let space = self.catalog.allocate(len, self.file_size);
        self.handle.write(&buf, space.offset)?;
        Ok(space)
    }

    /// Stages `space` for reclamation; it is not reusable until
    /// [commit_free] runs on it, after the new root is published and
    /// quiescent.
    pub(crate) fn free(&mut self, space: IndexSpace) {
        // The sentinel empty root was never allocated; nothing to stage.
        if space.length != 0 {
            self.deferred.push(space);
        }
    }
}

/// Merges a previously-staged free back into `catalog`, truncating the
/// file if it sat at the tail. Only safe to call once no reader can
/// still be traversing the root that referenced `space`.
pub(crate) fn commit_free(
    handle: &Handle,
    catalog: &mut FreeBlockCatalog,
    file_size: &mut u64,
    space: IndexSpace,
) -> Result<()> {
    match catalog.free(space, file_size) {
        crate::space::FreeOutcome::Cataloged => Ok(()),
        crate::space::FreeOutcome::Shrunk(size) => handle.truncate(size),
    }
}

/// Read-only lookup kinds for [apply_on_leaf].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOp {
    /// Visible (file, offset); null for tombstones or expired entries.
    GetPosition,
    /// Same visibility rule as `GetPosition`; semantically distinct at
    /// the caller (fetches the record, not just its coordinates).
    GetRecord,
    /// Ignores expiration, still null for tombstones.
    GetExpiredRecord,
    /// Raw leaf entry, ignoring both tombstone and expiry filtering.
    GetInfo,
}

/// Traverse from `root` down to the leaf covering `key` and apply `op`.
pub fn apply_on_leaf(
    handle: &Handle,
    root: IndexSpace,
    key: &[u8],
    op: LookupOp,
    now_millis: i64,
) -> Result<Option<EntryLocation>> {
    let mut space = root;
    loop {
        match read_node(handle, space)? {
            Node::Inner { keys, children } => {
                let idx = Node::child_index(&keys, key);
                space = children[idx];
            }
            Node::Leaf { entries } => {
                let found = entries
                    .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                    .ok()
                    .map(|i| entries[i].1);
                return Ok(match (op, found) {
                    (LookupOp::GetInfo, loc) => loc,
                    (_, None) => None,
                    (LookupOp::GetExpiredRecord, Some(loc)) => {
                        if loc.is_tombstone() {
                            None
                        } else {
                            Some(loc)
                        }
                    }
                    (_, Some(loc)) => {
                        if loc.is_tombstone() || loc.is_expired(now_millis) {
                            None
                        } else {
                            Some(loc)
                        }
                    }
                });
            }
        }
    }
}

/// Scan every leaf entry for the highest `seqId`, used to re-seed the
/// write sequence counter at startup.
pub fn calculate_max_seq_id(handle: &Handle, root: IndexSpace) -> Result<u64> {
    let mut max_seq = 0u64;
    let mut stack = vec![root];
    while let Some(space) = stack.pop() {
        match read_node(handle, space)? {
            Node::Inner { children, .. } => stack.extend(children),
            Node::Leaf { entries } => {
                for (_, loc) in entries {
                    max_seq = max_seq.max(loc.seq_id);
                }
            }
        }
    }
    Ok(max_seq)
}

/// How `setPosition` should adjust a leaf entry's `num_records` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordChange {
    Increase,
    IncreaseForOld,
    Decrease,
    Move,
}

/// The three fixed overwrite strategies from §4.4, expressed as a
/// tagged variant rather than dynamic dispatch (per design note 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteHook {
    /// UPDATE: always applies; `size_delta` derives from the
    /// transition between the *previous stored* location and the new
    /// one, ignoring the request's claimed `prev`.
    Update,
    /// MOVED: applies only if the current leaf entry's (file, offset)
    /// equals the request's `prev`.
    Moved,
    /// DROPPED: same guard as `Moved`.
    Dropped,
    /// FOUND_OLD: always applies, no size-counter side effect.
    Noop,
}

/// A mutation request bound for `set_position`.
pub struct SetRequest {
    pub key: Vec<u8>,
    pub new_loc: EntryLocation,
    pub prev: Option<(i64, i64)>,
    pub record_change: RecordChange,
    pub hook: OverwriteHook,
}

/// Outcome of `set_position`.
pub struct SetOutcome {
    pub new_root: IndexSpace,
    pub applied: bool,
    pub overwritten: bool,
    pub size_delta: i64,
    /// (file, offset) that ended up installed for `key`, iff applied;
    /// used by the applier to conditionally evict the TemporaryTable
    /// fast-path entry.
    pub installed: Option<(i64, i64)>,
}

enum Propagate {
    /// Nothing in this subtree changed; no IO happened.
    Unchanged(IndexSpace),
    /// This subtree's single representative slot changed.
    Replace(IndexSpace),
    /// This subtree split in two; the right half's minimum key becomes
    /// the new separator the parent must insert.
    Split {
        left: IndexSpace,
        right_key: Vec<u8>,
        right: IndexSpace,
    },
    /// This subtree fell below `min_node_size`; deferred (not written)
    /// so the parent can attempt a merge/redistribute against a
    /// sibling instead of wasting a write.
    TooSmall { node: Node, old_space: IndexSpace },
}

fn apply_hook(
    existing: Option<EntryLocation>,
    req: &SetRequest,
) -> (bool, i64, bool) {
    let overwritten = existing.is_some();
    match req.hook {
        OverwriteHook::Update => {
            let delta = match existing {
                Some(old) if req.new_loc.offset >= 0 && old.offset < 0 => 1,
                Some(old) if req.new_loc.offset < 0 && old.offset >= 0 => -1,
                None if req.new_loc.offset >= 0 => 1,
                _ => 0,
            };
            (true, delta, overwritten)
        }
        OverwriteHook::Moved => {
            let matches_prev = match (existing, req.prev) {
                (Some(old), Some((f, o))) => old.file == f && old.offset == o,
                _ => false,
            };
            if !matches_prev {
                (false, 0, overwritten)
            } else {
                let old = existing.unwrap();
                // Ambiguity preserved verbatim (see design notes): the
                // decrement fires whenever the new offset is negative
                // and the *previous* offset was non-negative, even
                // though at this point `old == prev` by the guard above.
                let delta = if req.new_loc.offset < 0 && old.offset >= 0 {
                    -1
                } else {
                    0
                };
                (true, delta, overwritten)
            }
        }
        OverwriteHook::Dropped => {
            let matches_prev = match (existing, req.prev) {
                (Some(old), Some((f, o))) => old.file == f && old.offset == o,
                _ => false,
            };
            if !matches_prev {
                (false, 0, overwritten)
            } else {
                (true, -1, overwritten)
            }
        }
        OverwriteHook::Noop => (true, 0, overwritten),
    }
}

fn next_num_records(existing: Option<EntryLocation>, change: RecordChange) -> u32 {
    let prev = existing.map(|e| e.num_records).unwrap_or(0);
    match change {
        RecordChange::Increase | RecordChange::IncreaseForOld => prev.saturating_add(1),
        RecordChange::Decrease => prev.saturating_sub(1),
        RecordChange::Move => prev,
    }
}

/// The only mutator on the tree. Descends to the leaf covering
/// `req.key`, applies the overwrite hook and record-change policy, and
/// rebalances back up to a new root.
pub fn set_position(io: &mut NodeIo, root: IndexSpace, req: &SetRequest) -> Result<SetOutcome> {
    let mut out = LeafOutcome::default();
    let propagate = recurse(io, root, true, req, &mut out)?;
    let new_root = match propagate {
        Propagate::Unchanged(space) | Propagate::Replace(space) => space,
        Propagate::Split {
            left,
            right_key,
            right,
        } => io.alloc_write(&Node::Inner {
            keys: vec![right_key],
            children: vec![left, right],
        })?,
        Propagate::TooSmall { node, old_space } => {
            // Root is exempt from the minimum-size rule (I3); both
            // `finish_leaf`/`finish_inner` already guard on `!is_root`,
            // so this arm is unreachable in practice.
            io.free(old_space);
            io.alloc_write(&node)?
        }
    };
    Ok(SetOutcome {
        new_root,
        applied: out.applied,
        overwritten: out.overwritten,
        size_delta: out.size_delta,
        installed: out.installed,
    })
}

#[derive(Default)]
struct LeafOutcome {
    applied: bool,
    overwritten: bool,
    size_delta: i64,
    installed: Option<(i64, i64)>,
}

fn recurse(
    io: &mut NodeIo,
    space: IndexSpace,
    is_root: bool,
    req: &SetRequest,
    out: &mut LeafOutcome,
) -> Result<Propagate> {
    match read_node(io.handle, space)? {
        Node::Leaf { mut entries } => {
            let found = entries.binary_search_by(|(k, _)| k.as_slice().cmp(&req.key));
            let existing = found.ok().map(|i| entries[i].1);

            let (applied, delta, overwritten) = apply_hook(existing, req);
            out.applied = applied;
            out.overwritten = overwritten;
            out.size_delta = delta;

            if !applied {
                return Ok(Propagate::Unchanged(space));
            }

            let num_records = next_num_records(existing, req.record_change);
            let loc = EntryLocation {
                num_records,
                ..req.new_loc
            };
            out.installed = Some((loc.file, loc.offset));

            match found {
                Ok(i) => entries[i] = (req.key.clone(), loc),
                Err(i) => entries.insert(i, (req.key.clone(), loc)),
            }

            finish_leaf(io, space, is_root, entries)
        }
        Node::Inner { mut keys, mut children } => {
            let idx = Node::child_index(&keys, &req.key);
            let child_propagate = recurse(io, children[idx], false, req, out)?;

            match child_propagate {
                Propagate::Unchanged(_) => Ok(Propagate::Unchanged(space)),
                Propagate::Replace(new_space) => {
                    children[idx] = new_space;
                    finish_inner(io, space, is_root, keys, children)
                }
                Propagate::Split {
                    left,
                    right_key,
                    right,
                } => {
                    children[idx] = left;
                    children.insert(idx + 1, right);
                    keys.insert(idx, right_key);
                    finish_inner(io, space, is_root, keys, children)
                }
                Propagate::TooSmall {
                    node: child_node,
                    old_space: child_old_space,
                } => rebalance_child(
                    io, space, is_root, keys, children, idx, child_node, child_old_space,
                ),
            }
        }
    }
}

fn finish_leaf(
    io: &mut NodeIo,
    old_space: IndexSpace,
    is_root: bool,
    entries: Vec<(Vec<u8>, EntryLocation)>,
) -> Result<Propagate> {
    let node = Node::Leaf { entries };
    let len = node.encoded_len();

    // TooSmall defers the decision (and the free of `old_space`) to the
    // parent, which alone can tell whether a merge or redistribution is
    // possible; Replace/Split commit here, so they free it themselves.
    if !is_root && len < io.min_node_size as usize {
        return Ok(Propagate::TooSmall { node, old_space });
    }

    io.free(old_space);
    if len > io.max_node_size as usize {
        let (left, right_key, right) = split_leaf(io, node)?;
        return Ok(Propagate::Split {
            left,
            right_key,
            right,
        });
    }
    Ok(Propagate::Replace(io.alloc_write(&node)?))
}

fn finish_inner(
    io: &mut NodeIo,
    old_space: IndexSpace,
    is_root: bool,
    keys: Vec<Vec<u8>>,
    children: Vec<IndexSpace>,
) -> Result<Propagate> {
    let node = Node::Inner { keys, children };
    let len = node.encoded_len();

    if !is_root && len < io.min_node_size as usize && node.num_entries() > 1 {
        return Ok(Propagate::TooSmall { node, old_space });
    }

    io.free(old_space);
    if len > io.max_node_size as usize {
        let (left, right_key, right) = split_inner(io, node)?;
        return Ok(Propagate::Split {
            left,
            right_key,
            right,
        });
    }
    Ok(Propagate::Replace(io.alloc_write(&node)?))
}

/// Pick the smallest split point `m` such that the left half
/// (`entries[..m]`) serializes within `max_node_size`.
fn split_leaf(
    io: &mut NodeIo,
    node: Node,
) -> Result<(IndexSpace, Vec<u8>, IndexSpace)> {
    let entries = match node {
        Node::Leaf { entries } => entries,
        Node::Inner { .. } => unreachable!(),
    };
    if entries.len() < 2 {
        return err_at!(Fatal, msg: "leaf overflow with < 2 entries, max_node_size too small");
    }
    let mut m = entries.len() / 2;
    // Grow the left half until adding one more would overflow, biased
    // to the midpoint so neither half is starved.
    loop {
        let left_len = Node::Leaf {
            entries: entries[..m].to_vec(),
        }
        .encoded_len();
        if left_len <= io.max_node_size as usize && m < entries.len() {
            let grown = Node::Leaf {
                entries: entries[..m + 1].to_vec(),
            }
            .encoded_len();
            if grown > io.max_node_size as usize || m + 1 >= entries.len() {
                break;
            }
            m += 1;
        } else if left_len > io.max_node_size as usize && m > 1 {
            m -= 1;
        } else {
            break;
        }
    }
    let right_entries = entries[m..].to_vec();
    let left_entries = entries[..m].to_vec();
    let right_key = right_entries[0].0.clone();

    let left = io.alloc_write(&Node::Leaf {
        entries: left_entries,
    })?;
    let right = io.alloc_write(&Node::Leaf {
        entries: right_entries,
    })?;
    Ok((left, right_key, right))
}

fn split_inner(
    io: &mut NodeIo,
    node: Node,
) -> Result<(IndexSpace, Vec<u8>, IndexSpace)> {
    let (keys, children) = match node {
        Node::Inner { keys, children } => (keys, children),
        Node::Leaf { .. } => unreachable!(),
    };
    if keys.len() < 2 {
        return err_at!(Fatal, msg: "inner overflow with < 2 keys, max_node_size too small");
    }
    // Median key is promoted to the parent and removed from both
    // halves.
    let m = keys.len() / 2;
    let right_key = keys[m].clone();

    let left_keys = keys[..m].to_vec();
    let left_children = children[..=m].to_vec();
    let right_keys = keys[m + 1..].to_vec();
    let right_children = children[m + 1..].to_vec();

    let left = io.alloc_write(&Node::Inner {
        keys: left_keys,
        children: left_children,
    })?;
    let right = io.alloc_write(&Node::Inner {
        keys: right_keys,
        children: right_children,
    })?;
    Ok((left, right_key, right))
}

/// `idx`'s child fell below `min_node_size`; merge it with a sibling
/// (left preferred, then right) or redistribute entries between them,
/// then fold the outcome into this node's own content and decide this
/// node's own propagation. `own_old_space` is this node's own
/// not-yet-freed slot, threaded through to `finish_inner`.
fn rebalance_child(
    io: &mut NodeIo,
    own_old_space: IndexSpace,
    is_root: bool,
    mut keys: Vec<Vec<u8>>,
    mut children: Vec<IndexSpace>,
    idx: usize,
    child_node: Node,
    child_old_space: IndexSpace,
) -> Result<Propagate> {
    let (sib_idx, sep_idx, child_is_left) = if idx > 0 {
        (idx - 1, idx - 1, false)
    } else if idx + 1 < children.len() {
        (idx + 1, idx, true)
    } else {
        return err_at!(Fatal, msg: "node with a single child has no sibling to rebalance with");
    };

    let sib_space = children[sib_idx];
    let sib_node = read_node(io.handle, sib_space)?;

    let (left_node, right_node) = if child_is_left {
        (child_node, sib_node)
    } else {
        (sib_node, child_node)
    };

    match (left_node, right_node) {
        (Node::Leaf { entries: mut le }, Node::Leaf { entries: re }) => {
            let combined_len = Node::Leaf {
                entries: le.iter().chain(re.iter()).cloned().collect(),
            }
            .encoded_len();

            io.free(sib_space);
            io.free(child_old_space);

            if combined_len <= io.max_node_size as usize {
                le.extend(re);
                let merged = io.alloc_write(&Node::Leaf { entries: le })?;
                children[sib_idx.min(idx)] = merged;
                children.remove(sib_idx.max(idx));
                keys.remove(sep_idx);
            } else {
                let (lsp, new_key, rsp) = redistribute_leaf(io, le, re)?;
                children[sib_idx.min(idx)] = lsp;
                children[sib_idx.max(idx)] = rsp;
                keys[sep_idx] = new_key;
            }
        }
        (Node::Inner { keys: mut lk, children: mut lc }, Node::Inner { keys: rk, children: rc }) => {
            let sep = keys[sep_idx].clone();
            let mut combined_keys = lk.clone();
            combined_keys.push(sep.clone());
            combined_keys.extend(rk.clone());
            let combined_children: Vec<IndexSpace> =
                lc.iter().chain(rc.iter()).cloned().collect();
            let combined_len = Node::Inner {
                keys: combined_keys.clone(),
                children: combined_children.clone(),
            }
            .encoded_len();

            io.free(sib_space);
            io.free(child_old_space);

            if combined_len <= io.max_node_size as usize {
                let merged = io.alloc_write(&Node::Inner {
                    keys: combined_keys,
                    children: combined_children,
                })?;
                children[sib_idx.min(idx)] = merged;
                children.remove(sib_idx.max(idx));
                keys.remove(sep_idx);
            } else {
                lk.push(sep);
                lk.extend(rk);
                let (lsp, new_key, rsp) = redistribute_inner(io, lk, lc.drain(..).chain(rc).collect())?;
                children[sib_idx.min(idx)] = lsp;
                children[sib_idx.max(idx)] = rsp;
                keys[sep_idx] = new_key;
            }
        }
        _ => return err_at!(Fatal, msg: "sibling node kind mismatch during rebalance"),
    }

    finish_inner(io, own_old_space, is_root, keys, children)
}

/// Move entries across the boundary until both halves are at least
/// `min_node_size`, without exceeding `max_node_size`.
fn redistribute_leaf(
    io: &mut NodeIo,
    mut left: Vec<(Vec<u8>, EntryLocation)>,
    mut right: Vec<(Vec<u8>, EntryLocation)>,
) -> Result<(IndexSpace, Vec<u8>, IndexSpace)> {
    let total = left.len() + right.len();
    let mut combined: Vec<(Vec<u8>, EntryLocation)> = Vec::with_capacity(total);
    combined.append(&mut left);
    combined.append(&mut right);

    let mut m = combined.len() / 2;
    loop {
        let lhs_len = Node::Leaf {
            entries: combined[..m].to_vec(),
        }
        .encoded_len();
        let rhs_len = Node::Leaf {
            entries: combined[m..].to_vec(),
        }
        .encoded_len();
        if lhs_len >= io.min_node_size as usize
            && rhs_len >= io.min_node_size as usize
            && lhs_len <= io.max_node_size as usize
            && rhs_len <= io.max_node_size as usize
        {
            break;
        }
        if lhs_len < io.min_node_size as usize && m + 1 < combined.len() {
            m += 1;
        } else if rhs_len < io.min_node_size as usize && m > 1 {
            m -= 1;
        } else {
            break;
        }
    }

    let right_key = combined[m].0.clone();
    let right_entries = combined[m..].to_vec();
    let left_entries = combined[..m].to_vec();
    let l = io.alloc_write(&Node::Leaf {
        entries: left_entries,
    })?;
    let r = io.alloc_write(&Node::Leaf {
        entries: right_entries,
    })?;
    Ok((l, right_key, r))
}

fn redistribute_inner(
    io: &mut NodeIo,
    combined_keys: Vec<Vec<u8>>,
    combined_children: Vec<IndexSpace>,
) -> Result<(IndexSpace, Vec<u8>, IndexSpace)> {
    if combined_keys.is_empty() {
        return err_at!(Fatal, msg: "inner redistribute with no keys");
    }
    let mut m = combined_keys.len() / 2;
    loop {
        let lhs_len = Node::Inner {
            keys: combined_keys[..m].to_vec(),
            children: combined_children[..=m].to_vec(),
        }
        .encoded_len();
        let rhs_len = Node::Inner {
            keys: combined_keys[m + 1..].to_vec(),
            children: combined_children[m + 1..].to_vec(),
        }
        .encoded_len();
        if lhs_len <= io.max_node_size as usize && rhs_len <= io.max_node_size as usize {
            break;
        }
        if m + 1 < combined_keys.len() {
            m += 1;
        } else {
            break;
        }
    }
    let right_key = combined_keys[m].clone();
    let left = io.alloc_write(&Node::Inner {
        keys: combined_keys[..m].to_vec(),
        children: combined_children[..=m].to_vec(),
    })?;
    let right = io.alloc_write(&Node::Inner {
        keys: combined_keys[m + 1..].to_vec(),
        children: combined_children[m + 1..].to_vec(),
    })?;
    Ok((left, right_key, right))
}

/// Lazily walks every leaf entry reachable from `root`, depth-first.
pub struct ScanIter<'a> {
    handle: &'a Handle,
    stack: Vec<(Node, usize)>,
}

impl<'a> ScanIter<'a> {
    pub fn new(handle: &'a Handle, root: IndexSpace) -> Result<ScanIter<'a>> {
        let node = read_node(handle, root)?;
        Ok(ScanIter {
            handle,
            stack: vec![(node, 0)],
        })
    }
}

impl<'a> Iterator for ScanIter<'a> {
    type Item = Result<(Vec<u8>, EntryLocation)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (node, idx) = self.stack.last_mut()?;
            match node {
                Node::Leaf { entries } => {
                    if *idx < entries.len() {
                        let item = entries[*idx].clone();
                        *idx += 1;
                        return Some(Ok(item));
                    }
                    self.stack.pop();
                }
                Node::Inner { children, .. } => {
                    if *idx < children.len() {
                        let child_space = children[*idx];
                        *idx += 1;
                        match read_node(self.handle, child_space) {
                            Ok(child) => self.stack.push((child, 0)),
                            Err(e) => return Some(Err(e)),
                        }
                    } else {
                        self.stack.pop();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
