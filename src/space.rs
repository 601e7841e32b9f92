//! [IndexSpace] slots and the [FreeBlockCatalog] that recycles them inside
//! a shard's index file.

use std::collections::{BTreeMap, VecDeque};
use std::convert::TryInto;

use crate::err_at;
use crate::error::Result;

/// A `(offset, length)` slot inside a shard's index file. `length` is
/// bounded by the shard's configured `max_node_size` (<= 32767).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpace {
    pub offset: u64,
    pub length: u16,
}

impl IndexSpace {
    pub const ENCODED_LEN: u64 = 10; // offset:u64 + length:u16

    pub fn new(offset: u64, length: u16) -> IndexSpace {
        IndexSpace { offset, length }
    }

    /// The sentinel slot for an empty root: zero length means no bytes
    /// were ever written for it, so `read_node` decodes it to an empty
    /// leaf in memory instead of touching the file.
    pub fn empty_root(offset: u64) -> IndexSpace {
        IndexSpace { offset, length: 0 }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> IndexSpace {
        let offset = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let length = u16::from_be_bytes(buf[8..10].try_into().unwrap());
        IndexSpace { offset, length }
    }
}

/// Length-keyed multi-map of reusable holes inside a shard's index file.
///
/// Implements the allocation/free policy from the free-space allocator
/// design: a slot is reused only if it is not more than 25% larger than
/// requested (anti-fragmentation guard); freed tail slots shrink the
/// file's high-water mark instead of joining the catalog.
#[derive(Default)]
pub struct FreeBlockCatalog {
    by_length: BTreeMap<u16, VecDeque<IndexSpace>>,
}

/// Outcome of a `free()` call: whether the shard's index file should be
/// truncated because the freed slot was at the tail.
pub enum FreeOutcome {
    /// Slot filed away in the catalog; `index_file_size` is unchanged.
    Cataloged,
    /// Slot was at the tail; `index_file_size` shrank to this value and
    /// the backing file should be truncated to match.
    Shrunk(u64),
}

impl FreeBlockCatalog {
    pub fn new() -> FreeBlockCatalog {
        FreeBlockCatalog::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_length.values().all(|v| v.is_empty())
    }

    /// Total bytes held across every cataloged free slot (used by P6).
    pub fn total_free_bytes(&self) -> u64 {
        self.by_length
            .iter()
            .map(|(len, list)| *len as u64 * list.len() as u64)
            .sum()
    }

    /// Allocate a slot of `requested` bytes. Appends a fresh slot at the
    /// current `index_file_size` (and advances it) when no cataloged slot
    /// satisfies the 1.25x fragmentation guard.
    pub fn allocate(&mut self, requested: u16, index_file_size: &mut u64) -> IndexSpace {
        let found = self
            .by_length
            .range(requested..)
            .next()
            .map(|(len, _)| *len);

        let reuse = match found {
            Some(len) => {
                let guard = requested as u32 + (requested as u32) / 4;
                len as u32 <= guard
            }
            None => false,
        };

        if reuse {
            let len = found.unwrap();
            let list = self.by_length.get_mut(&len).unwrap();
            let space = list.pop_front().unwrap();
            if list.is_empty() {
                self.by_length.remove(&len);
            }
            space
        } else {
            let space = IndexSpace::new(*index_file_size, requested);
            *index_file_size += requested as u64;
            space
        }
    }

    /// Free a previously allocated slot. If it sits at the tail of the
    /// file, the high-water mark shrinks instead of cataloging the slot.
    pub fn free(&mut self, space: IndexSpace, index_file_size: &mut u64) -> FreeOutcome {
        if space.offset + space.length as u64 == *index_file_size {
            *index_file_size -= space.length as u64;
            FreeOutcome::Shrunk(*index_file_size)
        } else {
            self.by_length
                .entry(space.length)
                .or_insert_with(VecDeque::new)
                .push_back(space);
            FreeOutcome::Cataloged
        }
    }

    /// On-disk layout (preserved verbatim, including the length-field
    /// width mismatch against [IndexSpace]'s own `u16` field):
    ///
    /// `count:u32 { length:u32, count:u32, (offset:u64, length:u16) x count }*`
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.by_length.len() as u32).to_be_bytes());
        for (length, list) in self.by_length.iter() {
            buf.extend_from_slice(&(*length as u32).to_be_bytes());
            buf.extend_from_slice(&(list.len() as u32).to_be_bytes());
            for space in list.iter() {
                space.encode(buf);
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<FreeBlockCatalog> {
        let mut pos = 0usize;
        let need = |pos: usize, n: usize| -> Result<()> {
            if pos + n > buf.len() {
                err_at!(InvalidFile, msg: "free-block catalog truncated")
            } else {
                Ok(())
            }
        };

        need(pos, 4)?;
        let groups = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap());
        pos += 4;

        let mut catalog = FreeBlockCatalog::new();
        for _ in 0..groups {
            need(pos, 8)?;
            let length = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap());
            let count = u32::from_be_bytes(buf[pos + 4..pos + 8].try_into().unwrap());
            pos += 8;

            let length: u16 = err_at!(InvalidFile, length.try_into())?;
            let mut list = VecDeque::with_capacity(count as usize);
            for _ in 0..count {
                need(pos, IndexSpace::ENCODED_LEN as usize)?;
                list.push_back(IndexSpace::decode(
                    &buf[pos..pos + IndexSpace::ENCODED_LEN as usize],
                ));
                pos += IndexSpace::ENCODED_LEN as usize;
            }
            catalog.by_length.insert(length, list);
        }
        Ok(catalog)
    }

    pub fn encoded_len(&self) -> usize {
        4 + self
            .by_length
            .iter()
            .map(|(_, list)| 8 + list.len() * IndexSpace::ENCODED_LEN as usize)
            .sum::<usize>()
    }
}

#[cfg(test)]
#[path = "space_test.rs"]
mod space_test;
