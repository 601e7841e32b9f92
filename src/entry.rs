//! [EntryLocation]: the leaf payload mapping a key to its physical
//! position in the (externally managed) append-only data files.

use std::convert::TryInto;

/// Sentinel `expire_at` meaning "this entry never expires".
pub const NO_EXPIRY: i64 = i64::MIN;

/// Physical location of an entry's payload, as stored in a leaf node.
///
/// `file`/`offset` are negative together exactly when the entry is a
/// tombstone: the key was deleted but the data-file record has not yet
/// been reclaimed by compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub file: i64,
    pub offset: i64,
    pub num_records: u32,
    pub seq_id: u64,
    pub expire_at: i64,
}

impl EntryLocation {
    pub const ENCODED_LEN: usize = 8 + 8 + 4 + 8 + 8;

    pub fn is_tombstone(&self) -> bool {
        self.file < 0 || self.offset < 0
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expire_at != NO_EXPIRY && self.expire_at <= now_millis
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.file.to_be_bytes());
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.num_records.to_be_bytes());
        buf.extend_from_slice(&self.seq_id.to_be_bytes());
        buf.extend_from_slice(&self.expire_at.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> EntryLocation {
        EntryLocation {
            file: i64::from_be_bytes(buf[0..8].try_into().unwrap()),
            offset: i64::from_be_bytes(buf[8..16].try_into().unwrap()),
            num_records: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            seq_id: u64::from_be_bytes(buf[20..28].try_into().unwrap()),
            expire_at: i64::from_be_bytes(buf[28..36].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
#[path = "entry_test.rs"]
mod entry_test;
