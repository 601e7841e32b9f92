//! The mutation/inquiry envelope a shard's applier consumes, and the
//! reply it produces. Completion is a plain `mpsc::Sender<IndexReply>`
//! — the gen-server pattern this crate's concurrency follows throughout
//! (request, optional reply channel) rather than a bespoke future type.

use std::sync::mpsc;

use crate::entry::EntryLocation;
use crate::error::Error;
use crate::node::{OverwriteHook, RecordChange};

/// The six request kinds from the applier's dispatch table. `Clear` and
/// `SyncRequest` are "special": they bypass `setPosition` entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Clear,
    SyncRequest,
    Moved,
    Update,
    Dropped,
    FoundOld,
}

impl RequestType {
    /// `(recordChange, overwriteHook)` binding for the non-special
    /// request types, per the applier dispatch table.
    pub fn binding(self) -> Option<(RecordChange, OverwriteHook)> {
        match self {
            RequestType::Moved => Some((RecordChange::Move, OverwriteHook::Moved)),
            RequestType::Update => Some((RecordChange::Increase, OverwriteHook::Update)),
            RequestType::Dropped => Some((RecordChange::Decrease, OverwriteHook::Dropped)),
            RequestType::FoundOld => Some((RecordChange::IncreaseForOld, OverwriteHook::Noop)),
            RequestType::Clear | RequestType::SyncRequest => None,
        }
    }
}

/// A `SYNC_REQUEST`'s attached barrier action. Boxed so a shard's
/// request queue stays a single concrete type; `FnOnce` because the
/// action must run exactly once, on the applier thread that receives
/// it last.
pub type SyncAction = Box<dyn FnOnce() + Send>;

/// One entry in a shard's single-consumer queue.
pub struct IndexRequest {
    pub cache_seg: u32,
    pub req_type: RequestType,
    pub key: Vec<u8>,
    /// New physical location. Required for Moved/Update/Dropped/FoundOld;
    /// ignored for Clear/SyncRequest.
    pub new_loc: Option<EntryLocation>,
    /// Previous `(file, offset)` the caller believes is currently
    /// installed; required by Moved/Dropped's overwrite guard.
    pub prev: Option<(i64, i64)>,
    pub sync_action: Option<SyncAction>,
    pub reply: Option<mpsc::Sender<IndexReply>>,
}

impl IndexRequest {
    pub fn update(
        cache_seg: u32,
        key: Vec<u8>,
        new_loc: EntryLocation,
        reply: Option<mpsc::Sender<IndexReply>>,
    ) -> IndexRequest {
        IndexRequest {
            cache_seg,
            req_type: RequestType::Update,
            key,
            new_loc: Some(new_loc),
            prev: None,
            sync_action: None,
            reply,
        }
    }

    pub fn moved(
        cache_seg: u32,
        key: Vec<u8>,
        prev: (i64, i64),
        new_loc: EntryLocation,
        reply: Option<mpsc::Sender<IndexReply>>,
    ) -> IndexRequest {
        IndexRequest {
            cache_seg,
            req_type: RequestType::Moved,
            key,
            new_loc: Some(new_loc),
            prev: Some(prev),
            sync_action: None,
            reply,
        }
    }

    pub fn dropped(
        cache_seg: u32,
        key: Vec<u8>,
        prev: (i64, i64),
        seq_id: u64,
        reply: Option<mpsc::Sender<IndexReply>>,
    ) -> IndexRequest {
        IndexRequest {
            cache_seg,
            req_type: RequestType::Dropped,
            key,
            new_loc: Some(EntryLocation {
                file: -1,
                offset: -1,
                num_records: 0,
                seq_id,
                expire_at: crate::entry::NO_EXPIRY,
            }),
            prev: Some(prev),
            sync_action: None,
            reply,
        }
    }

    pub fn found_old(
        cache_seg: u32,
        key: Vec<u8>,
        new_loc: EntryLocation,
        reply: Option<mpsc::Sender<IndexReply>>,
    ) -> IndexRequest {
        IndexRequest {
            cache_seg,
            req_type: RequestType::FoundOld,
            key,
            new_loc: Some(new_loc),
            prev: None,
            sync_action: None,
            reply,
        }
    }

    pub fn clear(reply: Option<mpsc::Sender<IndexReply>>) -> IndexRequest {
        IndexRequest {
            cache_seg: 0,
            req_type: RequestType::Clear,
            key: vec![],
            new_loc: None,
            prev: None,
            sync_action: None,
            reply,
        }
    }

    pub fn sync(action: SyncAction, reply: Option<mpsc::Sender<IndexReply>>) -> IndexRequest {
        IndexRequest {
            cache_seg: 0,
            req_type: RequestType::SyncRequest,
            key: vec![],
            new_loc: None,
            prev: None,
            sync_action: Some(action),
            reply,
        }
    }
}

/// What a completed `IndexRequest` reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexReply {
    /// A Moved/Update/Dropped/FoundOld request ran `setPosition`.
    Applied { applied: bool, overwritten: bool },
    Cleared,
    SyncDone,
    /// A programmer error (illegal state) or an I/O failure that
    /// prevented the request from applying.
    Failed(Error),
}

#[cfg(test)]
#[path = "request_test.rs"]
mod request_test;
