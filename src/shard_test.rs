use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use super::*;
use crate::collab::{SystemTimeService, TemporaryTable};
use crate::node::LookupOp;
use crate::request::IndexRequest;

struct NoopTempTable;

impl TemporaryTable for NoopTempTable {
    fn remove_conditionally(&self, _cache_seg: u32, _key: &[u8], _file: i64, _offset: i64) {}
    fn get_segment_max(&self) -> u32 {
        0
    }
}

struct RecordingTempTable {
    calls: Mutex<Vec<(u32, Vec<u8>, i64, i64)>>,
}

impl RecordingTempTable {
    fn new() -> RecordingTempTable {
        RecordingTempTable {
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl TemporaryTable for RecordingTempTable {
    fn remove_conditionally(&self, cache_seg: u32, key: &[u8], file: i64, offset: i64) {
        self.calls
            .lock()
            .unwrap()
            .push((cache_seg, key.to_vec(), file, offset));
    }
    fn get_segment_max(&self) -> u32 {
        0
    }
}

/// Runs completion jobs synchronously on the calling (applier) thread,
/// so tests can observe a reply immediately after `apply()` returns.
struct ImmediateCompletion;

impl NonBlockingManager for ImmediateCompletion {
    fn complete(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

fn open_shard(dir: &std::path::Path, id: u32, segments: u32) -> (Shard, bool) {
    open_shard_with(dir, id, segments, Arc::new(NoopTempTable))
}

fn open_shard_with(
    dir: &std::path::Path,
    id: u32,
    segments: u32,
    temp_table: Arc<dyn TemporaryTable>,
) -> (Shard, bool) {
    let provider = crate::files::FileHandleProvider::new(dir, 8);
    let handle = provider.open(id as u64).unwrap();
    Shard::open(
        handle,
        id,
        segments,
        64,
        1024,
        Arc::new(SystemTimeService),
        temp_table,
        Arc::new(ImmediateCompletion),
    )
    .unwrap()
}

fn header_magic(dir: &std::path::Path, id: u32) -> u32 {
    let provider = crate::files::FileHandleProvider::new(dir, 8);
    let handle = provider.open(id as u64).unwrap();
    let mut buf = [0u8; 4];
    handle.read(&mut buf, 0).unwrap();
    u32::from_be_bytes(buf)
}

fn loc(file: i64, offset: i64, seq: u64) -> EntryLocation {
    EntryLocation {
        file,
        offset,
        num_records: 0,
        seq_id: seq,
        expire_at: crate::entry::NO_EXPIRY,
    }
}

#[test]
fn fresh_shard_starts_empty_and_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, loaded_gracefully) = open_shard(dir.path(), 0, 2);
    assert!(!loaded_gracefully);
    assert_eq!(shard.live_count(), 0);
    assert_eq!(shard.lookup(b"x", LookupOp::GetPosition).unwrap(), None);
    assert_eq!(header_magic(dir.path(), 0), MAGIC_DIRTY);
}

#[test]
fn update_then_get_position_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _) = open_shard(dir.path(), 0, 2);

    let (tx, rx) = mpsc::channel();
    shard.apply(IndexRequest::update(0, b"k1".to_vec(), loc(10, 0, 1), Some(tx)));
    match rx.recv().unwrap() {
        IndexReply::Applied { applied, overwritten } => {
            assert!(applied);
            assert!(!overwritten);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(shard.live_count(), 1);
    assert_eq!(
        shard.lookup(b"k1", LookupOp::GetPosition).unwrap(),
        Some(loc(10, 0, 1))
    );
}

#[test]
fn second_update_overwrites_without_changing_live_count() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _) = open_shard(dir.path(), 0, 2);

    shard.apply(IndexRequest::update(0, b"k1".to_vec(), loc(10, 0, 1), None));
    let (tx, rx) = mpsc::channel();
    shard.apply(IndexRequest::update(0, b"k1".to_vec(), loc(10, 200, 2), Some(tx)));
    match rx.recv().unwrap() {
        IndexReply::Applied { applied, overwritten } => {
            assert!(applied);
            assert!(overwritten);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(shard.live_count(), 1);
    assert_eq!(
        shard.lookup(b"k1", LookupOp::GetPosition).unwrap(),
        Some(loc(10, 200, 2))
    );
}

#[test]
fn moved_is_a_noop_once_prev_is_stale() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _) = open_shard(dir.path(), 0, 2);

    shard.apply(IndexRequest::update(0, b"k1".to_vec(), loc(10, 0, 1), None));
    shard.apply(IndexRequest::update(0, b"k1".to_vec(), loc(10, 200, 2), None));

    let (tx, rx) = mpsc::channel();
    shard.apply(IndexRequest::moved(0, b"k1".to_vec(), (10, 0), loc(11, 0, 3), Some(tx)));
    match rx.recv().unwrap() {
        IndexReply::Applied { applied, .. } => assert!(!applied),
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(
        shard.lookup(b"k1", LookupOp::GetPosition).unwrap(),
        Some(loc(10, 200, 2))
    );
    assert_eq!(shard.live_count(), 1);
}

#[test]
fn dropped_tombstones_and_decrements() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _) = open_shard(dir.path(), 0, 2);

    shard.apply(IndexRequest::update(0, b"k1".to_vec(), loc(10, 200, 2), None));
    assert_eq!(shard.live_count(), 1);

    shard.apply(IndexRequest::dropped(0, b"k1".to_vec(), (10, 200), 3, None));
    assert_eq!(shard.lookup(b"k1", LookupOp::GetPosition).unwrap(), None);
    assert_eq!(shard.live_count(), 0);
    assert!(shard
        .lookup(b"k1", LookupOp::GetInfo)
        .unwrap()
        .unwrap()
        .is_tombstone());
}

#[test]
fn clear_resets_tree_and_counter() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _) = open_shard(dir.path(), 0, 2);

    for i in 0..20u8 {
        shard.apply(IndexRequest::update(0, vec![i], loc(1, i as i64, i as u64), None));
    }
    assert_eq!(shard.live_count(), 20);

    let (tx, rx) = mpsc::channel();
    shard.apply(IndexRequest::clear(Some(tx)));
    assert_eq!(rx.recv().unwrap(), IndexReply::Cleared);
    assert_eq!(shard.live_count(), 0);
    for i in 0..20u8 {
        assert_eq!(shard.lookup(&[i], LookupOp::GetPosition).unwrap(), None);
    }
}

#[test]
fn sync_request_runs_its_action_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _) = open_shard(dir.path(), 0, 1);

    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();
    let (tx, rx) = mpsc::channel();
    shard.apply(IndexRequest::sync(
        Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }),
        Some(tx),
    ));
    assert_eq!(rx.recv().unwrap(), IndexReply::SyncDone);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn temporary_table_is_notified_with_the_installed_location() {
    let dir = tempfile::tempdir().unwrap();
    let temp_table = Arc::new(RecordingTempTable::new());
    let (shard, _) = open_shard_with(dir.path(), 3, 4, temp_table.clone());

    shard.apply(IndexRequest::update(3, b"k1".to_vec(), loc(10, 0, 1), None));

    let calls = temp_table.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], (3, b"k1".to_vec(), 10, 0));
}

#[test]
fn graceful_stop_then_reopen_round_trips_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _) = open_shard(dir.path(), 0, 2);

    for i in 0..200u32 {
        let key = i.to_be_bytes().to_vec();
        shard.apply(IndexRequest::update(0, key, loc(1, i as i64, i as u64), None));
    }
    let stats = shard.finalize().unwrap();
    assert_eq!(stats.live_count, 200);
    assert_eq!(header_magic(dir.path(), 0), MAGIC_GRACEFULLY);

    let (reopened, loaded_gracefully) = open_shard(dir.path(), 0, 2);
    assert!(loaded_gracefully);
    assert_eq!(reopened.live_count(), 200);
    for i in 0..200u32 {
        let key = i.to_be_bytes().to_vec();
        assert_eq!(
            reopened.lookup(&key, LookupOp::GetPosition).unwrap(),
            Some(loc(1, i as i64, i as u64))
        );
    }
    // Reopening flips the header back to DIRTY until the next finalize().
    assert_eq!(header_magic(dir.path(), 0), MAGIC_DIRTY);
}

#[test]
fn segment_count_mismatch_forces_a_dirty_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _) = open_shard(dir.path(), 0, 2);
    shard.apply(IndexRequest::update(0, b"k1".to_vec(), loc(10, 0, 1), None));
    shard.finalize().unwrap();

    let (reopened, loaded_gracefully) = open_shard(dir.path(), 0, 3);
    assert!(!loaded_gracefully);
    assert_eq!(reopened.live_count(), 0);
    assert_eq!(reopened.lookup(b"k1", LookupOp::GetPosition).unwrap(), None);
}

#[test]
fn max_seq_id_reflects_the_highest_installed_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _) = open_shard(dir.path(), 0, 1);
    shard.apply(IndexRequest::update(0, b"a".to_vec(), loc(1, 0, 5), None));
    shard.apply(IndexRequest::update(0, b"b".to_vec(), loc(1, 1, 42), None));
    shard.apply(IndexRequest::update(0, b"c".to_vec(), loc(1, 2, 7), None));
    assert_eq!(shard.max_seq_id().unwrap(), 42);
}

#[test]
fn scan_visits_every_live_entry_in_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _) = open_shard(dir.path(), 0, 1);
    for i in (0..50u32).rev() {
        let key = i.to_be_bytes().to_vec();
        shard.apply(IndexRequest::update(0, key, loc(1, i as i64, i as u64), None));
    }
    let keys: Vec<Vec<u8>> = shard
        .scan()
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    let expected: Vec<Vec<u8>> = (0..50u32).map(|i| i.to_be_bytes().to_vec()).collect();
    assert_eq!(keys, expected);
}
