use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::collab::{Compactor, SystemTimeService};
use crate::node::LookupOp;

struct NoopTempTable;

impl TemporaryTable for NoopTempTable {
    fn remove_conditionally(&self, _cache_seg: u32, _key: &[u8], _file: i64, _offset: i64) {}
    fn get_segment_max(&self) -> u32 {
        0
    }
}

#[derive(Default)]
struct RecordingCompactor {
    added: Mutex<Vec<(i32, i32, i32, i64, bool)>>,
    released: Mutex<Vec<i32>>,
    stats: Mutex<HashMap<i32, FileStats>>,
}

impl Compactor for RecordingCompactor {
    fn add_free_file(
        &self,
        id: i32,
        total_bytes: i32,
        free_bytes: i32,
        next_expiration_time: i64,
        immediate: bool,
    ) -> bool {
        self.added
            .lock()
            .unwrap()
            .push((id, total_bytes, free_bytes, next_expiration_time, immediate));
        true
    }

    fn release_stats(&self, id: i32) {
        self.released.lock().unwrap().push(id);
    }

    fn get_file_stats(&self) -> HashMap<i32, FileStats> {
        self.stats.lock().unwrap().clone()
    }
}

fn open_test_index(dir: &std::path::Path, segments: u32) -> (Index, bool, Arc<RecordingCompactor>) {
    let compactor = Arc::new(RecordingCompactor::default());
    let config = Config::new(dir, segments).with_node_sizes(64, 1024);
    let (index, loaded_gracefully) = Index::open(
        config,
        compactor.clone(),
        Arc::new(NoopTempTable),
        Arc::new(SystemTimeService),
        crate::collab::ThreadedCompletionSink::new(2),
    )
    .unwrap();
    (index, loaded_gracefully, compactor)
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

fn update_and_wait(index: &Index, cache_seg: u32, key: &[u8], loc: EntryLocation) -> IndexReply {
    let (tx, rx) = mpsc::channel();
    index
        .handle_request(IndexRequest::update(cache_seg, key.to_vec(), loc, Some(tx)))
        .unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap()
}

#[test]
fn open_creates_every_configured_shard_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let (index, loaded_gracefully, _) = open_test_index(dir.path(), 4);
    assert!(!loaded_gracefully);
    assert_eq!(index.approximate_size(&[0, 1, 2, 3]).unwrap(), 0);
}

#[test]
fn update_then_get_position_round_trips_through_the_facade() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _, _) = open_test_index(dir.path(), 2);

    let reply = update_and_wait(&index, 0, b"k1", loc(10, 0, 1));
    assert_eq!(
        reply,
        IndexReply::Applied {
            applied: true,
            overwritten: false
        }
    );
    assert_eq!(index.approximate_size(&[0, 1]).unwrap(), 1);
    assert_eq!(
        index.get(0, b"k1", LookupOp::GetPosition).unwrap(),
        Some(loc(10, 0, 1))
    );
}

#[test]
fn moved_is_a_noop_once_the_data_file_has_moved_on() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _, _) = open_test_index(dir.path(), 2);

    update_and_wait(&index, 0, b"k1", loc(10, 0, 1));
    update_and_wait(&index, 0, b"k1", loc(10, 200, 2));

    let (tx, rx) = mpsc::channel();
    index
        .handle_request(IndexRequest::moved(0, b"k1".to_vec(), (10, 0), loc(11, 0, 3), Some(tx)))
        .unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        IndexReply::Applied {
            applied: false,
            overwritten: false
        }
    );
    assert_eq!(
        index.get(0, b"k1", LookupOp::GetPosition).unwrap(),
        Some(loc(10, 200, 2))
    );
    assert_eq!(index.approximate_size(&[0, 1]).unwrap(), 1);
}

#[test]
fn dropped_removes_the_key_and_decrements_the_size() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _, _) = open_test_index(dir.path(), 2);

    update_and_wait(&index, 0, b"k1", loc(10, 200, 1));
    let (tx, rx) = mpsc::channel();
    index
        .handle_request(IndexRequest::dropped(0, b"k1".to_vec(), (10, 200), 2, Some(tx)))
        .unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();

    assert_eq!(index.get(0, b"k1", LookupOp::GetPosition).unwrap(), None);
    assert_eq!(index.approximate_size(&[0, 1]).unwrap(), 0);
}

#[test]
fn clear_zeroes_every_segment() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _, _) = open_test_index(dir.path(), 3);

    for seg in 0..3u32 {
        update_and_wait(&index, seg, &[seg as u8], loc(1, seg as i64, seg as u64));
    }
    assert_eq!(index.approximate_size(&[0, 1, 2]).unwrap(), 3);

    index.clear().unwrap();
    assert_eq!(index.approximate_size(&[0, 1, 2]).unwrap(), 0);
    for seg in 0..3u32 {
        assert_eq!(index.get(seg, &[seg as u8], LookupOp::GetPosition).unwrap(), None);
    }
}

#[test]
fn ensure_run_on_last_runs_the_action_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _, _) = open_test_index(dir.path(), 4);

    let (tx, rx) = mpsc::channel();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    index
        .ensure_run_on_last(Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }))
        .unwrap();

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn add_segments_installs_new_shards_without_disturbing_existing_ones() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _, _) = open_test_index(dir.path(), 1);

    update_and_wait(&index, 0, b"k1", loc(10, 0, 1));
    index.add_segments(&[1, 2]).unwrap();

    update_and_wait(&index, 1, b"k2", loc(10, 0, 2));
    assert_eq!(
        index.get(0, b"k1", LookupOp::GetPosition).unwrap(),
        Some(loc(10, 0, 1))
    );
    assert_eq!(
        index.get(1, b"k2", LookupOp::GetPosition).unwrap(),
        Some(loc(10, 0, 2))
    );
    assert_eq!(index.approximate_size(&[0, 1, 2]).unwrap(), 2);
}

#[test]
fn remove_segments_deletes_the_backing_file_once_drained() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _, _) = open_test_index(dir.path(), 2);
    update_and_wait(&index, 1, b"k1", loc(10, 0, 1));

    index.remove_segments(&[1]).unwrap();
    assert!(index.get(1, b"anything", LookupOp::GetPosition).is_err());

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while dir.path().join("index.1").exists() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!dir.path().join("index.1").exists());
}

#[test]
fn stop_then_reopen_restores_every_key_and_counter() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (index, _, _) = open_test_index(dir.path(), 8);
        for i in 0..500u32 {
            let seg = i % 8;
            let key = i.to_be_bytes().to_vec();
            update_and_wait(&index, seg, &key, loc(1, i as i64, i as u64));
        }
        index.stop().unwrap();
    }

    let (index, loaded_gracefully, _) = open_test_index(dir.path(), 8);
    assert!(loaded_gracefully);
    assert_eq!(index.approximate_size(&(0..8).collect::<Vec<_>>()).unwrap(), 500);
    for i in 0..500u32 {
        let seg = i % 8;
        let key = i.to_be_bytes().to_vec();
        assert_eq!(
            index.get(seg, &key, LookupOp::GetPosition).unwrap(),
            Some(loc(1, i as i64, i as u64))
        );
    }
}

#[test]
fn missing_sidecars_make_load_report_dirty() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (index, _, _) = open_test_index(dir.path(), 2);
        update_and_wait(&index, 0, b"k1", loc(10, 0, 1));
        // No stop() — sidecars never get written, simulating an
        // ungraceful kill.
    }
    let (index, loaded_gracefully, _) = open_test_index(dir.path(), 2);
    assert!(!loaded_gracefully);
    assert_eq!(index.get(0, b"k1", LookupOp::GetPosition).unwrap(), None);
}

#[test]
fn stop_writes_index_stats_from_the_compactor() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _, compactor) = open_test_index(dir.path(), 1);
    compactor.stats.lock().unwrap().insert(
        7,
        FileStats {
            file_id: 7,
            total_bytes: 1000,
            free_bytes: 200,
            next_expiration_time: 99,
        },
    );
    index.stop().unwrap();

    let bytes = std::fs::read(dir.path().join("index.stats")).unwrap();
    assert_eq!(bytes.len(), 20);
    assert_eq!(i32::from_be_bytes(bytes[0..4].try_into().unwrap()), 7);
}

#[test]
fn shutdown_joins_worker_threads() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _, _) = open_test_index(dir.path(), 2);
    update_and_wait(&index, 0, b"k1", loc(10, 0, 1));
    index.shutdown().unwrap();
}
