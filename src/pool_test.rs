use super::*;
use crate::request::RequestType;
use std::sync::mpsc;
use std::time::Duration;

fn dummy_request() -> IndexRequest {
    IndexRequest {
        cache_seg: 0,
        req_type: RequestType::Clear,
        key: vec![],
        new_loc: None,
        prev: None,
        sync_action: None,
        reply: None,
    }
}

#[test]
fn assigned_requests_are_processed_in_order() {
    let pool = WorkerPool::new(2);
    let (tx, rx) = crossbeam_channel::unbounded();
    let (done_tx, done_rx) = mpsc::channel();

    pool.assign(
        rx,
        Box::new(move |req: IndexRequest| {
            done_tx.send(req.cache_seg).unwrap();
        }),
    );

    for i in 0..5u32 {
        let mut req = dummy_request();
        req.cache_seg = i;
        tx.send(req).unwrap();
    }

    for i in 0..5u32 {
        let seg = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(seg, i);
    }
}

#[test]
fn two_shards_on_the_same_worker_are_both_served() {
    let pool = WorkerPool::new(1);
    let (tx_a, rx_a) = crossbeam_channel::unbounded();
    let (tx_b, rx_b) = crossbeam_channel::unbounded();
    let (done_tx, done_rx) = mpsc::channel();

    let done_a = done_tx.clone();
    pool.assign(
        rx_a,
        Box::new(move |req: IndexRequest| {
            done_a.send(("a", req.cache_seg)).unwrap();
        }),
    );
    pool.assign(
        rx_b,
        Box::new(move |req: IndexRequest| {
            done_tx.send(("b", req.cache_seg)).unwrap();
        }),
    );

    let mut ra = dummy_request();
    ra.cache_seg = 1;
    let mut rb = dummy_request();
    rb.cache_seg = 2;
    tx_a.send(ra).unwrap();
    tx_b.send(rb).unwrap();

    let mut seen = vec![];
    for _ in 0..2 {
        seen.push(done_rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
    seen.sort();
    assert_eq!(seen, vec![("a", 1), ("b", 2)]);
}

#[test]
fn a_panicking_handler_does_not_kill_the_worker() {
    let pool = WorkerPool::new(1);
    let (tx, rx) = crossbeam_channel::unbounded();
    let (done_tx, done_rx) = mpsc::channel();

    let mut call_count = 0;
    pool.assign(
        rx,
        Box::new(move |_req: IndexRequest| {
            call_count += 1;
            if call_count == 1 {
                panic!("boom");
            }
            done_tx.send(call_count).unwrap();
        }),
    );

    tx.send(dummy_request()).unwrap();
    tx.send(dummy_request()).unwrap();

    let n = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(n, 2);
}

#[test]
fn dropping_the_sender_disconnects_cleanly() {
    let pool = WorkerPool::new(1);
    let (tx, rx) = crossbeam_channel::unbounded::<IndexRequest>();
    pool.assign(rx, Box::new(|_req: IndexRequest| {}));
    drop(tx);
    pool.join();
}
