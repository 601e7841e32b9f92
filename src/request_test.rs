use super::*;

#[test]
fn binding_table_matches_the_applier_dispatch_rules() {
    assert_eq!(
        RequestType::Moved.binding(),
        Some((RecordChange::Move, OverwriteHook::Moved))
    );
    assert_eq!(
        RequestType::Update.binding(),
        Some((RecordChange::Increase, OverwriteHook::Update))
    );
    assert_eq!(
        RequestType::Dropped.binding(),
        Some((RecordChange::Decrease, OverwriteHook::Dropped))
    );
    assert_eq!(
        RequestType::FoundOld.binding(),
        Some((RecordChange::IncreaseForOld, OverwriteHook::Noop))
    );
    assert_eq!(RequestType::Clear.binding(), None);
    assert_eq!(RequestType::SyncRequest.binding(), None);
}

#[test]
fn dropped_constructor_tombstones_the_new_location() {
    let req = IndexRequest::dropped(0, b"k".to_vec(), (3, 40), 9, None);
    let loc = req.new_loc.unwrap();
    assert!(loc.is_tombstone());
    assert_eq!(req.prev, Some((3, 40)));
}

#[test]
fn sync_request_carries_its_action() {
    let (tx, rx) = std::sync::mpsc::channel();
    let req = IndexRequest::sync(
        Box::new(move || {
            let _ = tx.send(());
        }),
        None,
    );
    assert_eq!(req.req_type, RequestType::SyncRequest);
    (req.sync_action.unwrap())();
    assert!(rx.try_recv().is_ok());
}
