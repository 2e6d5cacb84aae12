use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sheet_sync::connection::ConnectionState;
use sheet_sync::{
    CellIdentity, ChangeEvent, GridFrame, InMemorySheetBackend, Revision, SheetHandle, SheetId,
    SheetSession, SheetSnapshot, SyncConfig, SyncError, SyncNotice,
};
use tokio::sync::broadcast;
use tokio::time::sleep;

fn sheet() -> SheetId {
    SheetId::new("roundtrip")
}

fn open(backend: &Arc<InMemorySheetBackend>, config: SyncConfig) -> SheetHandle {
    SheetSession::spawn(sheet(), backend.clone(), backend.clone(), config)
}

async fn open_subscribed(backend: &Arc<InMemorySheetBackend>) -> SheetHandle {
    let handle = open(backend, SyncConfig::default());
    handle.subscribe().await.unwrap();
    handle
        .wait_for_state(ConnectionState::Subscribed)
        .await
        .unwrap();
    handle
}

async fn wait_for_cell(handle: &SheetHandle, row: usize, col: usize, expected: &str) -> Arc<GridFrame> {
    let mut frames = handle.frames().unwrap();
    loop {
        let frame = frames.borrow_and_update().clone();
        if frame.cell(row, col) == Some(expected) {
            return frame;
        }
        frames.changed().await.unwrap();
    }
}

async fn settle(handle: &SheetHandle) {
    while !handle.pending().await.unwrap().is_empty() {
        sleep(Duration::from_millis(5)).await;
    }
}

async fn next_failure(notices: &mut broadcast::Receiver<SyncNotice>) -> (CellIdentity, String, Arc<SyncError>) {
    loop {
        match notices.recv().await.unwrap() {
            SyncNotice::CommitFailed {
                identity,
                restored,
                error,
                ..
            } => return (identity, restored, error),
            _ => continue,
        }
    }
}

fn values(snapshot: &SheetSnapshot) -> BTreeMap<(u32, u32), String> {
    snapshot
        .records
        .iter()
        .filter(|record| !record.value.is_empty())
        .map(|record| ((record.identity.row, record.identity.col), record.value.clone()))
        .collect()
}

fn change(row: u32, col: u32, value: &str, revision: u64) -> ChangeEvent {
    ChangeEvent {
        identity: CellIdentity::new(sheet(), row, col),
        value: value.into(),
        revision: Some(Revision(revision)),
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn edit_commits_and_reaches_the_grid() {
    let backend = InMemorySheetBackend::new();
    let handle = open_subscribed(&backend).await;

    handle.submit_edit(0, 0, "hello").await.unwrap();
    let frame = wait_for_cell(&handle, 0, 0, "hello").await;
    assert_eq!((frame.rows, frame.cols), (100, 26));
    settle(&handle).await;

    let durable = backend.durable_snapshot(&sheet());
    assert_eq!(durable.get(0, 0).map(|r| r.value.as_str()), Some("hello"));
    assert_eq!(backend.commit_count(), 1);
    handle.teardown().await.unwrap();
}

#[test_timeout::tokio_timeout_test(10)]
async fn edits_beyond_minimum_grow_the_grid() {
    let backend = InMemorySheetBackend::new();
    let handle = open(&backend, SyncConfig::default());
    handle.submit_edit(149, 30, "far").await.unwrap();
    let frame = wait_for_cell(&handle, 149, 30, "far").await;
    assert_eq!((frame.rows, frame.cols), (150, 31));
    assert_eq!(frame.column_labels[30], "AE");
}

#[test_timeout::tokio_timeout_test(10)]
async fn burst_of_edits_materializes_once() {
    let backend = InMemorySheetBackend::new();
    let handle = open(&backend, SyncConfig::default());
    let mut frames = handle.frames().unwrap();
    let before = frames.borrow_and_update().sequence;

    // All three commands are queued before the actor gets to run.
    let (a, b, c) = tokio::join!(
        handle.submit_edit(0, 0, "a"),
        handle.submit_edit(1, 1, "b"),
        handle.submit_edit(2, 2, "c"),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    frames.changed().await.unwrap();
    let frame = frames.borrow_and_update().clone();
    assert_eq!(frame.sequence, before + 1);
    assert_eq!(
        (frame.cell(0, 0), frame.cell(1, 1), frame.cell(2, 2)),
        (Some("a"), Some("b"), Some("c"))
    );

    // Confirmations change nothing visible, so no further frame.
    settle(&handle).await;
    sleep(Duration::from_millis(30)).await;
    assert!(!frames.has_changed().unwrap());
}

#[test_timeout::tokio_timeout_test(10)]
async fn cells_outside_grid_limits_never_reach_the_frame() {
    let backend = InMemorySheetBackend::new();
    let handle = open(&backend, SyncConfig::default().with_limits(200, 52));
    handle.subscribe().await.unwrap();
    handle
        .wait_for_state(ConnectionState::Subscribed)
        .await
        .unwrap();

    let err = handle.submit_edit(u32::MAX, 0, "huge").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::OutOfBounds { row: u32::MAX, col: 0, max_rows: 200, max_cols: 52 }
    ));
    assert!(handle.pending().await.unwrap().is_empty());
    assert_eq!(backend.commit_count(), 0);

    backend.inject_event(&change(u32::MAX, 0, "remote", 3)).unwrap();
    backend.write_external(&CellIdentity::new(sheet(), 0, 5_000), "wide");
    backend.inject_event(&change(1, 1, "marker", 9)).unwrap();
    let frame = wait_for_cell(&handle, 1, 1, "marker").await;
    assert_eq!((frame.rows, frame.cols), (100, 26));

    // The stored out-of-range cell is dropped from the snapshot as well.
    handle.subscribe().await.unwrap();
    handle
        .wait_for_state(ConnectionState::Subscribed)
        .await
        .unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.get(u32::MAX, 0).is_none());
    assert!(snapshot.get(0, 5_000).is_none());
    let frame = handle.frames().unwrap().borrow().clone();
    assert_eq!((frame.rows, frame.cols), (100, 26));
}

#[test_timeout::tokio_timeout_test(10)]
async fn rejected_commit_rolls_back_and_notifies() {
    let backend = InMemorySheetBackend::new();
    backend.set_reject(|_, value| (value == "bad").then(|| "validation failed".to_string()));
    let handle = open_subscribed(&backend).await;
    let mut notices = handle.notices().unwrap();

    handle.submit_edit(3, 1, "good").await.unwrap();
    wait_for_cell(&handle, 3, 1, "good").await;
    settle(&handle).await;

    handle.submit_edit(3, 1, "bad").await.unwrap();
    let (identity, restored, error) = next_failure(&mut notices).await;
    assert_eq!(identity.a1(), "B4");
    assert_eq!(restored, "good");
    assert!(matches!(
        error.as_ref(),
        SyncError::CommitRejected { reason, .. } if reason == "validation failed"
    ));
    wait_for_cell(&handle, 3, 1, "good").await;
    assert!(handle.pending().await.unwrap().is_empty());
}

#[test_timeout::tokio_timeout_test(10)]
async fn server_normalization_replaces_optimistic_value() {
    let backend = InMemorySheetBackend::new();
    backend.set_normalizer(|value| value.trim().to_uppercase());
    let handle = open_subscribed(&backend).await;

    handle.submit_edit(0, 2, "  total ").await.unwrap();
    wait_for_cell(&handle, 0, 2, "TOTAL").await;
    settle(&handle).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.get(0, 2).map(|r| r.value.as_str()), Some("TOTAL"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn self_echo_does_not_produce_another_frame() {
    let backend = InMemorySheetBackend::new();
    let handle = open_subscribed(&backend).await;
    let mut frames = handle.frames().unwrap();
    frames.borrow_and_update();

    handle.submit_edit(2, 3, "X").await.unwrap();
    frames.changed().await.unwrap();
    assert_eq!(frames.borrow_and_update().cell(2, 3), Some("X"));

    settle(&handle).await;
    sleep(Duration::from_millis(50)).await;
    assert!(!frames.has_changed().unwrap());
    assert_eq!(backend.commit_count(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn concurrent_remote_edit_is_not_overwritten_by_late_confirmation() {
    let backend = InMemorySheetBackend::new();
    backend.set_latency(|_, value| {
        if value == "10" {
            Duration::from_millis(150)
        } else {
            Duration::ZERO
        }
    });
    let handle = open_subscribed(&backend).await;

    handle.submit_edit(0, 0, "10").await.unwrap();
    wait_for_cell(&handle, 0, 0, "10").await;

    // Another client's write lands on the feed before our commit resolves.
    backend.inject_event(&change(0, 0, "99", 7)).unwrap();
    wait_for_cell(&handle, 0, 0, "99").await;

    settle(&handle).await;
    sleep(Duration::from_millis(50)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.get(0, 0).map(|r| r.value.as_str()), Some("99"));
    assert_eq!(snapshot.get(0, 0).and_then(|r| r.revision), Some(Revision(7)));
}

#[test_timeout::tokio_timeout_test(10)]
async fn concurrent_remote_edit_survives_rejection() {
    let backend = InMemorySheetBackend::new();
    backend.set_fixed_latency(Duration::from_millis(150));
    backend.set_reject(|_, value| (value == "10").then(|| "conflict".to_string()));
    let handle = open_subscribed(&backend).await;
    let mut notices = handle.notices().unwrap();

    handle.submit_edit(0, 0, "10").await.unwrap();
    backend.write_external(&CellIdentity::new(sheet(), 0, 0), "99");
    wait_for_cell(&handle, 0, 0, "99").await;

    let (_, restored, _) = next_failure(&mut notices).await;
    assert_eq!(restored, "99");
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.get(0, 0).map(|r| r.value.as_str()), Some("99"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn stale_redelivery_is_ignored() {
    let backend = InMemorySheetBackend::new();
    let handle = open_subscribed(&backend).await;

    backend.inject_event(&change(1, 1, "B", 5)).unwrap();
    wait_for_cell(&handle, 1, 1, "B").await;

    backend.inject_event(&change(1, 1, "A", 3)).unwrap();
    // Redelivery of the same change is harmless too.
    backend.inject_event(&change(1, 1, "B", 5)).unwrap();
    backend.inject_event(&change(9, 9, "marker", 6)).unwrap();
    wait_for_cell(&handle, 9, 9, "marker").await;

    let snapshot = handle.snapshot().await.unwrap();
    let cell = snapshot.get(1, 1).unwrap();
    assert_eq!(cell.value, "B");
    assert_eq!(cell.revision, Some(Revision(5)));
}

#[test_timeout::tokio_timeout_test(10)]
async fn feed_failure_then_resubscribe_refetches_snapshot() {
    let backend = InMemorySheetBackend::new();
    let handle = open_subscribed(&backend).await;
    let mut notices = handle.notices().unwrap();
    let first_epoch = handle.connection().unwrap().borrow().epoch;

    assert!(backend.fail_feed(&sheet()));
    let status = handle.wait_for_state(ConnectionState::Error).await.unwrap();
    assert!(status.last_error.is_some());
    loop {
        if let SyncNotice::ConnectionLost { epoch, .. } = notices.recv().await.unwrap() {
            assert_eq!(epoch, first_epoch);
            break;
        }
    }

    // Broadcast while disconnected: never replayed by the feed.
    backend.write_external(&CellIdentity::new(sheet(), 4, 4), "offline");
    sleep(Duration::from_millis(20)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.get(4, 4).is_none());

    let epoch = handle.subscribe().await.unwrap();
    assert_eq!(epoch, first_epoch + 1);
    handle
        .wait_for_state(ConnectionState::Subscribed)
        .await
        .unwrap();
    wait_for_cell(&handle, 4, 4, "offline").await;

    // The new subscription is live.
    backend.write_external(&CellIdentity::new(sheet(), 5, 5), "online");
    wait_for_cell(&handle, 5, 5, "online").await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn snapshot_does_not_clobber_open_edit() {
    let backend = InMemorySheetBackend::new();
    backend.write_external(&CellIdentity::new(sheet(), 0, 0), "server");
    backend.set_fixed_latency(Duration::from_millis(200));
    backend.set_reject(|_, _| Some("nope".to_string()));
    let handle = open(&backend, SyncConfig::default());
    let mut notices = handle.notices().unwrap();

    handle.submit_edit(0, 0, "mine").await.unwrap();
    handle.subscribe().await.unwrap();
    handle
        .wait_for_state(ConnectionState::Subscribed)
        .await
        .unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.get(0, 0).map(|r| r.value.as_str()), Some("mine"));

    // The rollback lands on the server's value, not the pre-subscribe blank.
    let (_, restored, _) = next_failure(&mut notices).await;
    assert_eq!(restored, "server");
    wait_for_cell(&handle, 0, 0, "server").await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn resubscribe_repairs_rollback_past_a_kept_write() {
    let backend = InMemorySheetBackend::new();
    backend.set_latency(|_, value| {
        if value == "C" {
            Duration::from_millis(100)
        } else {
            Duration::ZERO
        }
    });
    backend.set_reject(|_, value| (value == "C").then(|| "no".to_string()));
    let handle = open_subscribed(&backend).await;
    let mut notices = handle.notices().unwrap();

    handle.submit_edit(0, 0, "B").await.unwrap();
    handle.submit_edit(0, 0, "C").await.unwrap();
    next_failure(&mut notices).await;

    // The server kept "B"; whatever the rollback restored, a fresh snapshot
    // brings the client back in line.
    handle.subscribe().await.unwrap();
    handle
        .wait_for_state(ConnectionState::Subscribed)
        .await
        .unwrap();
    wait_for_cell(&handle, 0, 0, "B").await;
    assert_eq!(
        values(&handle.snapshot().await.unwrap()),
        values(&backend.durable_snapshot(&sheet()))
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn refused_handshake_reports_error_state() {
    let backend = InMemorySheetBackend::new();
    backend.refuse_subscriptions(Some("maintenance window".into()));
    let handle = open(&backend, SyncConfig::default());

    handle.subscribe().await.unwrap();
    let status = handle.wait_for_state(ConnectionState::Error).await.unwrap();
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|reason| reason.contains("maintenance window")));

    // Local edits keep working while disconnected.
    handle.submit_edit(0, 0, "local").await.unwrap();
    wait_for_cell(&handle, 0, 0, "local").await;

    backend.clear_faults();
    handle.subscribe().await.unwrap();
    handle
        .wait_for_state(ConnectionState::Subscribed)
        .await
        .unwrap();
}

#[test_timeout::tokio_timeout_test(10)]
async fn unsubscribe_closes_connection_but_keeps_session() {
    let backend = InMemorySheetBackend::new();
    let handle = open_subscribed(&backend).await;
    handle.unsubscribe().await.unwrap();
    handle.wait_for_state(ConnectionState::Closed).await.unwrap();

    backend.write_external(&CellIdentity::new(sheet(), 0, 0), "missed");
    handle.submit_edit(1, 0, "still editable").await.unwrap();
    wait_for_cell(&handle, 1, 0, "still editable").await;
    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.get(0, 0).is_none());
}

#[test_timeout::tokio_timeout_test(10)]
async fn commit_timeout_rolls_back() {
    let backend = InMemorySheetBackend::new();
    backend.set_fixed_latency(Duration::from_secs(2));
    let handle = open(
        &backend,
        SyncConfig::default().with_commit_timeout(Duration::from_millis(50)),
    );
    let mut notices = handle.notices().unwrap();

    handle.submit_edit(7, 0, "slow").await.unwrap();
    let (identity, restored, error) = next_failure(&mut notices).await;
    assert_eq!(identity.row, 7);
    assert_eq!(restored, "");
    assert!(matches!(error.as_ref(), SyncError::CommitTimeout { .. }));
    wait_for_cell(&handle, 7, 0, "").await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn teardown_discards_late_responses() {
    let backend = InMemorySheetBackend::new();
    backend.set_fixed_latency(Duration::from_millis(100));
    let handle = open_subscribed(&backend).await;
    let connection = handle.connection().unwrap();
    let frames = handle.frames().unwrap();

    handle.submit_edit(0, 0, "late").await.unwrap();
    handle.teardown().await.unwrap();
    assert_eq!(connection.borrow().state, ConnectionState::Closed);

    sleep(Duration::from_millis(200)).await;
    // The server still applied the commit; the session never saw the answer.
    assert_eq!(backend.commit_count(), 1);
    assert_eq!(backend.subscriber_count(&sheet()), 0);
    assert!(matches!(
        handle.snapshot().await,
        Err(SyncError::SessionClosed)
    ));
    assert!(matches!(handle.subscribe().await, Err(SyncError::SessionClosed)));
    assert!(matches!(handle.notices(), Err(SyncError::SessionClosed)));
    // The session is gone, so the frame channel is closed.
    assert!(frames.has_changed().is_err());
}

#[test_timeout::tokio_timeout_test(20, multi_thread)]
async fn two_clients_converge() {
    let backend = InMemorySheetBackend::new();
    let alice = open_subscribed(&backend).await;
    let bob = open_subscribed(&backend).await;

    alice.submit_edit(0, 0, "alice").await.unwrap();
    bob.submit_edit(0, 1, "bob").await.unwrap();
    alice.submit_edit(2, 2, "first").await.unwrap();
    settle(&alice).await;
    bob.submit_edit(2, 2, "second").await.unwrap();
    settle(&bob).await;

    wait_for_cell(&alice, 0, 1, "bob").await;
    wait_for_cell(&alice, 2, 2, "second").await;
    wait_for_cell(&bob, 0, 0, "alice").await;
    wait_for_cell(&bob, 2, 2, "second").await;

    let durable = values(&backend.durable_snapshot(&sheet()));
    assert_eq!(values(&alice.snapshot().await.unwrap()), durable);
    assert_eq!(values(&bob.snapshot().await.unwrap()), durable);
    assert_eq!(durable.len(), 3);
}
