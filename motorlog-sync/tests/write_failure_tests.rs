//! The coordinator and facade when the on-device database refuses writes.

mod support;

use motorlog_storage::{ChangeLogStore, CoalescePolicy, KvStore, StorageError};
use motorlog_sync::{SyncError, SyncState};
use motorlog_types::{ChangeStatus, EntityType, NewChange, SystemClock};
use pretty_assertions::assert_eq;
use rusqlite::Connection;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use support::*;

/// Side connection that makes every kv write abort while `fail_writes` has a row.
fn write_breaker(path: &Path) -> Connection {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE fail_writes (on_off INTEGER);
         CREATE TRIGGER kv_fail_writes BEFORE INSERT ON kv
         WHEN EXISTS (SELECT 1 FROM fail_writes)
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    )
    .unwrap();
    conn
}

fn break_writes(conn: &Connection, broken: bool) {
    let sql = if broken {
        "INSERT INTO fail_writes VALUES (1)"
    } else {
        "DELETE FROM fail_writes"
    };
    conn.execute(sql, []).unwrap();
}

fn file_store(path: &Path) -> Arc<ChangeLogStore> {
    let kv = KvStore::open(path).unwrap();
    Arc::new(ChangeLogStore::with_kv(kv, Arc::new(SystemClock), CoalescePolicy::default()).unwrap())
}

#[tokio::test]
async fn confirmed_change_is_written_back_before_later_changes_are_sent() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motorlog.db");
    let breaker = write_breaker_after_open(&path);

    let applier = ScriptedApplier::new();
    let ctx = start(test_config(), file_store(&path), applier.clone(), true);
    let mut status = ctx.subscribe_status();

    ctx.add_pending_change(NewChange::update(EntityType::Vehicle, "7", json!({"v": 1})))
        .unwrap();
    applier.hold_next();
    let (halted, ()) = tokio::join!(ctx.sync_now(), async {
        applier.entered().await;
        ctx.add_pending_change(NewChange::update(EntityType::Vehicle, "7", json!({"v": 2})))
            .unwrap();
        break_writes(&breaker, true);
        applier.release();
    });

    let halted = halted.unwrap();
    assert!(halted.halted);
    // The confirmed change could not be removed, so it still counts.
    assert_eq!(halted.remaining, 2);
    assert_eq!(halted.confirmed, 0);
    assert!(ctx.last_sync_time().is_none());
    let queued = ctx.pending_changes().unwrap();
    assert_eq!(queued[0].status, ChangeStatus::InFlight);
    assert_eq!(applier.calls().len(), 1);

    break_writes(&breaker, false);
    let done = wait_for_status(&mut status, |s| s.last_sync_time.is_some()).await;
    let report = done.last_report.unwrap();
    assert_eq!((report.confirmed, report.remaining), (2, 0));

    let sent: Vec<_> = applier.calls().iter().map(|c| c.data.clone().unwrap()).collect();
    assert_eq!(sent, vec![json!({"v": 1}), json!({"v": 2})]);
    assert!(ctx.pending_changes().unwrap().is_empty());

    // Nothing is replayed after a relaunch.
    ctx.shutdown().await.unwrap();
    drop(ctx);
    assert!(file_store(&path).list().unwrap().is_empty());
}

#[tokio::test]
async fn add_pending_change_reports_a_failed_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motorlog.db");
    let breaker = write_breaker_after_open(&path);

    let ctx = start(test_config(), file_store(&path), ScriptedApplier::new(), false);
    let mut pending = ctx.subscribe_pending();
    pending.borrow_and_update();

    break_writes(&breaker, true);
    let err = ctx
        .add_pending_change(NewChange::delete(EntityType::FuelRecord, "12"))
        .unwrap_err();
    assert!(matches!(err, SyncError::Storage(StorageError::Database(_))), "got {err:?}");
    assert!(ctx.pending_changes().unwrap().is_empty());
    assert!(!pending.has_changed().unwrap());
    assert_eq!(ctx.status().state, SyncState::Idle);

    break_writes(&breaker, false);
    ctx.add_pending_change(NewChange::delete(EntityType::FuelRecord, "12"))
        .unwrap();
    assert_eq!(ctx.pending_changes().unwrap().len(), 1);
}

/// Creates the kv schema first so the trigger has a table to attach to.
fn write_breaker_after_open(path: &Path) -> Connection {
    drop(KvStore::open(path).unwrap());
    write_breaker(path)
}
