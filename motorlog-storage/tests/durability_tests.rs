//! Changes must survive the process going away at any point after a write
//! returns.

use motorlog_storage::{
    CacheKey, ChangeLogStore, KvStore, ListCache, StorageError, PENDING_CHANGES_KEY,
};
use motorlog_types::*;
use pretty_assertions::assert_eq;
use rusqlite::Connection;
use serde_json::json;
use std::path::Path;

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

#[test]
fn appended_change_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motorlog.db");

    let id = {
        let store = ChangeLogStore::open(&path).unwrap();
        let appended = store
            .append(NewChange::update(EntityType::Vehicle, "7", json!({"mileage": 51000})))
            .unwrap();
        appended.change().unwrap().id
    };

    let store = ChangeLogStore::open(&path).unwrap();
    let list = store.list().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, id);
    assert_eq!(list[0].data, Some(json!({"mileage": 51000})));
}

#[test]
fn order_and_bookkeeping_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motorlog.db");

    let (a, b) = {
        let store = ChangeLogStore::open(&path).unwrap();
        let a = store.append(NewChange::delete(EntityType::Part, "1")).unwrap();
        let b = store.append(NewChange::delete(EntityType::Part, "2")).unwrap();
        let (a, b) = (a.change().unwrap().id, b.change().unwrap().id);
        store.requeue(a, "timeout").unwrap();
        store.mark_failed(b, "404 part not found").unwrap();
        (a, b)
    };

    let store = ChangeLogStore::open(&path).unwrap();
    let list = store.list().unwrap();
    assert_eq!(list.iter().map(|c| c.id).collect::<Vec<_>>(), vec![a, b]);
    assert_eq!(list[0].retry_count, 1);
    assert!(list[1].is_failed());
    assert_eq!(list[1].last_error.as_deref(), Some("404 part not found"));
}

#[test]
fn in_flight_change_is_pending_after_relaunch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motorlog.db");

    let id = {
        let store = ChangeLogStore::open(&path).unwrap();
        let id = store
            .append(NewChange::delete(EntityType::FuelRecord, "12"))
            .unwrap()
            .change()
            .unwrap()
            .id;
        store.mark_in_flight(id).unwrap();
        id
    };

    let store = ChangeLogStore::open(&path).unwrap();
    let change = store.get(id).unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Pending);
    assert_eq!(store.next_pending().unwrap().unwrap().id, id);
}

#[test]
fn confirmed_change_stays_gone_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motorlog.db");

    {
        let store = ChangeLogStore::open(&path).unwrap();
        let create = store
            .append(NewChange::create(EntityType::Vehicle, json!({"reg": "AB12 CDE"})))
            .unwrap();
        let create = create.change().unwrap().clone();
        store
            .complete(create.id, Some((create.local_ref.unwrap(), "40".into())))
            .unwrap();
    }

    let store = ChangeLogStore::open(&path).unwrap();
    assert!(store.is_empty().unwrap());
}

#[test]
fn failed_write_leaves_log_and_subscribers_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motorlog.db");
    let store = ChangeLogStore::open(&path).unwrap();
    let kept = store
        .append(NewChange::update(EntityType::Vehicle, "7", json!({"mileage": 1})))
        .unwrap()
        .change()
        .unwrap()
        .clone();
    let breaker = write_breaker(&path);
    let mut snapshots = store.subscribe();
    snapshots.borrow_and_update();

    break_writes(&breaker, true);
    let err = store
        .append(NewChange::update(EntityType::Vehicle, "7", json!({"mileage": 2})))
        .unwrap_err();
    assert!(matches!(err, StorageError::Database(_)), "got {err:?}");
    let err = store.mark_in_flight(kept.id).unwrap_err();
    assert!(matches!(err, StorageError::Database(_)), "got {err:?}");

    assert_eq!(store.list().unwrap(), vec![kept.clone()]);
    assert!(!snapshots.has_changed().unwrap());

    break_writes(&breaker, false);
    drop(store);
    let store = ChangeLogStore::open(&path).unwrap();
    assert_eq!(store.list().unwrap(), vec![kept]);
}

#[test]
fn log_is_stored_under_a_single_key() {
    let kv = KvStore::open_in_memory().unwrap();
    let store = ChangeLogStore::with_kv(
        kv.clone(),
        std::sync::Arc::new(SystemClock),
        Default::default(),
    )
    .unwrap();
    store.append(NewChange::delete(EntityType::Part, "5")).unwrap();

    let raw: Vec<PendingChange> = kv.get_json(PENDING_CHANGES_KEY).unwrap().unwrap();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].entity_id.as_deref(), Some("5"));
}

#[test]
fn parent_directory_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state").join("motorlog.db");
    ChangeLogStore::open(&path).unwrap();
    assert!(path.exists());
}

// ── List cache ──────────────────────────────────────────────────

#[test]
fn cache_keys_follow_layout() {
    assert_eq!(CacheKey::vehicles().as_str(), "vehicles");
    assert_eq!(CacheKey::fuel("all").as_str(), "fuel_all");
    assert_eq!(CacheKey::parts("7").as_str(), "parts_7");
    assert_eq!(CacheKey::mot("7").as_str(), "mot_7");
    assert_eq!(CacheKey::consumables("unassigned").as_str(), "consumables_unassigned");
}

#[test]
fn cached_page_survives_reopen_alongside_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("motorlog.db");
    let fetched_at = chrono::Utc::now();

    {
        let kv = KvStore::open(&path).unwrap();
        let cache = ListCache::new(kv);
        cache
            .put(&CacheKey::fuel("7"), json!([{"id": 12, "litres": 41.2}]), fetched_at)
            .unwrap();
    }

    let store = ChangeLogStore::open(&path).unwrap();
    assert!(store.is_empty().unwrap());
    let cache = ListCache::new(store.kv().clone());
    let page = cache.get(&CacheKey::fuel("7")).unwrap().unwrap();
    assert_eq!(page.items, json!([{"id": 12, "litres": 41.2}]));
    assert_eq!(page.fetched_at, fetched_at);

    assert!(cache.invalidate(&CacheKey::fuel("7")).unwrap());
    assert!(cache.get(&CacheKey::fuel("7")).unwrap().is_none());
}
