//! SQLite storage layer for Motorlog.
//!
//! Everything the client persists lives in one key/value table:
//!
//! - `pending_changes`: the ordered list of not-yet-confirmed mutations
//! - `resolved_refs`: local refs whose create has been confirmed, with the server id
//! - `vehicles`, `fuel_<filter>`, `parts_<filter>`, ...: last fetched list pages
//!
//! Every write is committed with `synchronous = FULL` before it returns, so an
//! app kill after a write never loses it.

mod change_log;
mod error;
mod kv;
mod list_cache;

pub use change_log::{Appended, ChangeLogStore, CoalescePolicy, PENDING_CHANGES_KEY, RESOLVED_REFS_KEY};
pub use error::{StorageError, StorageResult};
pub use kv::KvStore;
pub use list_cache::{CacheKey, CachedPage, ListCache};

use rusqlite::Connection;
use std::path::Path;

/// Opens a SQLite connection tuned for durable small writes.
///
/// Creates the parent directory if needed. WAL journaling keeps readers off
/// the writer's back; `synchronous = FULL` makes each commit durable.
pub fn open_sqlite(path: &Path) -> StorageResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    apply_durability_pragmas(&conn)?;
    Ok(conn)
}

fn apply_durability_pragmas(conn: &Connection) -> StorageResult<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(())
}
