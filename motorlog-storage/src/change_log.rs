//! Ordered, durable log of pending changes.
//!
//! The log is held in memory and mirrored to the `pending_changes` key. Every
//! mutation is applied to a copy, committed, and only then swapped in, so a
//! failed write leaves both the disk and the in-memory view untouched.
//!
//! Appends coalesce against the latest queued change for the same entity:
//! - update after pending update: payload replaced in place
//! - update after pending create: payload folded into the create (policy)
//! - delete after pending changes: those entries dropped; if a never-sent
//!   create was among them the delete is dropped as well
//! - delete of a local entity whose create failed: the failed entries and the
//!   delete are all dropped

use crate::error::{StorageError, StorageResult};
use crate::kv::KvStore;
use motorlog_types::{
    ChangeId, ChangeKind, ChangeStatus, Clock, LocalRef, NewChange, PendingChange, SystemClock,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Key holding the serialized ordered list of pending changes.
pub const PENDING_CHANGES_KEY: &str = "pending_changes";

/// Key holding local refs whose create was confirmed, with their server id.
pub const RESOLVED_REFS_KEY: &str = "resolved_refs";

/// Oldest resolved refs are forgotten past this many.
const MAX_RESOLVED_REFS: usize = 1024;

/// How appends merge into already queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescePolicy {
    /// Fold an update into a still-pending create of the same entity, so the
    /// server sees one `POST` with the final payload instead of `POST` + `PUT`.
    pub fold_updates_into_create: bool,
}

impl Default for CoalescePolicy {
    fn default() -> Self {
        Self {
            fold_updates_into_create: true,
        }
    }
}

/// What an append did to the log.
#[derive(Debug, Clone, PartialEq)]
pub enum Appended {
    /// Added at the tail.
    Queued(PendingChange),
    /// Merged into an existing entry, which kept its position.
    Coalesced(PendingChange),
    /// A delete cancelled a never-sent create; `removed` entries were dropped
    /// and nothing needs to reach the server.
    Cancelled { removed: usize },
}

impl Appended {
    /// The log entry that now carries the mutation, if any.
    pub fn change(&self) -> Option<&PendingChange> {
        match self {
            Appended::Queued(c) | Appended::Coalesced(c) => Some(c),
            Appended::Cancelled { .. } => None,
        }
    }
}

#[derive(Clone, Default)]
struct LogState {
    changes: Vec<PendingChange>,
    resolved: Vec<(LocalRef, String)>,
}

impl LogState {
    fn position(&self, id: ChangeId) -> StorageResult<usize> {
        self.changes
            .iter()
            .position(|c| c.id == id)
            .ok_or(StorageError::NotFound(id))
    }

    fn resolved_id(&self, local_ref: LocalRef) -> Option<&String> {
        self.resolved
            .iter()
            .rev()
            .find(|(r, _)| *r == local_ref)
            .map(|(_, id)| id)
    }

    fn remap(&mut self, local_ref: LocalRef, server_id: &str) -> usize {
        let mut remapped = 0;
        for change in &mut self.changes {
            if change.local_ref == Some(local_ref) && change.entity_id.is_none() {
                change.entity_id = Some(server_id.to_string());
                remapped += 1;
            }
        }
        self.resolved.retain(|(r, _)| *r != local_ref);
        self.resolved.push((local_ref, server_id.to_string()));
        if self.resolved.len() > MAX_RESOLVED_REFS {
            let excess = self.resolved.len() - MAX_RESOLVED_REFS;
            self.resolved.drain(..excess);
        }
        remapped
    }
}

/// Durable, ordered store of pending changes.
pub struct ChangeLogStore {
    kv: KvStore,
    state: Mutex<LogState>,
    clock: Arc<dyn Clock>,
    policy: CoalescePolicy,
    snapshot_tx: watch::Sender<Vec<PendingChange>>,
}

impl ChangeLogStore {
    /// Opens or creates a change log at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::with_kv(KvStore::open(path)?, Arc::new(SystemClock), CoalescePolicy::default())
    }

    /// Opens an in-memory change log (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_kv(
            KvStore::open_in_memory()?,
            Arc::new(SystemClock),
            CoalescePolicy::default(),
        )
    }

    /// Loads the log from `kv`.
    ///
    /// Entries persisted as in flight are reset to pending: a relaunch starts
    /// from durable state only, and the outcome of that request is unknown.
    pub fn with_kv(kv: KvStore, clock: Arc<dyn Clock>, policy: CoalescePolicy) -> StorageResult<Self> {
        let mut state = LogState {
            changes: kv.get_json(PENDING_CHANGES_KEY)?.unwrap_or_default(),
            resolved: kv.get_json(RESOLVED_REFS_KEY)?.unwrap_or_default(),
        };

        let mut reset = 0;
        for change in &mut state.changes {
            if change.status == ChangeStatus::InFlight {
                change.status = ChangeStatus::Pending;
                reset += 1;
            }
        }
        if reset > 0 {
            warn!("reset {reset} in-flight changes to pending after restart");
            persist(&kv, &state)?;
        }
        if !state.changes.is_empty() {
            info!("loaded {} pending changes", state.changes.len());
        }

        let (snapshot_tx, _) = watch::channel(state.changes.clone());
        Ok(Self {
            kv,
            state: Mutex::new(state),
            clock,
            policy,
            snapshot_tx,
        })
    }

    /// The underlying key/value store, shared with the list caches.
    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn policy(&self) -> CoalescePolicy {
        self.policy
    }

    /// All changes in enqueue order, failed ones included.
    pub fn list(&self) -> StorageResult<Vec<PendingChange>> {
        Ok(self.lock()?.changes.clone())
    }

    pub fn get(&self, id: ChangeId) -> StorageResult<Option<PendingChange>> {
        Ok(self.lock()?.changes.iter().find(|c| c.id == id).cloned())
    }

    /// Number of entries, failed ones included.
    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.lock()?.changes.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.lock()?.changes.is_empty())
    }

    /// Number of entries still waiting to be sent.
    pub fn pending_count(&self) -> StorageResult<usize> {
        Ok(self.lock()?.changes.iter().filter(|c| c.is_pending()).count())
    }

    /// Number of entries not yet settled: pending or in flight.
    pub fn unsettled_count(&self) -> StorageResult<usize> {
        Ok(self.lock()?.changes.iter().filter(|c| !c.is_failed()).count())
    }

    /// The oldest entry with `status = pending`.
    pub fn next_pending(&self) -> StorageResult<Option<PendingChange>> {
        Ok(self.lock()?.changes.iter().find(|c| c.is_pending()).cloned())
    }

    /// The oldest entry that is not failed. Only this entry is ever handed to
    /// the applier, so an in-flight entry can only show up here.
    pub fn next_unsettled(&self) -> StorageResult<Option<PendingChange>> {
        Ok(self.lock()?.changes.iter().find(|c| !c.is_failed()).cloned())
    }

    /// Returns true if a pending or in-flight entry targets the same entity.
    pub fn has_queued_for(&self, change: &PendingChange) -> StorageResult<bool> {
        Ok(self
            .lock()?
            .changes
            .iter()
            .any(|c| !c.is_failed() && c.same_entity(change)))
    }

    /// Server id a confirmed create assigned to `local_ref`, if known.
    pub fn resolve_local_ref(&self, local_ref: LocalRef) -> StorageResult<Option<String>> {
        Ok(self.lock()?.resolved_id(local_ref).cloned())
    }

    /// Receives a snapshot after every committed mutation.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PendingChange>> {
        self.snapshot_tx.subscribe()
    }

    /// Validates, coalesces and persists a new change.
    pub fn append(&self, new: NewChange) -> StorageResult<Appended> {
        new.validate().map_err(StorageError::InvalidChange)?;
        let mut change = new.into_pending(self.clock.now());
        let policy = self.policy;

        self.mutate(move |state| {
            if state.changes.iter().any(|c| c.id == change.id) {
                return Err(StorageError::InvalidChange(format!(
                    "duplicate change id {}",
                    change.id
                )));
            }

            if change.entity_id.is_none() && change.kind != ChangeKind::Create {
                if let Some(server_id) = change.local_ref.and_then(|r| state.resolved_id(r)) {
                    change.entity_id = Some(server_id.clone());
                }
            }

            match change.kind {
                ChangeKind::Create => {}
                ChangeKind::Update => {
                    if let Some(merged) = coalesce_update(state, &change, policy) {
                        debug!("coalesced update into {} for {}", merged.id, merged.target());
                        return Ok(Appended::Coalesced(merged));
                    }
                }
                ChangeKind::Delete => {
                    // A local entity whose create was rejected never existed
                    // on the server: its failed entries go with the delete.
                    let orphaned = change.entity_id.is_none()
                        && state.changes.iter().any(|c| {
                            c.kind == ChangeKind::Create && c.is_failed() && c.same_entity(&change)
                        });
                    let before = state.changes.len();
                    let mut cancelled_create = false;
                    state.changes.retain(|c| {
                        let drop = (c.is_pending() || (orphaned && c.is_failed()))
                            && c.same_entity(&change);
                        if drop && c.kind == ChangeKind::Create {
                            cancelled_create = true;
                        }
                        !drop
                    });
                    let removed = before - state.changes.len();
                    if cancelled_create {
                        debug!("delete cancelled never-sent create for {}", change.target());
                        return Ok(Appended::Cancelled { removed });
                    }
                    if removed > 0 {
                        debug!("delete superseded {removed} queued changes for {}", change.target());
                    }
                }
            }

            debug!("queued {} {} ({})", change.kind, change.target(), change.id);
            state.changes.push(change.clone());
            Ok(Appended::Queued(change))
        })
    }

    /// Removes a change.
    pub fn remove(&self, id: ChangeId) -> StorageResult<()> {
        self.mutate(|state| {
            let idx = state.position(id)?;
            state.changes.remove(idx);
            Ok(())
        })
    }

    /// Marks a change as handed to the applier.
    pub fn mark_in_flight(&self, id: ChangeId) -> StorageResult<()> {
        self.mutate(|state| {
            let idx = state.position(id)?;
            state.changes[idx].status = ChangeStatus::InFlight;
            Ok(())
        })
    }

    /// Marks a change as terminally failed. It stays in the log for the user.
    pub fn mark_failed(&self, id: ChangeId, error: impl Into<String>) -> StorageResult<()> {
        let error = error.into();
        self.mutate(move |state| {
            let idx = state.position(id)?;
            let change = &mut state.changes[idx];
            change.status = ChangeStatus::Failed;
            change.last_error = Some(error);
            Ok(())
        })
    }

    /// Puts a change back to pending after a transient failure. Returns the
    /// new retry count.
    pub fn requeue(&self, id: ChangeId, error: impl Into<String>) -> StorageResult<u32> {
        let error = error.into();
        self.mutate(move |state| {
            let idx = state.position(id)?;
            let change = &mut state.changes[idx];
            change.status = ChangeStatus::Pending;
            change.retry_count += 1;
            change.last_error = Some(error);
            Ok(change.retry_count)
        })
    }

    /// Puts a change back to pending without charging a retry. Used when the
    /// device was offline, so the server never had a chance to answer.
    pub fn release(&self, id: ChangeId, error: impl Into<String>) -> StorageResult<()> {
        let error = error.into();
        self.mutate(move |state| {
            let idx = state.position(id)?;
            let change = &mut state.changes[idx];
            change.status = ChangeStatus::Pending;
            change.last_error = Some(error);
            Ok(())
        })
    }

    /// Rewrites every change waiting on `local_ref` to target `server_id`.
    /// Returns how many were rewritten.
    pub fn remap_entity_id(&self, local_ref: LocalRef, server_id: &str) -> StorageResult<usize> {
        self.mutate(|state| Ok(state.remap(local_ref, server_id)))
    }

    /// Removes a confirmed change and, for a create, remaps its dependents,
    /// in one transaction. Returns how many dependents were remapped.
    pub fn complete(&self, id: ChangeId, remap: Option<(LocalRef, String)>) -> StorageResult<usize> {
        self.mutate(move |state| {
            let idx = state.position(id)?;
            state.changes.remove(idx);
            Ok(match remap {
                Some((local_ref, server_id)) => state.remap(local_ref, &server_id),
                None => 0,
            })
        })
    }

    /// Fails every pending change still waiting on `local_ref`. Used when the
    /// create they depend on was rejected.
    pub fn fail_dependents(&self, local_ref: LocalRef, error: impl Into<String>) -> StorageResult<usize> {
        let error = error.into();
        self.mutate(move |state| {
            let mut failed = 0;
            for change in &mut state.changes {
                if change.local_ref == Some(local_ref)
                    && change.entity_id.is_none()
                    && change.is_pending()
                {
                    change.status = ChangeStatus::Failed;
                    change.last_error = Some(error.clone());
                    failed += 1;
                }
            }
            Ok(failed)
        })
    }

    /// Puts a failed change back in line, clearing its retry bookkeeping.
    pub fn retry(&self, id: ChangeId) -> StorageResult<PendingChange> {
        self.mutate(|state| {
            let idx = state.position(id)?;
            let change = &mut state.changes[idx];
            if !change.is_failed() {
                return Err(StorageError::InvalidChange(format!(
                    "change {id} is not failed"
                )));
            }
            change.status = ChangeStatus::Pending;
            change.retry_count = 0;
            change.last_error = None;
            Ok(change.clone())
        })
    }

    /// Drops a change at the user's request.
    pub fn discard(&self, id: ChangeId) -> StorageResult<PendingChange> {
        self.mutate(|state| {
            let idx = state.position(id)?;
            if state.changes[idx].status == ChangeStatus::InFlight {
                return Err(StorageError::InvalidChange(format!(
                    "change {id} is in flight"
                )));
            }
            Ok(state.changes.remove(idx))
        })
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut LogState) -> StorageResult<R>) -> StorageResult<R> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        persist(&self.kv, &next)?;
        *guard = next;
        self.snapshot_tx.send_replace(guard.changes.clone());
        Ok(out)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, LogState>> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

fn persist(kv: &KvStore, state: &LogState) -> StorageResult<()> {
    let changes = serde_json::to_string(&state.changes)?;
    let resolved = serde_json::to_string(&state.resolved)?;
    kv.write_batch(&[(PENDING_CHANGES_KEY, changes), (RESOLVED_REFS_KEY, resolved)])
}

/// Merges `update` into the latest queued change for its entity when that
/// change has not left the device yet. Returns the merged entry.
fn coalesce_update(
    state: &mut LogState,
    update: &PendingChange,
    policy: CoalescePolicy,
) -> Option<PendingChange> {
    let idx = state
        .changes
        .iter()
        .rposition(|c| !c.is_failed() && c.same_entity(update))?;
    let existing = &mut state.changes[idx];
    if !existing.is_pending() {
        return None;
    }
    match existing.kind {
        ChangeKind::Update => {
            existing.data = update.data.clone();
            if existing.entity_id.is_none() {
                existing.entity_id = update.entity_id.clone();
            }
        }
        ChangeKind::Create if policy.fold_updates_into_create => {
            existing.data = Some(merge_payload(existing.data.take(), update.data.clone()));
        }
        _ => return None,
    }
    Some(existing.clone())
}

/// Shallow object merge, later fields win. Non-objects are replaced.
fn merge_payload(base: Option<Value>, patch: Option<Value>) -> Value {
    match (base, patch) {
        (Some(Value::Object(mut base)), Some(Value::Object(patch))) => {
            for (k, v) in patch {
                base.insert(k, v);
            }
            Value::Object(base)
        }
        (_, Some(patch)) => patch,
        (Some(base), None) => base,
        (None, None) => Value::Null,
    }
}
