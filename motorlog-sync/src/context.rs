//! Application-facing synchronizer.
//!
//! [`SyncContext`] is what the screens hold. It owns the connectivity
//! monitor, the change log and the coordinator task, and exposes the
//! operations the UI needs: reading connectivity and the queue, enqueuing
//! mutations, forcing a drain, and resolving failed changes.

use crate::api_client::{ApplyOutcome, HttpMutationApplier, MutationApplier, TokenProvider};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, connectivity_monitor};
use crate::coordinator::{SyncHandle, SyncReport, SyncStatus, create_sync_coordinator};
use crate::error::{SyncError, SyncResult};

use chrono::{DateTime, Utc};
use motorlog_storage::{Appended, ChangeLogStore, KvStore, ListCache, StorageError};
use motorlog_types::{ChangeId, ChangeKind, Clock, NewChange, PendingChange, SystemClock};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Result of [`SyncContext::perform`].
#[derive(Debug, Clone, PartialEq)]
pub enum Performed {
    /// The server confirmed the change directly. Carries the response body.
    Applied(Option<Value>),
    /// The change went to the log and will be sent by a later drain.
    Queued(Appended),
}

pub struct SyncContext {
    store: Arc<ChangeLogStore>,
    applier: Arc<dyn MutationApplier>,
    monitor: ConnectivityMonitor,
    handle: SyncHandle,
    clock: Arc<dyn Clock>,
}

impl SyncContext {
    /// Opens the on-device database at `db_path` and starts syncing against
    /// the REST API. Must be called inside a tokio runtime.
    pub fn open(
        config: SyncConfig,
        db_path: &Path,
        tokens: Arc<dyn TokenProvider>,
        initially_online: bool,
    ) -> SyncResult<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = ChangeLogStore::with_kv(KvStore::open(db_path)?, clock.clone(), config.coalesce)?;
        let applier = HttpMutationApplier::new(&config, tokens)?;
        Self::start(config, Arc::new(store), Arc::new(applier), initially_online, clock)
    }

    /// Wires the given store and applier together and spawns the
    /// connectivity debouncer and the coordinator.
    pub fn start(
        config: SyncConfig,
        store: Arc<ChangeLogStore>,
        applier: Arc<dyn MutationApplier>,
        initially_online: bool,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let (monitor, debouncer) = connectivity_monitor(initially_online, config.connectivity_dwell());
        let (handle, mut coordinator) = create_sync_coordinator(
            &config,
            store.clone(),
            applier.clone(),
            monitor.clone(),
            clock.clone(),
        );

        tokio::spawn(debouncer.run());
        tokio::spawn(async move { coordinator.run().await });

        info!(
            api = %config.api_base_url,
            pending = store.pending_count()?,
            online = initially_online,
            "sync context started"
        );

        Ok(Self {
            store,
            applier,
            monitor,
            handle,
            clock,
        })
    }

    // ── Connectivity ──

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Feeds a raw reachability observation from the platform.
    pub fn report_connectivity(&self, reachable: bool) {
        self.monitor.report(reachable);
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<bool> {
        self.monitor.subscribe()
    }

    // ── Change log ──

    /// Every change still in the log, oldest first, failed ones included.
    pub fn pending_changes(&self) -> SyncResult<Vec<PendingChange>> {
        Ok(self.store.list()?)
    }

    /// Changes still waiting to be sent.
    pub fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.store.pending_count()?)
    }

    /// Changes that need the user's attention.
    pub fn failed_changes(&self) -> SyncResult<Vec<PendingChange>> {
        Ok(self.store.list()?.into_iter().filter(PendingChange::is_failed).collect())
    }

    /// Durably enqueues a change. The write has happened when this returns.
    pub fn add_pending_change(&self, change: NewChange) -> SyncResult<Appended> {
        Ok(self.store.append(change)?)
    }

    pub fn subscribe_pending(&self) -> watch::Receiver<Vec<PendingChange>> {
        self.store.subscribe()
    }

    /// Puts a failed change back in line.
    pub fn retry_change(&self, id: ChangeId) -> SyncResult<PendingChange> {
        Ok(self.store.retry(id)?)
    }

    pub fn discard_change(&self, id: ChangeId) -> SyncResult<PendingChange> {
        Ok(self.store.discard(id)?)
    }

    /// Applies a change right away when online and nothing is queued for the
    /// same record; otherwise queues it. A direct call that gets no answer is
    /// queued as well. A direct rejection is returned as an error and nothing
    /// is queued.
    pub async fn perform(&self, change: NewChange) -> SyncResult<Performed> {
        change.validate().map_err(StorageError::InvalidChange)?;

        if !self.is_online() {
            debug!("offline, queueing {} {}", change.kind, change.entity_type);
            return self.queue(change);
        }

        let mut candidate = change.clone().into_pending(self.clock.now());
        if candidate.kind != ChangeKind::Create && candidate.entity_id.is_none() {
            if let Some(local_ref) = candidate.local_ref {
                candidate.entity_id = self.store.resolve_local_ref(local_ref)?;
            }
        }
        if !candidate.is_resolved() || self.store.has_queued_for(&candidate)? {
            debug!("{} has queued work, queueing behind it", candidate.target());
            return self.queue(change);
        }

        match self.applier.apply(&candidate).await {
            ApplyOutcome::Confirmed(body) => Ok(Performed::Applied(body)),
            ApplyOutcome::Rejected(detail) => Err(SyncError::Rejected(detail)),
            ApplyOutcome::Unreachable(reason) => {
                debug!("{} unreachable ({reason}), queueing", candidate.target());
                self.queue(change)
            }
        }
    }

    fn queue(&self, change: NewChange) -> SyncResult<Performed> {
        Ok(Performed::Queued(self.store.append(change)?))
    }

    // ── Sync ──

    /// Drains the log now, or waits for the drain already running.
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        self.handle.sync_now().await
    }

    pub fn is_syncing(&self) -> bool {
        self.handle.status().is_syncing()
    }

    /// When the last drain emptied the queue of sendable changes.
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.handle.status().last_sync_time
    }

    pub fn status(&self) -> SyncStatus {
        self.handle.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.handle.subscribe()
    }

    /// Last fetched list pages, stored beside the change log.
    pub fn list_cache(&self) -> ListCache {
        ListCache::new(self.store.kv().clone())
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.handle.shutdown().await
    }
}
