#![allow(dead_code)]

use async_trait::async_trait;
use motorlog_storage::{ChangeLogStore, CoalescePolicy, KvStore};
use motorlog_sync::{ApplyOutcome, MutationApplier, SyncConfig, SyncContext, SyncStatus};
use motorlog_types::{ChangeKind, PendingChange, SystemClock};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};

pub const WAIT: Duration = Duration::from_secs(5);

/// Config with short timings and no periodic drain.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        api_base_url: "http://motorlog.test".into(),
        request_timeout_ms: 2_000,
        connectivity_dwell_ms: 10,
        backoff_base_ms: 20,
        backoff_ceiling_secs: 1,
        max_transient_retries: 10,
        periodic_sync_secs: None,
        ..SyncConfig::default()
    }
}

pub fn memory_store(policy: CoalescePolicy) -> Arc<ChangeLogStore> {
    let kv = KvStore::open_in_memory().unwrap();
    Arc::new(ChangeLogStore::with_kv(kv, Arc::new(SystemClock), policy).unwrap())
}

pub fn start(
    config: SyncConfig,
    store: Arc<ChangeLogStore>,
    applier: Arc<dyn MutationApplier>,
    online: bool,
) -> SyncContext {
    SyncContext::start(config, store, applier, online, Arc::new(SystemClock)).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("motorlog_sync=debug")
        .with_test_writer()
        .try_init();
}

/// Waits until the status satisfies `f`, failing the test after [`WAIT`].
pub async fn wait_for_status(
    rx: &mut watch::Receiver<SyncStatus>,
    f: impl FnMut(&SyncStatus) -> bool,
) -> SyncStatus {
    tokio::time::timeout(WAIT, rx.wait_for(f))
        .await
        .expect("timed out waiting for sync status")
        .expect("coordinator gone")
        .clone()
}

pub async fn wait_online(ctx: &SyncContext, online: bool) {
    let mut rx = ctx.subscribe_connectivity();
    tokio::time::timeout(WAIT, rx.wait_for(|v| *v == online))
        .await
        .expect("timed out waiting for connectivity")
        .expect("monitor gone");
}

/// Applier that records every call and answers from a script.
///
/// With the script empty it confirms: creates get a fresh numeric id,
/// updates echo their payload, deletes get no body.
pub struct ScriptedApplier {
    calls: Mutex<Vec<PendingChange>>,
    script: Mutex<VecDeque<ApplyOutcome>>,
    next_id: AtomicU64,
    hold_next: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl ScriptedApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(100),
            hold_next: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    pub fn push(&self, outcome: ApplyOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<PendingChange> {
        self.calls.lock().unwrap().clone()
    }

    /// `(kind, target)` of every call, e.g. `(Update, "vehicle#7")`.
    pub fn call_targets(&self) -> Vec<(ChangeKind, String)> {
        self.calls()
            .iter()
            .map(|c| (c.kind, c.target()))
            .collect()
    }

    /// Makes the next call block until [`release`](Self::release).
    pub fn hold_next(&self) {
        self.hold_next.store(true, Ordering::SeqCst);
    }

    /// Resolves once a held call has started.
    pub async fn entered(&self) {
        tokio::time::timeout(WAIT, self.entered.notified())
            .await
            .expect("held call never started");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl MutationApplier for ScriptedApplier {
    async fn apply(&self, change: &PendingChange) -> ApplyOutcome {
        self.calls.lock().unwrap().push(change.clone());

        if self.hold_next.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }

        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            return outcome;
        }
        match change.kind {
            ChangeKind::Create => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut body = change.data.clone().unwrap_or_else(|| json!({}));
                body["id"] = json!(id);
                ApplyOutcome::Confirmed(Some(body))
            }
            ChangeKind::Update => ApplyOutcome::Confirmed(change.data.clone()),
            ChangeKind::Delete => ApplyOutcome::Confirmed(None),
        }
    }
}
