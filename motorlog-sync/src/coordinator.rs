//! Sync coordinator.
//!
//! Drains the change log one change at a time, oldest first. Main loop:
//! - Idle: waits for a reachable edge, a `sync_now`, the periodic timer or shutdown
//! - Draining: applies the oldest unsettled change, checking commands between steps
//! - Backoff: waits for the retry deadline (or a reachable edge) after no answer
//!
//! Follows the handle + engine split of the rest of the workspace: callers hold
//! a cloneable [`SyncHandle`], the [`SyncCoordinator`] runs on its own task.

use crate::api_client::{server_id, ApplyOutcome, MutationApplier};
use crate::backoff::BackoffPolicy;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ReachableEdge};
use crate::error::{SyncError, SyncResult};
use crate::state::{SyncInput, SyncState, TriggerSource};

use chrono::{DateTime, Utc};
use motorlog_storage::{ChangeLogStore, StorageResult};
use motorlog_types::{ChangeKind, ChangeStatus, Clock, LocalRef, PendingChange};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Summary of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub confirmed: usize,
    /// Changes marked failed during the run, dependents included.
    pub rejected: usize,
    /// Changes still waiting to be sent when the run ended.
    pub remaining: usize,
    /// True if the run stopped early and went into backoff.
    pub halted: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_report: Option<SyncReport>,
}

impl SyncStatus {
    pub fn is_syncing(&self) -> bool {
        self.state.is_active()
    }
}

/// What an applied change needs written back to the log.
#[derive(Debug)]
enum Settlement {
    Confirmed(Option<(LocalRef, String)>),
    /// No answer. `counted` is false when the device was offline.
    Requeue { reason: String, counted: bool },
    Failed(String),
}

enum SyncCommand {
    SyncNow { reply: oneshot::Sender<SyncReport> },
    Shutdown,
}

/// Handle for sending commands to the coordinator.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    status_rx: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    /// Starts a drain, or joins the one already running, and waits for its
    /// report. During backoff it returns the last report right away.
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SyncCommand::SyncNow { reply })
            .await
            .map_err(|_| SyncError::NotRunning)?;
        rx.await.map_err(|_| SyncError::NotRunning)
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::Shutdown)
            .await
            .map_err(|_| SyncError::NotRunning)
    }

    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }
}

/// The drain loop. Create with [`create_sync_coordinator`], then spawn
/// [`SyncCoordinator::run`].
pub struct SyncCoordinator {
    store: Arc<ChangeLogStore>,
    applier: Arc<dyn MutationApplier>,
    monitor: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    max_transient_retries: u32,
    periodic: Option<Duration>,
    command_rx: mpsc::Receiver<SyncCommand>,
    edges: broadcast::Receiver<ReachableEdge>,
    status_tx: watch::Sender<SyncStatus>,
    state: SyncState,
    /// Consecutive halts without a confirmed change in between.
    backoff_attempt: u32,
    retry_at: Option<Instant>,
    run_report: SyncReport,
    last_report: Option<SyncReport>,
    last_sync_time: Option<DateTime<Utc>>,
    waiters: Vec<oneshot::Sender<SyncReport>>,
    /// Outcome whose write-back failed; its change is still in flight.
    unsettled: Option<(PendingChange, Settlement)>,
    /// Last count read from the log, kept across read errors.
    queued: usize,
}

/// Creates a coordinator and its command handle.
pub fn create_sync_coordinator(
    config: &SyncConfig,
    store: Arc<ChangeLogStore>,
    applier: Arc<dyn MutationApplier>,
    monitor: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
) -> (SyncHandle, SyncCoordinator) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(SyncStatus::default());
    let edges = monitor.subscribe_edges();

    let handle = SyncHandle {
        command_tx,
        status_rx,
    };

    let coordinator = SyncCoordinator {
        store,
        applier,
        monitor,
        clock,
        backoff: config.backoff_policy(),
        max_transient_retries: config.max_transient_retries,
        periodic: config.periodic_sync(),
        command_rx,
        edges,
        status_tx,
        state: SyncState::Idle,
        backoff_attempt: 0,
        retry_at: None,
        run_report: SyncReport::default(),
        last_report: None,
        last_sync_time: None,
        waiters: Vec::new(),
        unsettled: None,
        queued: 0,
    };

    (handle, coordinator)
}

impl SyncCoordinator {
    /// Runs the coordinator loop until shutdown or until every handle is dropped.
    pub async fn run(&mut self) {
        info!("sync coordinator started");

        let mut timer = self.periodic.map(|period| {
            // Skip the immediate first tick
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let mut edges_open = true;

        if self.monitor.is_online() && self.queued_count() > 0 {
            self.transition(SyncInput::Trigger(TriggerSource::Startup));
        }

        loop {
            if self.state == SyncState::Draining {
                // Commands are only looked at between steps.
                while let Ok(command) = self.command_rx.try_recv() {
                    if self.handle_command(command).is_break() {
                        return self.stop();
                    }
                }
                self.step().await;
                continue;
            }

            let retry_at = self.retry_at;
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!("all sync handles dropped");
                        break;
                    }
                },
                edge = self.edges.recv(), if edges_open => match edge {
                    Ok(ReachableEdge) | Err(RecvError::Lagged(_)) => {
                        debug!("reachable edge");
                        self.transition(SyncInput::Trigger(TriggerSource::ReachableEdge));
                    }
                    Err(RecvError::Closed) => edges_open = false,
                },
                _ = next_tick(&mut timer) => {
                    if self.state == SyncState::Idle
                        && self.monitor.is_online()
                        && self.queued_count() > 0
                    {
                        self.transition(SyncInput::Trigger(TriggerSource::Timer));
                    }
                }
                _ = sleep_until(retry_at) => {
                    self.retry_at = None;
                    let online = self.monitor.is_online();
                    debug!(online, "backoff elapsed");
                    self.transition(SyncInput::RetryDue { online });
                }
            }
        }

        self.stop();
    }

    fn stop(&mut self) {
        // Dropping the waiters tells them the coordinator is gone.
        self.waiters.clear();
        info!("sync coordinator stopped");
    }

    fn handle_command(&mut self, command: SyncCommand) -> ControlFlow<()> {
        match command {
            SyncCommand::SyncNow { reply } => match self.state {
                SyncState::Idle => {
                    self.waiters.push(reply);
                    self.transition(SyncInput::Trigger(TriggerSource::Manual));
                }
                SyncState::Draining => self.waiters.push(reply),
                SyncState::Backoff => {
                    let remaining = self.queued_count();
                    let report = self.last_report.unwrap_or(SyncReport {
                        remaining,
                        halted: true,
                        ..SyncReport::default()
                    });
                    let _ = reply.send(report);
                }
            },
            SyncCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn transition(&mut self, input: SyncInput) {
        let from = self.state;
        let to = from.on(input);
        if from == to {
            return;
        }
        debug!(%from, %to, ?input, "sync state transition");
        self.state = to;

        let finished = match to {
            SyncState::Draining => {
                self.retry_at = None;
                self.run_report = SyncReport::default();
                if let SyncInput::Trigger(source) = input {
                    info!(?source, pending = self.queued_count(), "sync started");
                }
                None
            }
            SyncState::Idle => {
                self.retry_at = None;
                (from == SyncState::Draining).then(|| self.finish_run(false))
            }
            SyncState::Backoff => {
                let delay = self.backoff.delay(self.backoff_attempt);
                self.backoff_attempt = self.backoff_attempt.saturating_add(1);
                self.retry_at = Some(Instant::now() + delay);
                warn!(
                    attempt = self.backoff_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "sync halted, backing off"
                );
                Some(self.finish_run(true))
            }
        };
        self.publish();

        // Waiters are answered after the status they can observe is out.
        if let Some(report) = finished {
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(report);
            }
        }
    }

    fn finish_run(&mut self, halted: bool) -> SyncReport {
        let report = SyncReport {
            remaining: self.queued_count(),
            halted,
            ..self.run_report
        };
        if !halted {
            self.last_sync_time = Some(self.clock.now());
            self.backoff_attempt = 0;
            info!(
                confirmed = report.confirmed,
                rejected = report.rejected,
                "sync complete"
            );
        }
        self.last_report = Some(report);
        report
    }

    fn publish(&self) {
        self.status_tx.send_replace(SyncStatus {
            state: self.state,
            last_sync_time: self.last_sync_time,
            last_report: self.last_report,
        });
    }

    fn queued_count(&mut self) -> usize {
        match self.store.unsettled_count() {
            Ok(n) => self.queued = n,
            Err(e) => error!("failed to read change log, keeping count {}: {e}", self.queued),
        }
        self.queued
    }

    /// Applies the oldest unsettled change.
    async fn step(&mut self) {
        let change = match self.store.next_unsettled() {
            Ok(Some(change)) => change,
            Ok(None) => return self.transition(SyncInput::Drained),
            Err(e) => {
                error!("failed to read change log: {e}");
                return self.transition(SyncInput::Halted);
            }
        };

        if change.status == ChangeStatus::InFlight {
            // Only this loop marks changes in flight: the outcome was never
            // written back. Finish that before anything behind it is sent.
            match self.unsettled.take() {
                Some((held, settlement)) if held.id == change.id => {
                    debug!("writing back outcome of {} {}", held.kind, held.target());
                    self.settle(held, settlement);
                    return;
                }
                _ => warn!("{} left in flight with no outcome, sending again", change.target()),
            }
        }
        self.unsettled = None;

        if !change.is_resolved() {
            // Its create is gone without a server id; nothing to address.
            let reason = format!("{} has no server id: its create was never confirmed", change.target());
            warn!("{reason}");
            self.settle(change, Settlement::Failed(reason));
            return;
        }

        if change.status != ChangeStatus::InFlight {
            if let Err(e) = self.store.mark_in_flight(change.id) {
                error!("failed to mark {} in flight: {e}", change.id);
                return self.transition(SyncInput::Halted);
            }
        }

        debug!("applying {} {} ({})", change.kind, change.target(), change.id);
        let settlement = match self.applier.apply(&change).await {
            ApplyOutcome::Confirmed(body) => Settlement::Confirmed(remap_for(&change, body)),
            ApplyOutcome::Rejected(detail) => {
                warn!("{} {} rejected: {detail}", change.kind, change.target());
                Settlement::Failed(detail.to_string())
            }
            ApplyOutcome::Unreachable(reason) => {
                debug!("{} unreachable: {reason}", change.target());
                Settlement::Requeue {
                    reason,
                    counted: self.monitor.is_online(),
                }
            }
        };

        let no_answer = matches!(settlement, Settlement::Requeue { .. });
        if self.settle(change, settlement) && no_answer {
            self.transition(SyncInput::Halted);
        }
    }

    /// Writes an outcome back to the log. If the write fails the outcome is
    /// held for the next step and the run halts. Returns true once written.
    fn settle(&mut self, change: PendingChange, settlement: Settlement) -> bool {
        let written = match &settlement {
            Settlement::Confirmed(remap) => self.on_confirmed(&change, remap.clone()),
            Settlement::Requeue { reason, counted } => self.on_unreachable(&change, reason, *counted),
            Settlement::Failed(reason) => self.record_failure(&change, reason.clone()),
        };
        match written {
            Ok(()) => true,
            Err(e) => {
                error!("failed to record outcome of {}: {e}", change.id);
                self.unsettled = Some((change, settlement));
                self.transition(SyncInput::Halted);
                false
            }
        }
    }

    fn on_confirmed(
        &mut self,
        change: &PendingChange,
        remap: Option<(LocalRef, String)>,
    ) -> StorageResult<()> {
        let remapped = self.store.complete(change.id, remap)?;
        if remapped > 0 {
            debug!("remapped {remapped} changes waiting on {}", change.target());
        }
        self.run_report.confirmed += 1;
        self.backoff_attempt = 0;
        Ok(())
    }

    fn on_unreachable(
        &mut self,
        change: &PendingChange,
        reason: &str,
        counted: bool,
    ) -> StorageResult<()> {
        if !counted {
            // Offline: the server never had a chance to answer.
            return self.store.release(change.id, reason);
        }
        let attempts = self.store.requeue(change.id, reason)?;
        if attempts >= self.max_transient_retries {
            warn!("{} gave up after {attempts} attempts", change.target());
            self.record_failure(change, format!("gave up after {attempts} attempts: {reason}"))?;
        }
        Ok(())
    }

    /// Marks a change failed; a failed create takes its dependents with it.
    fn record_failure(&mut self, change: &PendingChange, reason: String) -> StorageResult<()> {
        self.store.mark_failed(change.id, reason)?;
        self.run_report.rejected += 1;

        if change.kind == ChangeKind::Create {
            if let Some(local_ref) = change.local_ref {
                let reason = format!("depends on failed create {}", change.id);
                match self.store.fail_dependents(local_ref, reason) {
                    Ok(0) => {}
                    Ok(n) => {
                        warn!("failed {n} changes depending on {}", change.target());
                        self.run_report.rejected += n;
                    }
                    Err(e) => error!("failed to fail dependents of {}: {e}", change.id),
                }
            }
        }
        Ok(())
    }
}

/// The local ref a confirmed create resolves, with the id the server gave it.
fn remap_for(change: &PendingChange, body: Option<serde_json::Value>) -> Option<(LocalRef, String)> {
    match (change.kind, change.local_ref) {
        (ChangeKind::Create, Some(local_ref)) => match body.as_ref().and_then(server_id) {
            Some(id) => Some((local_ref, id)),
            None => {
                warn!("create {} confirmed without a server id", change.id);
                None
            }
        },
        _ => None,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
