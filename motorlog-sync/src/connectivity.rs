//! Debounced network reachability.
//!
//! The platform layer calls [`ConnectivityMonitor::report`] with whatever it
//! currently believes. A change only takes effect once it has held for the
//! dwell time; quick flaps are swallowed. Every committed offline to online
//! transition is also published as a [`ReachableEdge`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const EDGE_CHANNEL_CAPACITY: usize = 16;

/// Published when reachability flips from false to true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachableEdge;

/// Cloneable handle to the connectivity state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    raw_tx: Arc<watch::Sender<bool>>,
    online_rx: watch::Receiver<bool>,
    edge_tx: broadcast::Sender<ReachableEdge>,
}

/// Background task committing raw reports after the dwell time.
pub struct ConnectivityDebouncer {
    raw_rx: watch::Receiver<bool>,
    online_tx: watch::Sender<bool>,
    edge_tx: broadcast::Sender<ReachableEdge>,
    dwell: Duration,
}

/// Creates a monitor starting at `initially_online` and the debouncer that
/// drives it. Spawn [`ConnectivityDebouncer::run`] on the runtime.
pub fn connectivity_monitor(
    initially_online: bool,
    dwell: Duration,
) -> (ConnectivityMonitor, ConnectivityDebouncer) {
    let (raw_tx, raw_rx) = watch::channel(initially_online);
    let (online_tx, online_rx) = watch::channel(initially_online);
    let (edge_tx, _) = broadcast::channel(EDGE_CHANNEL_CAPACITY);

    let monitor = ConnectivityMonitor {
        raw_tx: Arc::new(raw_tx),
        online_rx,
        edge_tx: edge_tx.clone(),
    };
    let debouncer = ConnectivityDebouncer {
        raw_rx,
        online_tx,
        edge_tx,
        dwell,
    };
    (monitor, debouncer)
}

impl ConnectivityMonitor {
    /// Feeds a raw reachability observation from the platform.
    pub fn report(&self, reachable: bool) {
        self.raw_tx.send_if_modified(|current| {
            if *current == reachable {
                return false;
            }
            *current = reachable;
            true
        });
    }

    /// The committed (debounced) reachability.
    pub fn is_online(&self) -> bool {
        *self.online_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online_rx.clone()
    }

    pub fn subscribe_edges(&self) -> broadcast::Receiver<ReachableEdge> {
        self.edge_tx.subscribe()
    }
}

impl ConnectivityDebouncer {
    /// Runs until every monitor handle is dropped.
    pub async fn run(mut self) {
        debug!(dwell_ms = self.dwell.as_millis() as u64, "connectivity debouncer started");

        while self.raw_rx.changed().await.is_ok() {
            loop {
                let candidate = *self.raw_rx.borrow_and_update();
                if candidate == *self.online_tx.borrow() {
                    break;
                }

                tokio::select! {
                    changed = self.raw_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        // Raw state moved again; restart the dwell.
                    }
                    _ = tokio::time::sleep(self.dwell) => {
                        self.commit(candidate);
                        break;
                    }
                }
            }
        }

        debug!("connectivity debouncer stopped");
    }

    fn commit(&self, online: bool) {
        self.online_tx.send_replace(online);
        if online {
            info!("network reachable");
            // No receivers is fine.
            let _ = self.edge_tx.send(ReachableEdge);
        } else {
            warn!("network unreachable");
        }
    }
}
