//! Coordinator state machine.
//!
//! Pure transition table; timers and I/O live in the coordinator.
//!
//! | from       | input                    | to         |
//! |------------|--------------------------|------------|
//! | `Idle`     | `Trigger(_)`             | `Draining` |
//! | `Draining` | `Drained`                | `Idle`     |
//! | `Draining` | `Halted`                 | `Backoff`  |
//! | `Backoff`  | `RetryDue { online }`    | `Draining` |
//! | `Backoff`  | `RetryDue { !online }`   | `Idle`     |
//! | `Backoff`  | `Trigger(ReachableEdge)` | `Draining` |
//!
//! Anything else leaves the state unchanged.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Draining,
    Backoff,
}

impl SyncState {
    pub fn on(self, input: SyncInput) -> SyncState {
        use SyncInput::*;
        use SyncState::*;

        match (self, input) {
            (Idle, Trigger(_)) => Draining,
            (Draining, Drained) => Idle,
            (Draining, Halted) => Backoff,
            (Backoff, RetryDue { online: true }) => Draining,
            (Backoff, RetryDue { online: false }) => Idle,
            (Backoff, Trigger(TriggerSource::ReachableEdge)) => Draining,
            (state, _) => state,
        }
    }

    /// True while a drain owns the queue, including its backoff wait.
    pub fn is_active(self) -> bool {
        self != SyncState::Idle
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Draining => write!(f, "draining"),
            SyncState::Backoff => write!(f, "backoff"),
        }
    }
}

/// What started a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    ReachableEdge,
    Manual,
    Timer,
    Startup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncInput {
    Trigger(TriggerSource),
    /// No pending change left.
    Drained,
    /// The drain stopped early: no answer from the server, or local storage failed.
    Halted,
    RetryDue { online: bool },
}
