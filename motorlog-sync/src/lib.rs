//! Offline-first mutation synchronizer for the Motorlog mobile client.
//!
//! Screens record creates, updates and deletes through [`SyncContext`]. While
//! offline (or when a request gets no answer) the mutation lands in the
//! durable change log; the coordinator drains it once the network is back:
//! - Connectivity monitor with debounced reachability and a reachable edge
//! - Mutation applier classifying each call as confirmed, rejected or unreachable
//! - Coordinator state machine (idle, draining, backoff) with local-ref remapping
//! - Facade exposing `is_online`, `pending_changes`, `sync_now` and friends

pub mod api_client;
pub mod backoff;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod state;

pub use api_client::{
    ApplyOutcome, HttpMutationApplier, MutationApplier, RejectionDetail, StaticToken, TokenProvider,
};
pub use backoff::BackoffPolicy;
pub use config::SyncConfig;
pub use connectivity::{ConnectivityDebouncer, ConnectivityMonitor, ReachableEdge, connectivity_monitor};
pub use context::{Performed, SyncContext};
pub use coordinator::{SyncCoordinator, SyncHandle, SyncReport, SyncStatus, create_sync_coordinator};
pub use error::{SyncError, SyncResult};
pub use state::{SyncInput, SyncState, TriggerSource};
