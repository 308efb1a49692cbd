//! Synchronizer configuration.

use crate::backoff::BackoffPolicy;
use crate::error::{SyncError, SyncResult};
use motorlog_storage::CoalescePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the offline mutation synchronizer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL for the Motorlog REST API (e.g., "https://api.motorlog.app").
    pub api_base_url: String,

    /// Per-request timeout. A request that times out counts as unreachable.
    pub request_timeout_ms: u64,

    /// How long a reachability change must hold before it is believed.
    pub connectivity_dwell_ms: u64,

    /// First backoff delay after an unreachable attempt.
    pub backoff_base_ms: u64,

    /// Upper bound for the backoff delay.
    pub backoff_ceiling_secs: u64,

    /// Consecutive unreachable attempts after which a change is marked failed.
    pub max_transient_retries: u32,

    /// Interval of the background drain while online with pending work.
    /// `None` disables it.
    pub periodic_sync_secs: Option<u64>,

    /// Response statuses meaning "no answer from the origin" rather than a refusal.
    pub transient_statuses: Vec<u16>,

    /// How new changes merge into queued ones.
    pub coalesce: CoalescePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.motorlog.app".to_string(),
            request_timeout_ms: 30_000,
            connectivity_dwell_ms: 1_500,
            backoff_base_ms: 1_000,
            backoff_ceiling_secs: 60,
            max_transient_retries: 10,
            periodic_sync_secs: Some(60),
            transient_statuses: vec![408, 429, 502, 503, 504],
            coalesce: CoalescePolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connectivity_dwell(&self) -> Duration {
        Duration::from_millis(self.connectivity_dwell_ms)
    }

    pub fn periodic_sync(&self) -> Option<Duration> {
        self.periodic_sync_secs.map(Duration::from_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(self.backoff_ceiling_secs),
        )
    }

    /// Rejects settings the synchronizer cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(SyncError::Config("api_base_url is empty".into()));
        }
        if self.backoff_base_ms == 0 {
            return Err(SyncError::Config("backoff_base_ms must be positive".into()));
        }
        if Duration::from_secs(self.backoff_ceiling_secs) < Duration::from_millis(self.backoff_base_ms) {
            return Err(SyncError::Config(
                "backoff_ceiling_secs is below backoff_base_ms".into(),
            ));
        }
        if self.periodic_sync_secs == Some(0) {
            return Err(SyncError::Config("periodic_sync_secs must be positive".into()));
        }
        Ok(())
    }
}
