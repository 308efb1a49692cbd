//! Last-fetched list pages, kept for instant rendering before the network
//! answers. The synchronizer never reads these.

use crate::error::StorageResult;
use crate::kv::KvStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Key of one cached list view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn vehicles() -> Self {
        Self("vehicles".into())
    }

    pub fn fuel(vehicle_filter: &str) -> Self {
        Self(format!("fuel_{vehicle_filter}"))
    }

    pub fn parts(vehicle_filter: &str) -> Self {
        Self(format!("parts_{vehicle_filter}"))
    }

    pub fn mot(vehicle_filter: &str) -> Self {
        Self(format!("mot_{vehicle_filter}"))
    }

    pub fn consumables(vehicle_filter: &str) -> Self {
        Self(format!("consumables_{vehicle_filter}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached page with the time it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPage {
    pub fetched_at: DateTime<Utc>,
    pub items: Value,
}

/// Read-through cache of list pages.
#[derive(Clone)]
pub struct ListCache {
    kv: KvStore,
}

impl ListCache {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub fn put(&self, key: &CacheKey, items: Value, fetched_at: DateTime<Utc>) -> StorageResult<()> {
        self.kv.put_json(key.as_str(), &CachedPage { fetched_at, items })
    }

    pub fn get(&self, key: &CacheKey) -> StorageResult<Option<CachedPage>> {
        self.kv.get_json(key.as_str())
    }

    pub fn invalidate(&self, key: &CacheKey) -> StorageResult<bool> {
        self.kv.remove(key.as_str())
    }
}
