use crate::entity::EntityType;
use crate::id::{ChangeId, LocalRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of mutation a pending change carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "create"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// Sync bookkeeping state of a pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeStatus {
    /// Waiting to be sent.
    Pending,
    /// Handed to the applier; coalescing leaves it alone.
    InFlight,
    /// Terminal failure, kept for the user to retry or discard.
    Failed,
}

/// A locally recorded, not-yet-confirmed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub id: ChangeId,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub entity_type: EntityType,
    /// Server-assigned id. Absent for a create until it is confirmed, and for
    /// changes against an entity whose create has not been confirmed yet.
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub local_ref: Option<LocalRef>,
    #[serde(default)]
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub status: ChangeStatus,
}

impl PendingChange {
    /// Returns true if both changes address the same record, either by server
    /// id or by local ref.
    pub fn same_entity(&self, other: &PendingChange) -> bool {
        if self.entity_type != other.entity_type {
            return false;
        }
        match (&self.entity_id, &other.entity_id) {
            (Some(a), Some(b)) if a == b => return true,
            _ => {}
        }
        matches!((self.local_ref, other.local_ref), (Some(a), Some(b)) if a == b)
    }

    /// A change is resolved when the request it maps to can be built: creates
    /// always, updates and deletes once they know the server id.
    pub fn is_resolved(&self) -> bool {
        self.kind == ChangeKind::Create || self.entity_id.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.status == ChangeStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.status == ChangeStatus::Failed
    }

    /// Human-readable target, e.g. `part#42` or `part#local:…`.
    pub fn target(&self) -> String {
        match (&self.entity_id, &self.local_ref) {
            (Some(id), _) => format!("{}#{id}", self.entity_type),
            (None, Some(local)) => format!("{}#{local}", self.entity_type),
            (None, None) => self.entity_type.to_string(),
        }
    }
}

/// A mutation as handed over by a screen; the store turns it into a
/// [`PendingChange`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub kind: ChangeKind,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub local_ref: Option<LocalRef>,
    pub data: Option<Value>,
    pub id: Option<ChangeId>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewChange {
    /// A create with a freshly generated local ref.
    pub fn create(entity_type: EntityType, data: Value) -> Self {
        Self {
            kind: ChangeKind::Create,
            entity_type,
            entity_id: None,
            local_ref: Some(LocalRef::new()),
            data: Some(data),
            id: None,
            created_at: None,
        }
    }

    pub fn update(entity_type: EntityType, entity_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            entity_type,
            entity_id: Some(entity_id.into()),
            local_ref: None,
            data: Some(data),
            id: None,
            created_at: None,
        }
    }

    /// An update against an entity whose create is still queued.
    pub fn update_local(entity_type: EntityType, local_ref: LocalRef, data: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            entity_type,
            entity_id: None,
            local_ref: Some(local_ref),
            data: Some(data),
            id: None,
            created_at: None,
        }
    }

    pub fn delete(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            entity_type,
            entity_id: Some(entity_id.into()),
            local_ref: None,
            data: None,
            id: None,
            created_at: None,
        }
    }

    pub fn delete_local(entity_type: EntityType, local_ref: LocalRef) -> Self {
        Self {
            kind: ChangeKind::Delete,
            entity_type,
            entity_id: None,
            local_ref: Some(local_ref),
            data: None,
            id: None,
            created_at: None,
        }
    }

    pub fn with_id(mut self, id: ChangeId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Checks the shape rules for each kind. Returns the reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        match self.kind {
            ChangeKind::Create => {
                if self.entity_id.is_some() {
                    return Err("create must not carry a server id".into());
                }
                if self.data.is_none() {
                    return Err("create requires a payload".into());
                }
            }
            ChangeKind::Update => {
                if self.entity_id.is_none() && self.local_ref.is_none() {
                    return Err("update requires an entity id or local ref".into());
                }
                if self.data.is_none() {
                    return Err("update requires a payload".into());
                }
            }
            ChangeKind::Delete => {
                if self.entity_id.is_none() && self.local_ref.is_none() {
                    return Err("delete requires an entity id or local ref".into());
                }
                if self.data.is_some() {
                    return Err("delete must not carry a payload".into());
                }
            }
        }
        Ok(())
    }

    /// Builds the stored record, filling in id, timestamp and a local ref for
    /// creates that arrived without one.
    pub fn into_pending(self, now: DateTime<Utc>) -> PendingChange {
        let local_ref = match (self.kind, self.local_ref) {
            (ChangeKind::Create, None) => Some(LocalRef::new()),
            (_, local_ref) => local_ref,
        };
        PendingChange {
            id: self.id.unwrap_or_default(),
            kind: self.kind,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            local_ref,
            data: self.data,
            created_at: self.created_at.unwrap_or(now),
            retry_count: 0,
            last_error: None,
            status: ChangeStatus::Pending,
        }
    }
}
