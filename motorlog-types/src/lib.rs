//! Core types for the Motorlog offline mutation synchronizer.
//!
//! - [`PendingChange`]: a locally recorded create/update/delete awaiting transmission
//! - [`NewChange`]: what a screen hands to the synchronizer
//! - [`EntityType`]: the record kinds the backend exposes, mapped to REST resources
//! - [`Clock`]: injectable wall-clock for timestamps

mod change;
mod clock;
mod entity;
mod id;

pub use change::{ChangeKind, ChangeStatus, NewChange, PendingChange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::EntityType;
pub use id::{ChangeId, LocalRef};
