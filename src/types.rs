//! Shared value types.

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// The all-zero id. Used as the dimension of a metric's total and as the
/// "no dimension" marker.
pub const ZERO_ID: Uuid = Uuid::nil();

/// Current wall-clock time in Unix milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The entity a metric or count is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntityRef {
    /// Entity id
    pub id: Uuid,
    /// Id of the entity's type
    pub type_id: Uuid,
}

impl EntityRef {
    pub fn new(id: Uuid, type_id: Uuid) -> Self {
        Self { id, type_id }
    }
}
