//! Id generation.

use uuid::Uuid;

/// A new id whose leading bits follow wall-clock time, so ids minted later
/// sort after earlier ones and index inserts stay append-mostly.
#[inline]
pub fn sequential_uuid() -> Uuid {
    Uuid::now_v7()
}
