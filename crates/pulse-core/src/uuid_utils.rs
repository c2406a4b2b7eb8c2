//! UUID v7 utilities for time-ordered job identifiers.
//!
//! Job ids are UUIDv7 (RFC 9562): the first 48 bits embed a millisecond
//! Unix timestamp, so ids sort by creation time and index locality on the
//! `job_queue` primary key stays good under insert-heavy load.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use pulse_core::uuid_utils::new_v7;
///
/// let a = new_v7();
/// let b = new_v7();
/// // IDs generated later are lexicographically greater (or equal within
/// // the same millisecond).
/// assert!(a <= b);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
