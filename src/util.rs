//! Small cross-cutting helpers: ID generation and timestamp formatting.
//!
//! IDs use `Uuid::now_v7()` for roughly time-ordered primary keys, and
//! timestamps are formatted at millisecond precision since the cursor
//! format needs sub-second ordering to break ties between rows created
//! in the same second.

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

/// Generate a new time-ordered opaque identifier.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// The current UTC time as millisecond-precision ISO-8601, e.g.
/// `"2025-04-01T12:00:00.123Z"`.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
