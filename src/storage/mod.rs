//! Entity CRUD, polymorphic tags, and the cascade-delete engine.
//!
//! Every module here takes a `&Connection` or `&Transaction` (via deref
//! coercion) rather than owning one — callers decide the transaction
//! boundary, which matters most for [`cascade::delete_document`], whose
//! fourteen steps must all commit or all roll back together.

pub mod cascade;
pub mod chunks;
pub mod clusters;
pub mod cursor;
pub mod documents;
pub mod embeddings;
pub mod extractions;
pub mod images;
pub mod ocr_results;
pub mod tags;

use rusqlite::Connection;

use crate::error::EngineError;

/// Run `f` and, if it fails on a foreign-key constraint violation, rewrite
/// the generic SQLite error into a message naming `column`
/// "every foreign key insert runs through a wrapper that ... rewrites it
/// with a human-readable context string naming the violating column."
pub fn insert_with_fk_context<T>(
    column: &str,
    f: impl FnOnce() -> rusqlite::Result<T>,
) -> Result<T, EngineError> {
    f().map_err(|e| {
        if is_fk_violation(&e) {
            EngineError::validation(format!(
                "foreign key violation inserting into column '{column}': {e}"
            ))
        } else {
            EngineError::from(e)
        }
    })
}

fn is_fk_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

/// Whether `table` exists in `conn`'s schema. Used by the cascade-delete
/// engine to skip optional tables (tags, form-fills, uploaded-files)
/// instead of failing when they are absent.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, EngineError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        rusqlite::params![table],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}
