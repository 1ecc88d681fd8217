//! Database connection lifecycle: opening, pragmas, schema migration.
//!
//! Every connection is opened with WAL mode, foreign keys enforced, and a
//! busy timeout, then run through the migration runner so a schema that
//! evolves over the engine's lifetime never needs a fresh database to
//! pick up a new version.

pub mod migrations;
pub mod schema;

use std::path::Path;

use rusqlite::Connection;

use crate::error::EngineError;

/// Default busy-timeout applied to every opened connection, in
/// milliseconds. Generous enough to ride out a concurrent writer's
/// transaction without the caller seeing `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Open a connection to `db_path`, apply the standard pragma set, and
/// bring the schema up to [`schema::CURRENT_SCHEMA_VERSION`].
pub fn open_database(db_path: &Path) -> Result<Connection, EngineError> {
    let conn = open_conn(db_path)?;
    migrations::run_migrations(&conn, db_path)?;
    Ok(conn)
}

/// Open a connection and apply the standard pragma set, without running
/// migrations. Used by the migration runner itself (which needs a
/// connection before it can safely decide whether to migrate) and by
/// tests that want to inspect a pre-migration database.
pub fn open_conn(db_path: &Path) -> Result<Connection, EngineError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_database_creates_parent_dir_and_runs_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("test.db");
        let conn = open_database(&db_path).unwrap();

        let version: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, schema::CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn reopening_an_up_to_date_database_applies_no_further_steps() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        open_database(&db_path).unwrap();
        let conn = open_database(&db_path).unwrap();

        let version: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, schema::CURRENT_SCHEMA_VERSION);
    }
}
