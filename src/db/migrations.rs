//! Forward-only migration runner: version table, ordered steps, and
//! pre-migration backups with retention.
//!
//! Every step runs inside its own transaction (rollback-on-drop via
//! `rusqlite::Transaction`, never a hand-rolled `BEGIN`/`COMMIT`/`ROLLBACK`
//! string). A step that needs to rewrite a table temporarily disables
//! foreign-key enforcement through [`ForeignKeyGuard`], whose `Drop` restores
//! it even if the step returns early.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use thiserror::Error;

use crate::error::{EngineError, ErrorCategory, LiftableError};

use super::schema::{self, CURRENT_SCHEMA_VERSION};

/// How many pre-migration backups to retain per database.
const BACKUP_RETENTION: usize = 3;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("sqlite error: {0}")]
    Step(#[from] rusqlite::Error),
    #[error("io error during migration: {0}")]
    Io(#[from] std::io::Error),
    #[error("database schema version {stored} is newer than the {current} this build supports")]
    FutureSchema { stored: i64, current: i64 },
}

impl LiftableError for MigrationError {
    fn category(&self) -> Option<ErrorCategory> {
        match self {
            MigrationError::FutureSchema { .. } => Some(ErrorCategory::ConfigurationError),
            _ => None,
        }
    }
}

impl From<MigrationError> for EngineError {
    fn from(e: MigrationError) -> Self {
        EngineError::lift(e)
    }
}

type StepFn = fn(&Connection) -> Result<(), MigrationError>;

struct MigrationStep {
    from: i64,
    to: i64,
    needs_fk_rewrite: bool,
    apply: StepFn,
}

/// Ordered list of migration steps. Only `0 -> 1` (the initial schema
/// creation) exists today; future schema changes append here, each a
/// `from -> from+1` step, never reordered or removed.
static MIGRATIONS: &[MigrationStep] = &[MigrationStep {
    from: 0,
    to: 1,
    needs_fk_rewrite: false,
    apply: schema::apply_v1,
}];

/// RAII guard that disables `PRAGMA foreign_keys` for the lifetime of the
/// guard and unconditionally restores it on drop, including on panic or an
/// early `?` return. SQLite ignores this pragma inside an open transaction,
/// so it must be toggled *before* the step's transaction begins.
struct ForeignKeyGuard<'a> {
    conn: &'a Connection,
}

impl<'a> ForeignKeyGuard<'a> {
    fn disable(conn: &'a Connection) -> Result<Self, MigrationError> {
        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        Ok(Self { conn })
    }
}

impl Drop for ForeignKeyGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.execute_batch("PRAGMA foreign_keys = ON;") {
            tracing::error!(error = %e, "failed to re-enable foreign_keys after migration step");
        }
    }
}

/// Bring `conn`'s schema up to [`CURRENT_SCHEMA_VERSION`], applying each
/// pending step in order and taking a pre-migration backup before any step
/// that moves a non-fresh database (stored version > 0) forward.
pub fn run_migrations(conn: &Connection, db_path: &Path) -> Result<(), EngineError> {
    ensure_version_table(conn).map_err(EngineError::from)?;
    let mut current = read_version(conn).map_err(EngineError::from)?;

    if current == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    if current > CURRENT_SCHEMA_VERSION {
        return Err(EngineError::from(MigrationError::FutureSchema {
            stored: current,
            current: CURRENT_SCHEMA_VERSION,
        }));
    }

    for step in MIGRATIONS.iter().filter(|s| s.from >= current) {
        if CURRENT_SCHEMA_VERSION > current && current > 0 {
            backup_before_migration(db_path, current).map_err(EngineError::from)?;
        }
        run_step(conn, step).map_err(EngineError::from)?;
        current = step.to;
        prune_backups(db_path, BACKUP_RETENTION).map_err(EngineError::from)?;
    }

    Ok(())
}

fn run_step(conn: &Connection, step: &MigrationStep) -> Result<(), MigrationError> {
    let _fk_guard = if step.needs_fk_rewrite {
        Some(ForeignKeyGuard::disable(conn)?)
    } else {
        None
    };

    // `unchecked_transaction` rather than `Connection::transaction` because
    // the caller only hands us a shared `&Connection` (the migration runner
    // is invoked from `open_database` before any other handle exists, so
    // there is nothing else that could be concurrently using it).
    let tx = conn.unchecked_transaction()?;
    (step.apply)(&tx)?;
    tx.execute("UPDATE schema_version SET version = ?1", params![step.to])?;
    tx.commit()?;
    Ok(())
}

fn ensure_version_table(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))?;
    if count == 0 {
        conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
    }
    Ok(())
}

fn read_version(conn: &Connection) -> Result<i64, MigrationError> {
    Ok(conn.query_row("SELECT version FROM schema_version", [], |r| r.get(0))?)
}

/// Checkpoint the WAL in truncate mode, then copy the main data file and any
/// existing `-wal`/`-shm` sidecars to `<db>.pre-migrate-v<old_version>`
/// (and the matching sidecar suffix). A pre-existing backup for the same
/// version is never overwritten.
fn backup_before_migration(db_path: &Path, old_version: i64) -> Result<(), MigrationError> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
    drop(conn);

    let suffix = format!(".pre-migrate-v{old_version}");
    let main_backup = append_suffix(db_path, &suffix);
    if main_backup.exists() {
        return Ok(());
    }
    std::fs::copy(db_path, &main_backup)?;

    for sidecar in sidecar_paths(db_path) {
        if sidecar.exists() {
            std::fs::copy(&sidecar, append_suffix(&sidecar, &suffix))?;
        }
    }
    Ok(())
}

/// Keep only the `keep` highest-numbered `.pre-migrate-v<N>` backups for
/// `db_path`, removing older ones and their sidecars.
fn prune_backups(db_path: &Path, keep: usize) -> Result<(), MigrationError> {
    let parent = db_path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = db_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let prefix = format!("{file_name}.pre-migrate-v");

    let mut versions: Vec<i64> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(parent) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(v) = name.strip_prefix(&prefix) {
                if let Ok(n) = v.parse::<i64>() {
                    versions.push(n);
                }
            }
        }
    }
    versions.sort_unstable();
    versions.dedup();

    if versions.len() <= keep {
        return Ok(());
    }

    for v in &versions[..versions.len() - keep] {
        let _ = std::fs::remove_file(parent.join(format!("{file_name}.pre-migrate-v{v}")));
        for side_suffix in ["-wal", "-shm"] {
            let _ = std::fs::remove_file(
                parent.join(format!("{file_name}{side_suffix}.pre-migrate-v{v}")),
            );
        }
    }
    Ok(())
}

fn sidecar_paths(db_path: &Path) -> [PathBuf; 2] {
    [append_suffix(db_path, "-wal"), append_suffix(db_path, "-shm")]
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}
