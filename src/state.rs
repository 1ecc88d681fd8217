//! Process-wide engine state: the current database handle, the
//! generation counter that invalidates stale handles after a switch,
//! and the in-flight operation guard that refuses a switch mid-request
//!.
//!
//! Also hosts [`run_with_timeout`], the soft-terminate/hard-kill
//! contract every external worker call (OCR, VLM, embedding) must be
//! wrapped in, and [`MaintenanceTask`], the background FTS-staleness
//! sweep.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::open_database;
use crate::error::{EngineError, ErrorCategory};
use crate::search::index_status;

/// An opened database plus the path it was opened from. `Connection`
/// is `!Sync`, so concurrent callers serialize on the inner mutex —
/// every statement in this crate is cheap relative to the lock's hold
/// time, so a single-connection-per-store design is the right tradeoff.
pub struct Database {
    pub path: PathBuf,
    pub conn: Mutex<Connection>,
}

impl Database {
    fn open(path: PathBuf) -> Result<Self, EngineError> {
        let conn = open_database(&path)?;
        Ok(Database { path, conn: Mutex::new(conn) })
    }
}

/// Process-wide selection state. One instance is shared (via `Arc`)
/// across every request handler in the process.
pub struct EngineState {
    current: RwLock<Option<Arc<Database>>>,
    generation: AtomicU64,
    in_flight: AtomicI64,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineState {
    pub fn new() -> Self {
        EngineState {
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
        }
    }

    /// The currently-selected database, if any.
    pub async fn current_database(&self) -> Option<Arc<Database>> {
        self.current.read().await.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Number of operations currently in flight. Never negative.
    pub fn in_flight_count(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Begin an operation against the current database: atomically bumps
    /// the in-flight counter and captures the generation at this moment.
    /// The returned guard decrements the counter on drop, so an early `?`
    /// return can never leak it.
    pub fn begin_operation(&self) -> OperationGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        OperationGuard {
            state: self,
            generation: self.generation(),
        }
    }

    /// Decrement the in-flight counter directly, clamped at zero. Exposed
    /// for callers that manage the begin/end pair by hand instead of
    /// through [`OperationGuard`]. Calling this without a matching
    /// `begin_operation` leaves the counter at 0, never negative.
    pub fn end_operation(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v - 1).max(0)));
    }

    /// Re-validate a captured generation against the current one. A
    /// mismatch means the database was swapped out from under a
    /// long-running operation since it began; the caller must fail fast
    /// rather than keep using its (possibly closed) handle.
    pub fn validate_generation(&self, captured: u64) -> Result<(), EngineError> {
        let current = self.generation();
        if captured != current {
            return Err(EngineError::new(
                ErrorCategory::DatabaseNotSelected,
                "the selected database was swapped underneath this operation; \
                 its captured generation is stale, retry from the beginning",
            ));
        }
        Ok(())
    }

    /// Open `path` and atomically swap it in as the current database.
    /// Refuses while any operation is in flight. The new handle is
    /// opened *before* the swap, so there is never an observable window
    /// where `current_database` is null for a caller racing the switch.
    pub async fn select_database(&self, path: PathBuf) -> Result<(), EngineError> {
        self.refuse_if_busy("select_database")?;
        let db = Arc::new(Database::open(path)?);
        {
            let mut guard = self.current.write().await;
            *guard = Some(db);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Clear the current database selection. Same in-flight refusal as
    /// [`select_database`].
    pub async fn clear_database(&self) -> Result<(), EngineError> {
        self.refuse_if_busy("clear_database")?;
        {
            let mut guard = self.current.write().await;
            *guard = None;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn refuse_if_busy(&self, op: &str) -> Result<(), EngineError> {
        let in_flight = self.in_flight_count();
        if in_flight > 0 {
            return Err(EngineError::new(
                ErrorCategory::ValidationError,
                format!("cannot {op}: {in_flight} operation(s) are in-flight against the current database"),
            ));
        }
        Ok(())
    }
}

/// RAII guard returned by [`EngineState::begin_operation`]. Holds the
/// generation captured at the start of the operation so resumption
/// points can re-validate it with [`OperationGuard::validate`].
pub struct OperationGuard<'a> {
    state: &'a EngineState,
    generation: u64,
}

impl OperationGuard<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Re-check this operation's captured generation against the engine's
    /// current one. Call at every resumption point in a long-running
    /// operation (after an `.await`, after a sub-process call returns).
    pub fn validate(&self) -> Result<(), EngineError> {
        self.state.validate_generation(self.generation)
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.state.end_operation();
    }
}

// ── Sub-process worker cancellation contract ──────────────────

/// Outcome of a timed-out or completed external worker invocation.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub status: std::process::ExitStatus,
    /// Captured stderr, truncated to [`STDERR_CAPTURE_BYTES`].
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Bound on how much stderr is retained for diagnostics.
const STDERR_CAPTURE_BYTES: usize = 10 * 1024;

/// Grace period between the soft terminate signal and the hard kill
///.
const HARD_KILL_GRACE: Duration = Duration::from_secs(5);

/// Run an already-spawned child process under `overall_timeout`. On
/// expiry, sends a soft terminate signal, waits up to [`HARD_KILL_GRACE`],
/// then force-kills if the process is still alive. stderr is drained in
/// the background and capped at [`STDERR_CAPTURE_BYTES`] regardless of
/// which path is taken — no uncancellable infinite wait is permitted.
///
/// This is the OCR/VLM/embedding worker bridge's timeout contract; this
/// crate never spawns such a worker itself (that's an external
/// collaborator), but every caller that does must route the call
/// through this function.
pub async fn run_with_timeout(
    mut child: tokio::process::Child,
    overall_timeout: Duration,
) -> Result<WorkerOutcome, EngineError> {
    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = vec![0u8; STDERR_CAPTURE_BYTES];
            let mut filled = 0usize;
            while filled < buf.len() {
                match stderr.read(&mut buf[filled..]).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => filled += n,
                }
            }
            buf.truncate(filled);
            buf
        })
    });

    match timeout(overall_timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(WorkerOutcome {
            status,
            stderr: collect_stderr(stderr_task).await,
            timed_out: false,
        }),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            warn!(timeout_secs = overall_timeout.as_secs(), "worker timed out, sending soft terminate");
            soft_terminate(&mut child);
            let status = match timeout(HARD_KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => status,
                _ => {
                    warn!("worker did not exit within grace period, sending hard kill");
                    let _ = child.start_kill();
                    child.wait().await?
                }
            };
            Ok(WorkerOutcome {
                status,
                stderr: collect_stderr(stderr_task).await,
                timed_out: true,
            })
        }
    }
}

async fn collect_stderr(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match task {
        Some(t) => t.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

#[cfg(unix)]
fn soft_terminate(child: &mut tokio::process::Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(id) = child.id() {
        let _ = kill(Pid::from_raw(id as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn soft_terminate(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}

/// Build a child whose stdout/stderr are piped, the shape
/// [`run_with_timeout`] expects. Pure convenience so callers don't each
/// re-derive the `Stdio` wiring.
pub fn worker_command(program: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd
}

// ── Background FTS-staleness sweep ────────────────────────────────────────

const STALENESS_SWEEP_INTERVAL_SECS: u64 = 3_600;

/// Periodic task that reports (but does not repair) FTS index staleness
/// for the currently-selected database. It never reaches into
/// `current_database` directly — it goes through the same
/// `begin_operation`/`end_operation` contract as any other caller.
pub struct MaintenanceTask;

impl MaintenanceTask {
    /// Spawn the sweep. Cancelled via `shutdown`, using a
    /// `CancellationToken`-gated loop.
    pub fn spawn(state: Arc<EngineState>, shutdown: CancellationToken) {
        tokio::spawn(Self::run(state, shutdown));
    }

    async fn run(state: Arc<EngineState>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(STALENESS_SWEEP_INTERVAL_SECS));
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("maintenance sweep stopping");
                    break;
                }
                _ = interval.tick() => {
                    Self::sweep_once(&state).await;
                }
            }
        }
    }

    async fn sweep_once(state: &EngineState) {
        let guard = state.begin_operation();
        let Some(db) = state.current_database().await else {
            return;
        };
        if guard.validate().is_err() {
            return;
        }
        let conn = match db.conn.lock() {
            Ok(c) => c,
            Err(_) => return,
        };
        match index_status::status_all(&conn) {
            Ok(reports) => {
                for report in reports.iter().filter(|r| r.is_stale) {
                    warn!(
                        index = ?report.kind,
                        base_count = report.base_count,
                        fts_count = report.fts_count,
                        "maintenance sweep: FTS index is stale"
                    );
                }
                debug!(indexes = reports.len(), "maintenance sweep: checked FTS staleness");
            }
            Err(e) => warn!(error = %e, "maintenance sweep: status check failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn select_database_bumps_generation_and_sets_current() {
        let state = EngineState::new();
        assert!(state.current_database().await.is_none());
        let gen0 = state.generation();

        let dir = tempfile::tempdir().unwrap();
        state.select_database(dir.path().join("a.db")).await.unwrap();

        assert!(state.current_database().await.is_some());
        assert!(state.generation() > gen0);
    }

    #[tokio::test]
    async fn select_database_refuses_while_operation_in_flight() {
        let state = EngineState::new();
        let dir = tempfile::tempdir().unwrap();
        state.select_database(dir.path().join("a.db")).await.unwrap();

        let guard = state.begin_operation();
        let err = state.select_database(dir.path().join("b.db")).await.unwrap_err();
        assert!(err.message.contains("operation(s) are in-flight"));

        drop(guard);
        state.select_database(dir.path().join("b.db")).await.unwrap();
    }

    #[tokio::test]
    async fn end_operation_without_begin_never_goes_negative() {
        let state = EngineState::new();
        state.end_operation();
        state.end_operation();
        assert_eq!(state.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn generation_captured_before_switch_fails_validation_after() {
        let state = EngineState::new();
        let dir = tempfile::tempdir().unwrap();
        state.select_database(dir.path().join("a.db")).await.unwrap();

        let guard = state.begin_operation();
        drop(guard);
        let guard = state.begin_operation();
        let captured = guard.generation();
        drop(guard);

        state.select_database(dir.path().join("b.db")).await.unwrap();

        assert!(state.validate_generation(captured).is_err());
    }

    #[tokio::test]
    async fn operation_guard_drop_decrements_counter_on_early_return() {
        let state = EngineState::new();

        async fn fallible(state: &EngineState) -> Result<(), ()> {
            let _guard = state.begin_operation();
            Err(())
        }

        let _ = fallible(&state).await;
        assert_eq!(state.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn clear_database_refuses_while_busy_and_succeeds_after() {
        let state = EngineState::new();
        let dir = tempfile::tempdir().unwrap();
        state.select_database(dir.path().join("a.db")).await.unwrap();

        let guard = state.begin_operation();
        assert!(state.clear_database().await.is_err());
        drop(guard);

        state.clear_database().await.unwrap();
        assert!(state.current_database().await.is_none());
    }
}
