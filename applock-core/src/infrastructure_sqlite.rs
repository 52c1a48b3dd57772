//! SQLite-backed lock owner. Application locks are rows in a shared
//! database file, so separate processes contend for the same names.
//!
//! Enable with the `sqlite` feature flag:
//! ```toml
//! applock-core = { path = "../applock-core", features = ["sqlite"] }
//! ```
//!
//! Waiters poll the lock table; unlike the in-memory server there is no
//! arrival-order guarantee between them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::infrastructure::{AcquireReply, AppLockBackend};
use crate::types::{AcquisitionResult, LockMode, LockScope, ReleaseResult};

/// Interval between attempts while a lock is held by someone else.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a single statement may wait on SQLite's own write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A row of the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub resource: String,
    pub session_id: String,
    pub scope: LockScope,
    pub transaction_id: Option<String>,
    pub mode: LockMode,
    pub lock_count: u32,
    /// Unix milliseconds
    pub acquired_at: u64,
}

enum Attempt {
    Granted,
    Reentered,
    Deadlock,
    Busy,
}

/// Owner of a lock row within a session: the scope and, for transaction
/// locks, the transaction id.
#[derive(Clone)]
struct RowOwner {
    scope: LockScope,
    transaction_id: Option<String>,
    // Set once the owning transaction commits or rolls back
    completed: Option<Arc<AtomicBool>>,
}

impl RowOwner {
    fn session() -> Self {
        Self {
            scope: LockScope::Session,
            transaction_id: None,
            completed: None,
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection, TransportError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn try_acquire(
    conn: &mut Connection,
    name: &str,
    session_id: &str,
    owner: &RowOwner,
) -> Result<Attempt, TransportError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing: Option<(String, String, Option<String>)> = tx
        .query_row(
            "SELECT session_id, owner, transaction_id FROM app_locks WHERE resource = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let attempt = match existing {
        None => {
            tx.execute(
                "INSERT INTO app_locks (resource, session_id, owner, transaction_id, mode, lock_count, acquired_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                params![
                    name,
                    session_id,
                    owner.scope.owner_name(),
                    owner.transaction_id,
                    LockMode::Exclusive.name(),
                    now_ms(),
                ],
            )?;
            Attempt::Granted
        }
        Some((holder, scope, transaction_id)) if holder == session_id => {
            if scope == owner.scope.owner_name() && transaction_id == owner.transaction_id {
                tx.execute(
                    "UPDATE app_locks SET lock_count = lock_count + 1 WHERE resource = ?1",
                    params![name],
                )?;
                Attempt::Reentered
            } else {
                Attempt::Deadlock
            }
        }
        Some(_) => Attempt::Busy,
    };

    tx.commit()?;
    Ok(attempt)
}

fn release_row(
    conn: &mut Connection,
    name: &str,
    session_id: &str,
    owner: &RowOwner,
) -> Result<i32, TransportError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let count: Option<u32> = tx
        .query_row(
            "SELECT lock_count FROM app_locks
             WHERE resource = ?1 AND session_id = ?2 AND owner = ?3 AND transaction_id IS ?4",
            params![name, session_id, owner.scope.owner_name(), owner.transaction_id],
            |row| row.get(0),
        )
        .optional()?;

    let code = match count {
        None => ReleaseResult::ParameterValidationOrOtherError.code(),
        Some(count) if count > 1 => {
            tx.execute(
                "UPDATE app_locks SET lock_count = lock_count - 1 WHERE resource = ?1",
                params![name],
            )?;
            ReleaseResult::ReleasedSuccessfully.code()
        }
        Some(_) => {
            tx.execute("DELETE FROM app_locks WHERE resource = ?1", params![name])?;
            ReleaseResult::ReleasedSuccessfully.code()
        }
    };

    tx.commit()?;
    Ok(code)
}

fn attempt_code(attempt: Attempt, waited: bool) -> Option<i32> {
    match attempt {
        Attempt::Granted | Attempt::Reentered if waited => Some(AcquisitionResult::AcquiredAfterWaiting.code()),
        Attempt::Granted | Attempt::Reentered => Some(AcquisitionResult::AcquiredImmediately.code()),
        Attempt::Deadlock => Some(AcquisitionResult::FailedDueToDeadlock.code()),
        Attempt::Busy => None,
    }
}

/// A lock database file. Open one per process and [`connect`] a session
/// per logical connection.
///
/// [`connect`]: SqliteLockStore::connect
pub struct SqliteLockStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteLockStore {
    /// Open (or create) the lock database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS app_locks (
                resource       TEXT PRIMARY KEY,
                session_id     TEXT NOT NULL,
                owner          TEXT NOT NULL,
                transaction_id TEXT,
                mode           TEXT NOT NULL DEFAULT 'Exclusive',
                lock_count     INTEGER NOT NULL,
                acquired_at    INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_app_locks_session ON app_locks(session_id);
            CREATE INDEX IF NOT EXISTS idx_app_locks_transaction ON app_locks(transaction_id);",
        )?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new session with its own connection to the lock database.
    pub fn connect(&self) -> Result<SqliteSession, TransportError> {
        let conn = open_connection(&self.path)?;
        let id = nanoid::nanoid!();
        debug!(session_id = %id, path = %self.path.display(), "sqlite lock session opened");
        Ok(SqliteSession {
            inner: Arc::new(SqliteSessionInner {
                id,
                conn: Mutex::new(conn),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Every lock currently recorded, oldest first.
    pub fn list_locks(&self) -> Result<Vec<LockInfo>, TransportError> {
        let conn = lock_conn(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT resource, session_id, owner, transaction_id, lock_count, acquired_at
             FROM app_locks ORDER BY acquired_at, resource",
        )?;

        let rows = stmt.query_map([], |row| {
            let owner: String = row.get(2)?;
            Ok(LockInfo {
                resource: row.get(0)?,
                session_id: row.get(1)?,
                scope: LockScope::from_owner_name(&owner).unwrap_or(LockScope::Session),
                transaction_id: row.get(3)?,
                mode: LockMode::Exclusive,
                lock_count: row.get(4)?,
                acquired_at: row.get(5)?,
            })
        })?;

        let mut locks = Vec::new();
        for row in rows {
            locks.push(row?);
        }
        Ok(locks)
    }

    /// Remove a lock regardless of owner, e.g. one abandoned by a crashed
    /// process. Returns whether a row was removed.
    pub fn force_release(&self, lock_name: &str) -> Result<bool, TransportError> {
        let conn = lock_conn(&self.conn);
        let rows = conn.execute("DELETE FROM app_locks WHERE resource = ?1", params![lock_name])?;
        if rows > 0 {
            warn!(lock_name, "application lock force-released");
        }
        Ok(rows > 0)
    }
}

fn lock_conn(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SqliteSessionInner {
    id: String,
    conn: Mutex<Connection>,
    closed: AtomicBool,
}

impl SqliteSessionInner {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    fn close(&self) -> Result<usize, TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let conn = lock_conn(&self.conn);
        let dropped = conn.execute("DELETE FROM app_locks WHERE session_id = ?1", params![self.id])?;
        debug!(session_id = %self.id, dropped, "sqlite lock session closed");
        Ok(dropped)
    }

    /// Fails once the session is closed or the owning transaction has
    /// completed. Callers hold the connection lock, which the close and
    /// commit sweeps also take, so no row is written for a swept owner.
    fn ensure_live(&self, owner: &RowOwner) -> Result<(), TransportError> {
        self.ensure_open()?;
        if owner.completed.as_ref().is_some_and(|c| c.load(Ordering::SeqCst)) {
            return Err(TransportError::NoActiveTransaction);
        }
        Ok(())
    }

    fn attempt(&self, name: &str, owner: &RowOwner) -> Result<Attempt, TransportError> {
        let mut conn = lock_conn(&self.conn);
        self.ensure_live(owner)?;
        try_acquire(&mut conn, name, &self.id, owner)
    }

    fn release(&self, name: &str, owner: &RowOwner) -> Result<i32, TransportError> {
        let mut conn = lock_conn(&self.conn);
        self.ensure_live(owner)?;
        release_row(&mut conn, name, &self.id, owner)
    }

    fn acquire_blocking(
        &self,
        name: &str,
        owner: &RowOwner,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
    ) -> Result<AcquireReply, TransportError> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(timeout_seconds.saturating_mul(1000));
        let command_deadline = command_timeout.map(|t| started + t);
        let mut waited = false;

        loop {
            if let Some(code) = attempt_code(self.attempt(name, owner)?, waited) {
                let wait_time = if waited { started.elapsed() } else { Duration::ZERO };
                return Ok(AcquireReply::new(code, wait_time));
            }
            waited = true;

            let now = Instant::now();
            if let Some(limit) = command_deadline {
                if now >= limit && limit <= deadline {
                    return Err(TransportError::CommandTimeout(command_timeout.unwrap_or_default()));
                }
            }
            if now >= deadline {
                return Ok(AcquireReply::immediate(AcquisitionResult::FailedDueToTimeout.code()));
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Runs connection work on the blocking pool so a statement waiting on
/// SQLite's write lock does not stall the async runtime.
async fn run_blocking<T, F>(inner: &Arc<SqliteSessionInner>, work: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteSessionInner) -> Result<T, TransportError> + Send + 'static,
{
    let inner = Arc::clone(inner);
    tokio::task::spawn_blocking(move || work(&inner))
        .await
        .map_err(|err| TransportError::Storage(format!("lock store task failed: {err}")))?
}

impl Drop for SqliteSessionInner {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(session_id = %self.id, error = %err, "failed to drop session locks on close");
        }
    }
}

/// A connection to a [`SqliteLockStore`]. Locks acquired through it are
/// session scoped and removed when the session closes.
#[derive(Clone)]
pub struct SqliteSession {
    inner: Arc<SqliteSessionInner>,
}

impl SqliteSession {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the session, removing every lock it holds.
    pub fn close(&self) -> Result<(), TransportError> {
        self.inner.close().map(|_| ())
    }

    pub fn begin_transaction(&self) -> Result<SqliteTransaction, TransportError> {
        self.inner.ensure_open()?;
        Ok(SqliteTransaction {
            inner: Arc::new(SqliteTransactionInner {
                id: nanoid::nanoid!(),
                session: self.clone(),
                completed: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    async fn acquire_async(
        &self,
        name: &str,
        owner: RowOwner,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<AcquireReply, TransportError> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(timeout_seconds.saturating_mul(1000));
        let command_deadline = command_timeout.map(|t| started + t);
        let mut waited = false;

        loop {
            if cancellation.is_some_and(|c| c.is_cancelled()) {
                return Ok(AcquireReply::immediate(AcquisitionResult::AcquisitionCancelled.code()));
            }

            let attempt = {
                let name = name.to_string();
                let owner = owner.clone();
                run_blocking(&self.inner, move |inner| inner.attempt(&name, &owner)).await?
            };
            if let Some(code) = attempt_code(attempt, waited) {
                let wait_time = if waited { started.elapsed() } else { Duration::ZERO };
                return Ok(AcquireReply::new(code, wait_time));
            }
            waited = true;

            let now = Instant::now();
            if let Some(limit) = command_deadline {
                if now >= limit && limit <= deadline {
                    return Err(TransportError::CommandTimeout(command_timeout.unwrap_or_default()));
                }
            }
            if now >= deadline {
                return Ok(AcquireReply::immediate(AcquisitionResult::FailedDueToTimeout.code()));
            }

            let pause = tokio::time::sleep(POLL_INTERVAL.min(deadline - now));
            match cancellation {
                Some(token) => {
                    tokio::select! {
                        _ = pause => {}
                        _ = token.cancelled() => {
                            return Ok(AcquireReply::immediate(AcquisitionResult::AcquisitionCancelled.code()));
                        }
                    }
                }
                None => pause.await,
            }
        }
    }

    async fn release_async(&self, name: &str, owner: RowOwner) -> Result<i32, TransportError> {
        let name = name.to_string();
        run_blocking(&self.inner, move |inner| inner.release(&name, &owner)).await
    }
}

#[async_trait]
impl AppLockBackend for SqliteSession {
    fn lock_scope(&self) -> LockScope {
        LockScope::Session
    }

    fn execute_acquire(
        &self,
        lock_name: &str,
        scope: LockScope,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
    ) -> Result<AcquireReply, TransportError> {
        if scope == LockScope::Transaction {
            return Err(TransportError::NoActiveTransaction);
        }
        self.inner
            .acquire_blocking(lock_name, &RowOwner::session(), timeout_seconds, command_timeout)
    }

    async fn execute_acquire_async(
        &self,
        lock_name: &str,
        scope: LockScope,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<AcquireReply, TransportError> {
        if scope == LockScope::Transaction {
            return Err(TransportError::NoActiveTransaction);
        }
        self.acquire_async(lock_name, RowOwner::session(), timeout_seconds, command_timeout, cancellation)
            .await
    }

    fn execute_release(&self, lock_name: &str, scope: LockScope) -> Result<i32, TransportError> {
        if scope == LockScope::Transaction {
            return Err(TransportError::NoActiveTransaction);
        }
        self.inner.release(lock_name, &RowOwner::session())
    }

    async fn execute_release_async(&self, lock_name: &str, scope: LockScope) -> Result<i32, TransportError> {
        if scope == LockScope::Transaction {
            return Err(TransportError::NoActiveTransaction);
        }
        self.release_async(lock_name, RowOwner::session()).await
    }
}

struct SqliteTransactionInner {
    id: String,
    session: SqliteSession,
    completed: Arc<AtomicBool>,
}

impl SqliteTransactionInner {
    fn complete(&self) -> Result<(), TransportError> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = lock_conn(&self.session.inner.conn);
        let dropped = conn.execute("DELETE FROM app_locks WHERE transaction_id = ?1", params![self.id])?;
        debug!(transaction_id = %self.id, dropped, "sqlite lock transaction completed");
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), TransportError> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(TransportError::NoActiveTransaction);
        }
        Ok(())
    }
}

impl Drop for SqliteTransactionInner {
    fn drop(&mut self) {
        if let Err(err) = self.complete() {
            warn!(transaction_id = %self.id, error = %err, "failed to drop transaction locks");
        }
    }
}

/// A transaction on a [`SqliteSession`]. Locks acquired through it are
/// transaction scoped and removed on commit, rollback, or drop.
#[derive(Clone)]
pub struct SqliteTransaction {
    inner: Arc<SqliteTransactionInner>,
}

impl SqliteTransaction {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn session(&self) -> &SqliteSession {
        &self.inner.session
    }

    pub fn commit(&self) -> Result<(), TransportError> {
        self.inner.complete()
    }

    pub fn rollback(&self) -> Result<(), TransportError> {
        self.inner.complete()
    }

    pub fn is_active(&self) -> bool {
        !self.inner.completed.load(Ordering::SeqCst)
    }

    fn owner_for(&self, scope: LockScope) -> Result<RowOwner, TransportError> {
        match scope {
            LockScope::Session => Ok(RowOwner::session()),
            LockScope::Transaction => {
                self.inner.ensure_active()?;
                Ok(RowOwner {
                    scope: LockScope::Transaction,
                    transaction_id: Some(self.inner.id.clone()),
                    completed: Some(Arc::clone(&self.inner.completed)),
                })
            }
        }
    }
}

#[async_trait]
impl AppLockBackend for SqliteTransaction {
    fn lock_scope(&self) -> LockScope {
        LockScope::Transaction
    }

    fn execute_acquire(
        &self,
        lock_name: &str,
        scope: LockScope,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
    ) -> Result<AcquireReply, TransportError> {
        let owner = self.owner_for(scope)?;
        self.inner
            .session
            .inner
            .acquire_blocking(lock_name, &owner, timeout_seconds, command_timeout)
    }

    async fn execute_acquire_async(
        &self,
        lock_name: &str,
        scope: LockScope,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<AcquireReply, TransportError> {
        let owner = self.owner_for(scope)?;
        self.inner
            .session
            .acquire_async(lock_name, owner, timeout_seconds, command_timeout, cancellation)
            .await
    }

    fn execute_release(&self, lock_name: &str, scope: LockScope) -> Result<i32, TransportError> {
        let owner = self.owner_for(scope)?;
        self.inner.session.inner.release(lock_name, &owner)
    }

    async fn execute_release_async(&self, lock_name: &str, scope: LockScope) -> Result<i32, TransportError> {
        let owner = self.owner_for(scope)?;
        self.inner.session.release_async(lock_name, owner).await
    }
}
