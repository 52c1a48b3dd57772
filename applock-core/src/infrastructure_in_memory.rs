//! Process-local lock owner with application-lock semantics: named
//! exclusive locks owned by a session or by one of its transactions,
//! re-entrant per owner, granted to waiters in arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::infrastructure::{AcquireReply, AppLockBackend};
use crate::types::{AcquisitionResult, LockScope, ReleaseResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Owner {
    Session,
    Transaction(String),
}

#[derive(Debug)]
struct HeldLock {
    session_id: String,
    owner: Owner,
    count: u32,
}

enum Attempt {
    Granted,
    Reentered,
    Deadlock,
    Busy,
}

#[derive(Default)]
struct ServerState {
    // Lock name -> current holder
    locks: HashMap<String, HeldLock>,
    // Lock name -> queued waiter tickets, oldest first
    queues: HashMap<String, VecDeque<u64>>,
    next_ticket: u64,
}

impl ServerState {
    fn try_grant(&mut self, name: &str, session_id: &str, owner: &Owner, ticket: Option<u64>) -> Attempt {
        if let Some(held) = self.locks.get_mut(name) {
            if held.session_id != session_id {
                return Attempt::Busy;
            }
            if held.owner != *owner {
                // The session would wait on itself forever.
                return Attempt::Deadlock;
            }
            held.count += 1;
            return Attempt::Reentered;
        }

        let first_in_line = match self.queues.get(name).and_then(|q| q.front()) {
            None => true,
            Some(front) => Some(*front) == ticket,
        };
        if !first_in_line {
            return Attempt::Busy;
        }

        self.locks.insert(
            name.to_string(),
            HeldLock {
                session_id: session_id.to_string(),
                owner: owner.clone(),
                count: 1,
            },
        );
        Attempt::Granted
    }

    fn enqueue(&mut self, name: &str) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.queues.entry(name.to_string()).or_default().push_back(ticket);
        ticket
    }

    fn dequeue(&mut self, name: &str, ticket: u64) {
        if let Some(queue) = self.queues.get_mut(name) {
            queue.retain(|t| *t != ticket);
            if queue.is_empty() {
                self.queues.remove(name);
            }
        }
    }

    fn release(&mut self, name: &str, session_id: &str, owner: &Owner) -> i32 {
        match self.locks.get_mut(name) {
            Some(held) if held.session_id == session_id && held.owner == *owner => {
                held.count -= 1;
                if held.count == 0 {
                    self.locks.remove(name);
                }
                ReleaseResult::ReleasedSuccessfully.code()
            }
            _ => ReleaseResult::ParameterValidationOrOtherError.code(),
        }
    }

    /// Drops every lock matching the predicate. Returns how many were dropped.
    fn release_where(&mut self, pred: impl Fn(&HeldLock) -> bool) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, held| !pred(held));
        before - self.locks.len()
    }
}

/// The flags that end an owner's right to hold locks. Checked under the
/// state lock, which the close and commit sweeps also take, so a waiter
/// is never granted a lock after its owner has been swept.
#[derive(Clone, Copy)]
struct Liveness<'a> {
    session_closed: &'a AtomicBool,
    transaction_completed: Option<&'a AtomicBool>,
}

impl Liveness<'_> {
    fn check(&self) -> Result<(), TransportError> {
        if self.session_closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.transaction_completed.is_some_and(|c| c.load(Ordering::SeqCst)) {
            return Err(TransportError::NoActiveTransaction);
        }
        Ok(())
    }
}

struct ServerShared {
    state: Mutex<ServerState>,
    // Wakes blocking waiters
    released: Condvar,
    // Wakes async waiters
    notify: Notify,
}

impl ServerShared {
    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        // The state stays consistent across a panicking holder: every
        // mutation completes before the guard is dropped.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake_waiters(&self) {
        self.released.notify_all();
        self.notify.notify_waiters();
    }

    fn acquire_blocking(
        &self,
        name: &str,
        session_id: &str,
        owner: &Owner,
        liveness: Liveness<'_>,
        timeout: Duration,
        command_timeout: Option<Duration>,
    ) -> Result<AcquireReply, TransportError> {
        let started = Instant::now();
        let mut state = self.lock_state();
        liveness.check()?;

        match state.try_grant(name, session_id, owner, None) {
            Attempt::Granted | Attempt::Reentered => {
                return Ok(AcquireReply::immediate(AcquisitionResult::AcquiredImmediately.code()));
            }
            Attempt::Deadlock => {
                return Ok(AcquireReply::immediate(AcquisitionResult::FailedDueToDeadlock.code()));
            }
            Attempt::Busy => {}
        }

        let ticket = state.enqueue(name);
        let deadline = started + timeout;
        let command_deadline = command_timeout.map(|t| started + t);
        trace!(lock_name = name, session_id, ticket, "queued for application lock");

        loop {
            let now = Instant::now();
            if let Some(limit) = command_deadline {
                if now >= limit && limit <= deadline {
                    state.dequeue(name, ticket);
                    drop(state);
                    self.wake_waiters();
                    return Err(TransportError::CommandTimeout(command_timeout.unwrap_or_default()));
                }
            }
            if now >= deadline {
                state.dequeue(name, ticket);
                drop(state);
                self.wake_waiters();
                return Ok(AcquireReply::immediate(AcquisitionResult::FailedDueToTimeout.code()));
            }

            let until = command_deadline.map_or(deadline, |limit| limit.min(deadline));
            state = match self.released.wait_timeout(state, until - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };

            if let Err(err) = liveness.check() {
                state.dequeue(name, ticket);
                drop(state);
                self.wake_waiters();
                return Err(err);
            }

            match state.try_grant(name, session_id, owner, Some(ticket)) {
                Attempt::Granted | Attempt::Reentered => {
                    state.dequeue(name, ticket);
                    return Ok(AcquireReply::new(
                        AcquisitionResult::AcquiredAfterWaiting.code(),
                        started.elapsed(),
                    ));
                }
                Attempt::Deadlock => {
                    state.dequeue(name, ticket);
                    drop(state);
                    self.wake_waiters();
                    return Ok(AcquireReply::immediate(AcquisitionResult::FailedDueToDeadlock.code()));
                }
                Attempt::Busy => {}
            }
        }
    }

    async fn acquire_async(
        &self,
        name: &str,
        session_id: &str,
        owner: &Owner,
        liveness: Liveness<'_>,
        timeout: Duration,
        command_timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<AcquireReply, TransportError> {
        if cancellation.is_some_and(|c| c.is_cancelled()) {
            return Ok(AcquireReply::immediate(AcquisitionResult::AcquisitionCancelled.code()));
        }

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let command_deadline = command_timeout.map(|t| tokio::time::Instant::now() + t);
        let mut queued = QueuedTicket {
            shared: self,
            name,
            ticket: None,
        };

        loop {
            // Register interest before inspecting the state so a release
            // between the check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock_state();
                liveness.check()?;
                match state.try_grant(name, session_id, owner, queued.ticket) {
                    Attempt::Granted | Attempt::Reentered => {
                        return Ok(match queued.ticket.take() {
                            Some(ticket) => {
                                state.dequeue(name, ticket);
                                AcquireReply::new(
                                    AcquisitionResult::AcquiredAfterWaiting.code(),
                                    started.elapsed(),
                                )
                            }
                            None => AcquireReply::immediate(AcquisitionResult::AcquiredImmediately.code()),
                        });
                    }
                    Attempt::Deadlock => {
                        drop(state);
                        return Ok(AcquireReply::immediate(AcquisitionResult::FailedDueToDeadlock.code()));
                    }
                    Attempt::Busy => {
                        if queued.ticket.is_none() {
                            queued.ticket = Some(state.enqueue(name));
                            trace!(lock_name = name, session_id, "queued for application lock");
                        }
                    }
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(AcquireReply::immediate(AcquisitionResult::FailedDueToTimeout.code()));
                }
                _ = sleep_until_opt(command_deadline) => {
                    return Err(TransportError::CommandTimeout(command_timeout.unwrap_or_default()));
                }
                _ = cancelled(cancellation) => {
                    return Ok(AcquireReply::immediate(AcquisitionResult::AcquisitionCancelled.code()));
                }
            }
        }
    }
}

/// A waiter's place in a lock queue. Leaving the queue for any reason,
/// including the acquire future being dropped, hands the turn on.
struct QueuedTicket<'a> {
    shared: &'a ServerShared,
    name: &'a str,
    ticket: Option<u64>,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.shared.lock_state().dequeue(self.name, ticket);
            self.shared.wake_waiters();
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// A process-local application lock server.
#[derive(Clone)]
pub struct InMemoryLockServer {
    shared: Arc<ServerShared>,
}

impl InMemoryLockServer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ServerShared {
                state: Mutex::new(ServerState::default()),
                released: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Open a new session (connection) against this server.
    pub fn connect(&self) -> InMemorySession {
        let id = nanoid::nanoid!();
        debug!(session_id = %id, "in-memory session opened");
        InMemorySession {
            inner: Arc::new(SessionInner {
                id,
                shared: Arc::clone(&self.shared),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of locks currently held by anyone.
    pub fn held_lock_count(&self) -> usize {
        self.shared.lock_state().locks.len()
    }

    pub fn is_locked(&self, lock_name: &str) -> bool {
        self.shared.lock_state().locks.contains_key(lock_name)
    }
}

impl Default for InMemoryLockServer {
    fn default() -> Self {
        Self::new()
    }
}

struct SessionInner {
    id: String,
    shared: Arc<ServerShared>,
    closed: AtomicBool,
}

impl SessionInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = self.shared.lock_state().release_where(|held| held.session_id == self.id);
        // Queued requests of this session must notice the close too.
        self.shared.wake_waiters();
        debug!(session_id = %self.id, dropped, "in-memory session closed");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connection to an [`InMemoryLockServer`]. Locks acquired through it are
/// session scoped. Clones share the connection; the connection closes on
/// [`InMemorySession::close`] or when the last clone is dropped.
#[derive(Clone)]
pub struct InMemorySession {
    inner: Arc<SessionInner>,
}

impl InMemorySession {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the connection, dropping every lock it holds.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn begin_transaction(&self) -> Result<InMemoryTransaction, TransportError> {
        self.inner.ensure_open()?;
        Ok(InMemoryTransaction {
            inner: Arc::new(TransactionInner {
                id: nanoid::nanoid!(),
                session: self.clone(),
                completed: AtomicBool::new(false),
            }),
        })
    }

    fn liveness<'a>(&'a self, transaction_completed: Option<&'a AtomicBool>) -> Liveness<'a> {
        Liveness {
            session_closed: &self.inner.closed,
            transaction_completed,
        }
    }

    fn acquire_blocking(
        &self,
        lock_name: &str,
        owner: &Owner,
        transaction_completed: Option<&AtomicBool>,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
    ) -> Result<AcquireReply, TransportError> {
        self.inner.ensure_open()?;
        self.inner.shared.acquire_blocking(
            lock_name,
            &self.inner.id,
            owner,
            self.liveness(transaction_completed),
            Duration::from_millis(timeout_seconds.saturating_mul(1000)),
            command_timeout,
        )
    }

    async fn acquire_async(
        &self,
        lock_name: &str,
        owner: &Owner,
        transaction_completed: Option<&AtomicBool>,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<AcquireReply, TransportError> {
        self.inner.ensure_open()?;
        self.inner
            .shared
            .acquire_async(
                lock_name,
                &self.inner.id,
                owner,
                self.liveness(transaction_completed),
                Duration::from_millis(timeout_seconds.saturating_mul(1000)),
                command_timeout,
                cancellation,
            )
            .await
    }

    fn release(&self, lock_name: &str, owner: &Owner) -> Result<i32, TransportError> {
        self.inner.ensure_open()?;
        let code = self.inner.shared.lock_state().release(lock_name, &self.inner.id, owner);
        if code == ReleaseResult::ReleasedSuccessfully.code() {
            self.inner.shared.wake_waiters();
        }
        Ok(code)
    }
}

#[async_trait]
impl AppLockBackend for InMemorySession {
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
        match scope {
            LockScope::Session => {
                self.acquire_blocking(lock_name, &Owner::Session, None, timeout_seconds, command_timeout)
            }
            LockScope::Transaction => Err(TransportError::NoActiveTransaction),
        }
    }

    async fn execute_acquire_async(
        &self,
        lock_name: &str,
        scope: LockScope,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<AcquireReply, TransportError> {
        match scope {
            LockScope::Session => {
                self.acquire_async(
                    lock_name,
                    &Owner::Session,
                    None,
                    timeout_seconds,
                    command_timeout,
                    cancellation,
                )
                .await
            }
            LockScope::Transaction => Err(TransportError::NoActiveTransaction),
        }
    }

    fn execute_release(&self, lock_name: &str, scope: LockScope) -> Result<i32, TransportError> {
        match scope {
            LockScope::Session => self.release(lock_name, &Owner::Session),
            LockScope::Transaction => Err(TransportError::NoActiveTransaction),
        }
    }

    async fn execute_release_async(&self, lock_name: &str, scope: LockScope) -> Result<i32, TransportError> {
        self.execute_release(lock_name, scope)
    }
}

struct TransactionInner {
    id: String,
    session: InMemorySession,
    completed: AtomicBool,
}

impl TransactionInner {
    fn complete(&self) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = &self.session.inner.shared;
        let owner = Owner::Transaction(self.id.clone());
        let dropped = shared.lock_state().release_where(|held| held.owner == owner);
        shared.wake_waiters();
        debug!(transaction_id = %self.id, dropped, "in-memory transaction completed");
    }

    fn owner(&self) -> Result<Owner, TransportError> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(TransportError::NoActiveTransaction);
        }
        Ok(Owner::Transaction(self.id.clone()))
    }
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        self.complete();
    }
}

/// A transaction on an [`InMemorySession`]. Locks acquired through it are
/// transaction scoped and dropped by the server on commit, rollback, or
/// when the last clone is dropped.
#[derive(Clone)]
pub struct InMemoryTransaction {
    inner: Arc<TransactionInner>,
}

impl InMemoryTransaction {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn session(&self) -> &InMemorySession {
        &self.inner.session
    }

    pub fn is_active(&self) -> bool {
        !self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn commit(&self) {
        self.inner.complete();
    }

    pub fn rollback(&self) {
        self.inner.complete();
    }

    /// The owner for `scope`, plus the flag that ends it when it is this
    /// transaction.
    fn owner_for(&self, scope: LockScope) -> Result<(Owner, Option<&AtomicBool>), TransportError> {
        match scope {
            LockScope::Transaction => Ok((self.inner.owner()?, Some(&self.inner.completed))),
            LockScope::Session => Ok((Owner::Session, None)),
        }
    }
}

#[async_trait]
impl AppLockBackend for InMemoryTransaction {
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
        let (owner, completed) = self.owner_for(scope)?;
        self.inner
            .session
            .acquire_blocking(lock_name, &owner, completed, timeout_seconds, command_timeout)
    }

    async fn execute_acquire_async(
        &self,
        lock_name: &str,
        scope: LockScope,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<AcquireReply, TransportError> {
        let (owner, completed) = self.owner_for(scope)?;
        self.inner
            .session
            .acquire_async(lock_name, &owner, completed, timeout_seconds, command_timeout, cancellation)
            .await
    }

    fn execute_release(&self, lock_name: &str, scope: LockScope) -> Result<i32, TransportError> {
        let (owner, _) = self.owner_for(scope)?;
        self.inner.session.release(lock_name, &owner)
    }

    async fn execute_release_async(&self, lock_name: &str, scope: LockScope) -> Result<i32, TransportError> {
        self.execute_release(lock_name, scope)
    }
}
