use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::types::LockScope;

/// What the lock owner reports back from an acquire call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireReply {
    /// Signed return code, passed through unchanged
    pub code: i32,
    /// Time spent waiting for a prior holder
    pub wait_time: Duration,
}

impl AcquireReply {
    pub fn new(code: i32, wait_time: Duration) -> Self {
        Self { code, wait_time }
    }

    pub fn immediate(code: i32) -> Self {
        Self::new(code, Duration::ZERO)
    }
}

/// Defines the contract for the server that actually owns application
/// locks. The handle and orchestrator never look past these calls.
///
/// Implementations are cheap to clone (a connection or transaction
/// handle) because the release callbacks capture a clone.
#[async_trait]
pub trait AppLockBackend: Send + Sync {
    /// The scope a lock acquired through this backend is owned by.
    fn lock_scope(&self) -> LockScope;

    /// Execute the acquire call, blocking until the server answers.
    fn execute_acquire(
        &self,
        lock_name: &str,
        scope: LockScope,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
    ) -> Result<AcquireReply, TransportError>;

    /// Execute the acquire call without blocking the thread while waiting.
    /// Cancellation while queued yields the cancelled result code.
    async fn execute_acquire_async(
        &self,
        lock_name: &str,
        scope: LockScope,
        timeout_seconds: u64,
        command_timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<AcquireReply, TransportError>;

    /// Execute the release call and return the server's result code.
    fn execute_release(&self, lock_name: &str, scope: LockScope) -> Result<i32, TransportError>;

    async fn execute_release_async(
        &self,
        lock_name: &str,
        scope: LockScope,
    ) -> Result<i32, TransportError>;
}
