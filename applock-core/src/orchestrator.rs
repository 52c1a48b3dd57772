//! Acquisition and release orchestration: validates the request, calls the
//! lock owner, interprets its result code and hands back an [`AppLock`]
//! wired with the right release callbacks.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AppLockError, TransportError};
use crate::handle::{AppLock, ReleaseFn, ReleaseFnAsync};
use crate::infrastructure::{AcquireReply, AppLockBackend};
use crate::types::{AcquisitionResult, LockScope, ReleaseResult};
use crate::validation;

/// Per-call acquisition settings.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// How long the server may queue the request, in whole seconds (>= 1)
    pub timeout_seconds: i64,
    /// Fail with [`AppLockError::AcquisitionFailed`] instead of returning a
    /// handle that does not hold the lock
    pub throws_on_failure: bool,
    /// Upper bound for the whole remote call
    pub command_timeout: Option<Duration>,
    /// Cancels an async acquire that is still queued
    pub cancellation: Option<CancellationToken>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 1,
            throws_on_failure: true,
            command_timeout: None,
            cancellation: None,
        }
    }
}

impl AcquireOptions {
    pub fn with_timeout(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn no_throw(mut self) -> Self {
        self.throws_on_failure = false;
        self
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = Some(command_timeout);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

/// Acquire `lock_name` under `scope`, blocking for the server round trip.
pub fn acquire<B>(
    backend: &B,
    lock_name: &str,
    scope: LockScope,
    options: &AcquireOptions,
) -> Result<AppLock, AppLockError>
where
    B: AppLockBackend + Clone + 'static,
{
    validation::assert_params_valid(lock_name, options.timeout_seconds)?;

    let reply = backend.execute_acquire(
        lock_name,
        scope,
        options.timeout_seconds as u64,
        options.command_timeout,
    );

    build_lock(backend, lock_name, scope, options, reply)
}

/// Acquire `lock_name` under `scope` without blocking the thread.
pub async fn acquire_async<B>(
    backend: &B,
    lock_name: &str,
    scope: LockScope,
    options: &AcquireOptions,
) -> Result<AppLock, AppLockError>
where
    B: AppLockBackend + Clone + 'static,
{
    validation::assert_params_valid(lock_name, options.timeout_seconds)?;

    let reply = backend
        .execute_acquire_async(
            lock_name,
            scope,
            options.timeout_seconds as u64,
            options.command_timeout,
            options.cancellation.as_ref(),
        )
        .await;

    build_lock(backend, lock_name, scope, options, reply)
}

fn build_lock<B>(
    backend: &B,
    lock_name: &str,
    scope: LockScope,
    options: &AcquireOptions,
    reply: Result<AcquireReply, TransportError>,
) -> Result<AppLock, AppLockError>
where
    B: AppLockBackend + Clone + 'static,
{
    let (result, wait_time) = match reply {
        Ok(reply) => (AcquisitionResult::from_code(reply.code), reply.wait_time),
        Err(err) => {
            warn!(lock_name, %scope, error = %err, "application lock acquisition call failed");
            if options.throws_on_failure {
                return Err(AppLockError::AcquisitionFailed {
                    result: AcquisitionResult::ValidationOrOtherError,
                    source: Some(err),
                });
            }
            (AcquisitionResult::ValidationOrOtherError, Duration::ZERO)
        }
    };

    debug!(
        lock_name,
        %scope,
        code = result.code(),
        wait_ms = wait_time.as_millis() as u64,
        "application lock acquisition completed"
    );

    if options.throws_on_failure {
        validation::assert_acquisition_result_valid(result)?;
    }

    let (release, release_async) = release_callbacks(backend, lock_name, scope);
    AppLock::new(lock_name, scope, result, wait_time, release, release_async)
}

/// Builds the release pair for a lock. Transaction-scoped locks are dropped
/// by the server when the transaction ends, so their callbacks skip the
/// round trip entirely.
fn release_callbacks<B>(backend: &B, lock_name: &str, scope: LockScope) -> (ReleaseFn, ReleaseFnAsync)
where
    B: AppLockBackend + Clone + 'static,
{
    if scope == LockScope::Transaction {
        let release: ReleaseFn = Box::new(|| Ok(()));
        let release_async: ReleaseFnAsync = Box::new(|| Box::pin(async { Ok(()) }));
        return (release, release_async);
    }

    let sync_backend = backend.clone();
    let sync_name = lock_name.to_string();
    let release: ReleaseFn = Box::new(move || {
        let code = sync_backend
            .execute_release(&sync_name, scope)
            .map_err(release_transport_error)?;
        validation::assert_release_result_valid(ReleaseResult::from_code(code))
    });

    let async_backend = backend.clone();
    let async_name = lock_name.to_string();
    let release_async: ReleaseFnAsync = Box::new(move || {
        Box::pin(async move {
            let code = async_backend
                .execute_release_async(&async_name, scope)
                .await
                .map_err(release_transport_error)?;
            validation::assert_release_result_valid(ReleaseResult::from_code(code))
        })
    });

    (release, release_async)
}

fn release_transport_error(err: TransportError) -> AppLockError {
    AppLockError::ReleaseFailed {
        result: ReleaseResult::ParameterValidationOrOtherError,
        source: Some(err),
    }
}

/// Acquire methods on any lock owner handle, using the scope the handle
/// itself represents (a session acquires session locks, a transaction
/// acquires transaction locks).
#[async_trait]
pub trait AppLockExt {
    fn acquire_app_lock(
        &self,
        lock_name: &str,
        options: &AcquireOptions,
    ) -> Result<AppLock, AppLockError>;

    async fn acquire_app_lock_async(
        &self,
        lock_name: &str,
        options: &AcquireOptions,
    ) -> Result<AppLock, AppLockError>;
}

#[async_trait]
impl<B> AppLockExt for B
where
    B: AppLockBackend + Clone + 'static,
{
    fn acquire_app_lock(
        &self,
        lock_name: &str,
        options: &AcquireOptions,
    ) -> Result<AppLock, AppLockError> {
        acquire(self, lock_name, self.lock_scope(), options)
    }

    async fn acquire_app_lock_async(
        &self,
        lock_name: &str,
        options: &AcquireOptions,
    ) -> Result<AppLock, AppLockError> {
        acquire_async(self, lock_name, self.lock_scope(), options).await
    }
}
