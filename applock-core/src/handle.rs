//! The application lock handle returned by every acquire call.
//!
//! A handle owns the two release callbacks built for it (one blocking, one
//! async) and guarantees that at most one of them ever runs, whichever mix
//! of `release`, `release_async`, `dispose`, `dispose_async` and `Drop`
//! the caller ends up using. It knows nothing about the lock owner behind
//! the callbacks.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{debug, error};

use crate::error::AppLockError;
use crate::types::{AcquisitionResult, LockScope};
use crate::validation;

/// Blocking release callback.
pub type ReleaseFn = Box<dyn FnOnce() -> Result<(), AppLockError> + Send>;

/// Async release callback.
pub type ReleaseFnAsync = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), AppLockError>> + Send>;

struct ReleaseCallbacks {
    release: ReleaseFn,
    release_async: ReleaseFnAsync,
}

/// Measures how long the lock has been held. Starts once, stops once.
#[derive(Debug, Default, Clone, Copy)]
struct HeldTimer {
    started: Option<Instant>,
    stopped: Option<Duration>,
}

impl HeldTimer {
    fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if self.stopped.is_some() {
            return;
        }
        if let Some(started) = self.started {
            self.stopped = Some(started.elapsed());
        }
    }

    fn elapsed(&self) -> Duration {
        match (self.started, self.stopped) {
            (_, Some(frozen)) => frozen,
            (Some(started), None) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }
}

/// One acquisition attempt of a named application lock.
///
/// Inspect [`AppLock::is_acquired`] before entering the critical section
/// when the lock was requested without `throws_on_failure`.
///
/// Dropping a handle that was not disposed performs a blocking dispose and
/// logs any release failure, since `Drop` cannot return it. Async callers
/// should finish with [`AppLock::dispose_async`] instead.
pub struct AppLock {
    name: String,
    scope: LockScope,
    result: AcquisitionResult,
    acquisition_wait_time: Duration,
    timer: HeldTimer,
    callbacks: Option<ReleaseCallbacks>,
    disposed: bool,
}

impl AppLock {
    pub fn new(
        name: impl Into<String>,
        scope: LockScope,
        result: AcquisitionResult,
        acquisition_wait_time: Duration,
        release: ReleaseFn,
        release_async: ReleaseFnAsync,
    ) -> Result<Self, AppLockError> {
        let name = name.into();
        validation::assert_name_valid(&name)?;

        // Only a grant that had to queue behind another holder waited.
        let acquisition_wait_time = if result == AcquisitionResult::AcquiredAfterWaiting {
            acquisition_wait_time
        } else {
            Duration::ZERO
        };

        let mut timer = HeldTimer::default();
        if result.is_acquired() {
            timer.start();
        }

        Ok(Self {
            name,
            scope,
            result,
            acquisition_wait_time,
            timer,
            callbacks: Some(ReleaseCallbacks {
                release,
                release_async,
            }),
            disposed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }

    pub fn result(&self) -> AcquisitionResult {
        self.result
    }

    pub fn is_acquired(&self) -> bool {
        self.result.is_acquired()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Time spent queued behind a prior holder during the acquire call.
    pub fn acquisition_wait_time(&self) -> Duration {
        self.acquisition_wait_time
    }

    /// Time the lock has been held, frozen once it is released.
    pub fn elapsed_held_time(&self) -> Duration {
        self.timer.elapsed()
    }

    /// Whether a release has already been attempted.
    pub fn is_released(&self) -> bool {
        self.callbacks.is_none()
    }

    /// Releases the lock now. Idempotent: only the first call reaches the
    /// lock owner, and only if the lock was actually acquired.
    ///
    /// A release failure is returned once; the callbacks are consumed by
    /// that attempt and later calls are no-ops.
    pub fn release(&mut self) -> Result<(), AppLockError> {
        let Some(callbacks) = self.callbacks.take() else {
            return Ok(());
        };

        let outcome = if self.is_acquired() {
            debug!(lock_name = %self.name, scope = %self.scope, "releasing application lock");
            (callbacks.release)()
        } else {
            Ok(())
        };

        self.timer.stop();
        outcome
    }

    /// Async counterpart of [`AppLock::release`], sharing the same guard.
    pub async fn release_async(&mut self) -> Result<(), AppLockError> {
        let Some(callbacks) = self.callbacks.take() else {
            return Ok(());
        };

        let outcome = if self.is_acquired() {
            debug!(lock_name = %self.name, scope = %self.scope, "releasing application lock");
            (callbacks.release_async)().await
        } else {
            Ok(())
        };

        self.timer.stop();
        outcome
    }

    /// Releases the lock if held and marks the handle disposed. The handle
    /// is disposed even when the release fails; the failure is returned.
    pub fn dispose(&mut self) -> Result<(), AppLockError> {
        if self.disposed {
            return Ok(());
        }

        // The release guard consumes the callbacks even when the lock was
        // never held, so nothing can run them after disposal.
        let outcome = self.release();
        self.disposed = true;
        outcome
    }

    pub async fn dispose_async(&mut self) -> Result<(), AppLockError> {
        if self.disposed {
            return Ok(());
        }

        let outcome = self.release_async().await;
        self.disposed = true;
        outcome
    }
}

impl Drop for AppLock {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            error!(
                lock_name = %self.name,
                scope = %self.scope,
                error = %err,
                "failed to release application lock on drop; it may be abandoned on the server"
            );
        }
    }
}

impl std::fmt::Debug for AppLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppLock")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("result", &self.result)
            .field("acquisition_wait_time", &self.acquisition_wait_time)
            .field("elapsed_held_time", &self.elapsed_held_time())
            .field("released", &self.is_released())
            .field("disposed", &self.disposed)
            .finish()
    }
}
