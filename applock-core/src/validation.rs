//! Precondition checks on acquire arguments and postcondition checks on
//! the result codes returned by the lock owner.

use crate::error::AppLockError;
use crate::types::{AcquisitionResult, LockScope, ReleaseResult};

pub fn assert_name_valid(lock_name: &str) -> Result<(), AppLockError> {
    if lock_name.trim().is_empty() {
        return Err(AppLockError::invalid_argument(
            "lock_name",
            "the lock name must not be empty or whitespace",
        ));
    }
    Ok(())
}

/// Checked before every acquisition attempt, ahead of any server call.
pub fn assert_params_valid(lock_name: &str, timeout_seconds: i64) -> Result<(), AppLockError> {
    assert_name_valid(lock_name)?;

    if timeout_seconds < 1 {
        return Err(AppLockError::invalid_argument(
            "timeout_seconds",
            format!(
                "the lock acquisition timeout must be greater than or equal to 1 second (got {})",
                timeout_seconds
            ),
        ));
    }
    Ok(())
}

pub fn assert_acquisition_result_valid(result: AcquisitionResult) -> Result<(), AppLockError> {
    if result.is_acquired() {
        return Ok(());
    }
    Err(AppLockError::AcquisitionFailed {
        result,
        source: None,
    })
}

pub fn assert_release_result_valid(result: ReleaseResult) -> Result<(), AppLockError> {
    if result.is_released() {
        return Ok(());
    }
    Err(AppLockError::ReleaseFailed {
        result,
        source: None,
    })
}

pub fn lock_owner_name(scope: LockScope) -> &'static str {
    scope.owner_name()
}
