use serde::{Deserialize, Serialize};

/// Outcome of an acquire call, carrying the server's signed return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum AcquisitionResult {
    /// Granted without waiting
    AcquiredImmediately = 0,
    /// Granted after a prior holder released it
    AcquiredAfterWaiting = 1,
    FailedDueToTimeout = -1,
    AcquisitionCancelled = -2,
    /// Chosen as a deadlock victim
    FailedDueToDeadlock = -3,
    ValidationOrOtherError = -999,
}

impl AcquisitionResult {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decodes a server return code. Codes outside the known set are
    /// treated as a validation or other error.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => AcquisitionResult::AcquiredImmediately,
            1 => AcquisitionResult::AcquiredAfterWaiting,
            -1 => AcquisitionResult::FailedDueToTimeout,
            -2 => AcquisitionResult::AcquisitionCancelled,
            -3 => AcquisitionResult::FailedDueToDeadlock,
            _ => AcquisitionResult::ValidationOrOtherError,
        }
    }

    /// True only for the two outcomes that leave the lock held.
    pub fn is_acquired(self) -> bool {
        matches!(
            self,
            AcquisitionResult::AcquiredImmediately | AcquisitionResult::AcquiredAfterWaiting
        )
    }
}

impl std::fmt::Display for AcquisitionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Outcome of a release call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ReleaseResult {
    ReleasedSuccessfully = 0,
    /// Bad parameters, lock not held by the caller, or any other failure
    ParameterValidationOrOtherError = -999,
}

impl ReleaseResult {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ReleaseResult::ReleasedSuccessfully,
            _ => ReleaseResult::ParameterValidationOrOtherError,
        }
    }

    pub fn is_released(self) -> bool {
        self == ReleaseResult::ReleasedSuccessfully
    }
}

impl std::fmt::Display for ReleaseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}
