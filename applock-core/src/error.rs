use std::time::Duration;

use thiserror::Error;

use crate::types::{AcquisitionResult, ReleaseResult};

/// Failures raised by a lock owner collaborator while executing a call,
/// as opposed to result codes it returns.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("the connection is closed")]
    ConnectionClosed,
    #[error("the command did not complete within {0:?}")]
    CommandTimeout(Duration),
    #[error("no active transaction is available for a transaction-scoped lock")]
    NoActiveTransaction,
    #[error("lock storage error: {0}")]
    Storage(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for TransportError {
    fn from(err: rusqlite::Error) -> Self {
        TransportError::Storage(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AppLockError {
    #[error("invalid argument `{param}`: {message}")]
    InvalidArgument {
        param: &'static str,
        message: String,
    },

    #[error("failed to acquire the application lock due to [{result}]")]
    AcquisitionFailed {
        result: AcquisitionResult,
        #[source]
        source: Option<TransportError>,
    },

    #[error("failed to release the application lock due to [{result}]")]
    ReleaseFailed {
        result: ReleaseResult,
        #[source]
        source: Option<TransportError>,
    },
}

impl AppLockError {
    pub(crate) fn invalid_argument(param: &'static str, message: impl Into<String>) -> Self {
        AppLockError::InvalidArgument {
            param,
            message: message.into(),
        }
    }

    /// The acquisition outcome, when this error came from an acquire call.
    pub fn acquisition_result(&self) -> Option<AcquisitionResult> {
        match self {
            AppLockError::AcquisitionFailed { result, .. } => Some(*result),
            _ => None,
        }
    }

    /// The release outcome, when this error came from a release.
    pub fn release_result(&self) -> Option<ReleaseResult> {
        match self {
            AppLockError::ReleaseFailed { result, .. } => Some(*result),
            _ => None,
        }
    }
}
