use applock_core::infrastructure_sqlite::LockInfo;
use applock_core::{AcquisitionResult, AppLock, LockScope};
use serde::Serialize;

// ─── Output Envelope ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CliResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> CliResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(data: T, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Some(data),
            error: Some(msg.into()),
        }
    }
}

// ─── Reports ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct LockReport {
    pub name: String,
    pub scope: LockScope,
    pub result: AcquisitionResult,
    pub code: i32,
    pub acquired: bool,
    pub wait_ms: u64,
    pub held_ms: u64,
    pub disposed: bool,
}

impl LockReport {
    pub fn from_lock(lock: &AppLock) -> Self {
        Self {
            name: lock.name().to_string(),
            scope: lock.scope(),
            result: lock.result(),
            code: lock.result().code(),
            acquired: lock.is_acquired(),
            wait_ms: lock.acquisition_wait_time().as_millis() as u64,
            held_ms: lock.elapsed_held_time().as_millis() as u64,
            disposed: lock.is_disposed(),
        }
    }
}

#[derive(Serialize)]
pub struct LockListReport {
    pub count: usize,
    pub locks: Vec<LockInfo>,
}

#[derive(Serialize)]
pub struct ForceReleaseReport {
    pub name: String,
    pub removed: bool,
}
