//! # applock-core
//!
//! Handles for named application locks owned by a database server.
//! A lock is acquired under a session or transaction scope, comes back as
//! an [`AppLock`] describing the outcome, and is released exactly once,
//! explicitly or when the handle is disposed or dropped.
//!
//! The server itself sits behind [`infrastructure::AppLockBackend`]; an
//! in-memory server and (with the `sqlite` feature) a SQLite lock table
//! are provided.

pub mod error;
pub mod handle;
pub mod infrastructure;
#[path = "infrastructure_in_memory.rs"]
pub mod infrastructure_in_memory;
#[cfg(feature = "sqlite")]
#[path = "infrastructure_sqlite.rs"]
pub mod infrastructure_sqlite;
pub mod orchestrator;
pub mod types;
pub mod validation;

pub use error::{AppLockError, TransportError};
pub use handle::AppLock;
pub use orchestrator::{acquire, acquire_async, AcquireOptions, AppLockExt};
pub use types::{AcquisitionResult, LockScope, ReleaseResult};

#[cfg(test)]
#[path = "infrastructure_test.rs"]
mod infrastructure_test;
