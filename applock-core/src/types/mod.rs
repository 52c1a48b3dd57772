mod result;
mod scope;

pub use result::{AcquisitionResult, ReleaseResult};
pub use scope::{LockMode, LockScope, SESSION_OWNER, TRANSACTION_OWNER};
