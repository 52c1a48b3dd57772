use serde::{Deserialize, Serialize};

/// Lock owner value for locks that live as long as the connection.
pub const SESSION_OWNER: &str = "Session";
/// Lock owner value for locks that live as long as the enclosing transaction.
pub const TRANSACTION_OWNER: &str = "Transaction";

/// Who owns an application lock on the server, and therefore when the
/// server drops it on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockScope {
    /// Held until explicitly released or the connection closes
    Session,
    /// Held until the transaction commits or rolls back
    Transaction,
}

impl LockScope {
    /// The literal passed as the lock owner parameter of the server call.
    pub fn owner_name(self) -> &'static str {
        match self {
            LockScope::Session => SESSION_OWNER,
            LockScope::Transaction => TRANSACTION_OWNER,
        }
    }

    pub fn from_owner_name(s: &str) -> Option<Self> {
        match s {
            SESSION_OWNER => Some(LockScope::Session),
            TRANSACTION_OWNER => Some(LockScope::Transaction),
            _ => None,
        }
    }
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.owner_name())
    }
}

/// Lock modes requested from the server. Only exclusive locks are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockMode {
    #[default]
    Exclusive,
}

impl LockMode {
    pub fn name(self) -> &'static str {
        match self {
            LockMode::Exclusive => "Exclusive",
        }
    }
}
