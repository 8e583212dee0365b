//! Registry error taxonomy.

use thiserror::Error;

use crate::{BusError, SessionId};

/// Session registry error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The identity directory does not know the user.
    #[error("Unknown user: {0}")]
    UnknownUser(String),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("No session build pending")]
    NotPending,
    #[error("Session {0} has no owner yet")]
    NoOwner(SessionId),
    #[error("Session build pending; building a new session is locked")]
    TransactionLocked,
    #[error("Internal failure: {0}")]
    InternalFailure(String),
}

impl SessionError {
    /// Whether the error is the soft unknown-user condition.
    #[must_use]
    pub const fn is_unknown_user(&self) -> bool {
        matches!(self, Self::UnknownUser(_))
    }
}

impl From<BusError> for SessionError {
    fn from(e: BusError) -> Self {
        Self::InternalFailure(e.to_string())
    }
}

/// Registry result type.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;
