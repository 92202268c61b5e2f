//! Error types for session operations

use crate::policy::RefreshFailure;

/// Errors from session operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No access token is stored
    #[error("no active session")]
    NotAuthenticated,

    /// This call led a refresh that failed
    #[error("token refresh failed: {0}")]
    Refresh(RefreshFailure),

    /// This call waited on a refresh that did not produce a token
    #[error("token refresh aborted: {0}")]
    RefreshAborted(String),

    /// Login or registration was refused
    #[error("authentication failed: {0}")]
    Auth(session_auth::Error),

    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    pub(crate) fn store(e: session_auth::Error) -> Self {
        Error::Store(e.to_string())
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
