//! Error types for authentication and credential storage

/// Errors from auth calls and store access.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No response from the auth server (connect failure, timeout)
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The server answered but refused the operation
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The server said the refresh token is invalid or expired
    #[error("invalid refresh token: {0}")]
    InvalidRefreshToken(String),

    /// A response arrived without the fields we need
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
