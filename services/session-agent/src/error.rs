//! Agent startup errors
//!
//! Per-request failures never surface here: the forwarding handler turns
//! them into JSON error responses.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no stored session and no login credentials configured")]
    NoCredentials,

    #[error("login failed: {0}")]
    Login(#[source] session_core::Error),

    #[error("could not open session store: {0}")]
    Store(#[source] session_auth::Error),
}

/// Result alias using agent Error
pub type Result<T> = std::result::Result<T, Error>;
