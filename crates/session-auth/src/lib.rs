//! Session authentication library
//!
//! Provides the durable key-value store contract (with in-memory and file
//! backed stores), the credential data model persisted in it, and the Auth
//! Remote Client that performs login, registration, and token refresh calls.
//! This crate knows nothing about refresh coordination; it only moves
//! credentials between the network and the store.
//!
//! Credential flow:
//! 1. App calls `AuthClient::login()` (or `register()` then `login()`)
//! 2. Result stored via `credentials::persist_login()`
//! 3. Coordinator calls `AuthClient::refresh()` when the access token ages out
//! 4. New pair stored via `credentials::persist_tokens()`
//! 5. Logout or fatal refresh failure calls `credentials::clear_session()`

pub mod client;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod store;

pub use client::{AuthClient, AuthEndpoints, HttpAuthClient, LoginRequest, RegisterRequest};
pub use constants::*;
pub use credentials::{LoginResult, StoredSession, TokenPair, UserRecord, now_millis};
pub use error::{Error, Result};
pub use store::{FileStore, KeyValueStore, MemoryStore};
