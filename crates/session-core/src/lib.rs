//! Session token lifecycle and refresh coordination
//!
//! Keeps one user session's access token valid against the remote API. The
//! `RefreshCoordinator` owns the single-flight refresh lock, its waiter queue,
//! and the proactive refresh timer; `AuthPipeline` attaches tokens to outgoing
//! requests and turns a 401 into refresh-then-retry; `SessionManager` wires
//! login, restore, and logout to the `SessionProjection` that UI code reads.
//!
//! Session lifecycle:
//! 1. `SessionManager::login()` persists tokens, arms the 15 minute timer
//! 2. Requests go through `AuthPipeline::execute()` with a bearer token
//! 3. Timer fires → `perform_refresh(Proactive)`; failures are deferred
//! 4. A 401 → `perform_refresh(Reactive)` (or join the in-flight one) → retry once
//! 5. Dead refresh token → store cleared, `SessionExpired`, then `ForcedLogout`
//! 6. `SessionManager::logout()` cancels the timer and clears everything

pub mod coordinator;
pub mod error;
pub mod events;
pub mod interceptor;
pub mod manager;
pub mod metrics;
pub mod policy;
pub mod state;
pub mod timer;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{CoordinatorConfig, RefreshCoordinator, SESSION_EXPIRED_MESSAGE};
pub use error::{Error, Result};
pub use events::{Acknowledgement, BroadcastBus, EventBus, EventError, SessionEvent, emit_guarded};
pub use interceptor::AuthPipeline;
pub use manager::SessionManager;
pub use policy::{FailureSeverity, RefreshFailure, RefreshTrigger, classify_refresh_failure};
pub use state::{SessionAction, SessionProjection, SessionState, reduce};
