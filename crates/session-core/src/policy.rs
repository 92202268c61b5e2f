//! Refresh failure policy
//!
//! One function decides whether a failed refresh ends the session. Every
//! refresh path (interceptor retry, proactive timer, explicit refresh) goes
//! through it so the paths cannot disagree.

use std::fmt;

/// What started a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshTrigger {
    /// A request came back 401.
    Reactive,
    /// The proactive timer fired, or a resume found the token near expiry.
    Proactive,
    /// A caller asked for a fresh token directly.
    OnDemand,
}

impl RefreshTrigger {
    /// Metric and log label.
    pub fn label(self) -> &'static str {
        match self {
            RefreshTrigger::Reactive => "reactive",
            RefreshTrigger::Proactive => "proactive",
            RefreshTrigger::OnDemand => "on_demand",
        }
    }
}

impl fmt::Display for RefreshTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a refresh did not produce a usable token pair.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshFailure {
    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error(transparent)]
    Remote(#[from] session_auth::Error),

    #[error("persisting refreshed tokens failed: {0}")]
    Persist(String),
}

/// Consequence of a failed refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSeverity {
    /// Clear credentials and force a logout.
    Fatal,
    /// Keep the session; the next request or timer tries again.
    Deferred,
}

/// Classify a refresh failure.
///
/// A refresh token the server refuses, or none at all, is fatal whatever
/// started the refresh. Anything else (network, 5xx, storage) is fatal only
/// when a caller is blocked on the result; a background proactive refresh
/// defers instead.
pub fn classify_refresh_failure(failure: &RefreshFailure, trigger: RefreshTrigger) -> FailureSeverity {
    match failure {
        RefreshFailure::MissingRefreshToken
        | RefreshFailure::Remote(session_auth::Error::InvalidRefreshToken(_)) => {
            FailureSeverity::Fatal
        }
        _ => match trigger {
            RefreshTrigger::Proactive => FailureSeverity::Deferred,
            RefreshTrigger::Reactive | RefreshTrigger::OnDemand => FailureSeverity::Fatal,
        },
    }
}
