//! Observable session state
//!
//! `SessionState` is what presentation code reads: signed in or not, the
//! current tokens, the user. It only changes through `reduce`, and
//! `SessionProjection` publishes each new value on a `tokio::sync::watch`
//! channel so observers always see the latest one.

use std::fmt;

use session_auth::{TokenPair, UserRecord};
use tokio::sync::watch;

/// Snapshot of the signed-in session.
#[derive(Clone, Default, PartialEq)]
pub struct SessionState {
    pub is_logged_in: bool,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserRecord>,
    pub profile: Option<serde_json::Value>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("is_logged_in", &self.is_logged_in)
            .field(
                "access_token",
                &self.access_token.as_deref().map(common::fingerprint),
            )
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(common::fingerprint),
            )
            .field("user", &self.user.as_ref().and_then(|u| u.email.as_deref()))
            .finish()
    }
}

/// Transitions of the session state.
#[derive(Debug, Clone)]
pub enum SessionAction {
    LoggedIn {
        tokens: TokenPair,
        user: Option<UserRecord>,
        profile: Option<serde_json::Value>,
    },
    /// A refresh rotated the tokens. `refresh_token` is `None` when only the
    /// access token is known.
    TokenRefreshed {
        access_token: String,
        refresh_token: Option<String>,
    },
    LoggedOut,
}

/// Apply one action. A refresh arriving after logout is ignored.
pub fn reduce(state: &SessionState, action: SessionAction) -> SessionState {
    match action {
        SessionAction::LoggedIn {
            tokens,
            user,
            profile,
        } => SessionState {
            is_logged_in: true,
            access_token: Some(tokens.access_token),
            refresh_token: Some(tokens.refresh_token),
            user,
            profile,
        },
        SessionAction::TokenRefreshed {
            access_token,
            refresh_token,
        } => {
            if !state.is_logged_in {
                return state.clone();
            }
            SessionState {
                access_token: Some(access_token),
                refresh_token: refresh_token.or_else(|| state.refresh_token.clone()),
                ..state.clone()
            }
        }
        SessionAction::LoggedOut => SessionState::default(),
    }
}

/// Current `SessionState`, observable.
pub struct SessionProjection {
    tx: watch::Sender<SessionState>,
}

impl SessionProjection {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::default());
        Self { tx }
    }

    pub fn dispatch(&self, action: SessionAction) {
        self.tx.send_modify(|state| *state = reduce(state, action));
    }

    pub fn snapshot(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

impl Default for SessionProjection {
    fn default() -> Self {
        Self::new()
    }
}
