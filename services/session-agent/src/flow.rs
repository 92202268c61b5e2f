//! Auth flow state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The driver executes the I/O implied by each action (acknowledging the
//! expiry prompt, signing back in).

/// Where the user is in the auth flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    /// Signed out; the login flow is showing
    Unauthenticated,
    /// Signed in and using the app
    Authenticated { email: Option<String> },
    /// The session ended and the user is being told so
    ExpiryPrompt { message: String },
}

impl FlowState {
    /// Label for logs and the status endpoint.
    pub fn label(&self) -> &'static str {
        match self {
            FlowState::Unauthenticated => "unauthenticated",
            FlowState::Authenticated { .. } => "authenticated",
            FlowState::ExpiryPrompt { .. } => "expiry_prompt",
        }
    }
}

/// Events that drive the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// Login or restore succeeded
    SignedIn { email: Option<String> },
    /// The session could not be refreshed
    SessionExpired { message: String },
    /// The user dismissed the expiry prompt
    PromptConfirmed,
    /// The core finished tearing the session down
    ForcedLogout,
    /// The user signed out
    SignedOut,
}

/// Actions the caller should execute after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    /// Show the expiry message and wait for confirmation
    ShowExpiryPrompt { message: String },
    /// Acknowledge the pending `SessionExpired` event
    AcknowledgeExpiry,
    /// Reset to the login flow
    NavigateToLogin,
    /// No-op
    None,
}

/// Handle a flow transition. Pure function: no I/O.
pub fn handle_event(state: FlowState, event: FlowEvent) -> (FlowState, FlowAction) {
    match (state, event) {
        (_, FlowEvent::SignedIn { email }) => (FlowState::Authenticated { email }, FlowAction::None),

        // One prompt at a time
        (state @ FlowState::ExpiryPrompt { .. }, FlowEvent::SessionExpired { .. }) => {
            (state, FlowAction::None)
        }
        (_, FlowEvent::SessionExpired { message }) => (
            FlowState::ExpiryPrompt {
                message: message.clone(),
            },
            FlowAction::ShowExpiryPrompt { message },
        ),

        // The prompt stays up until the logout it unblocks arrives
        (state @ FlowState::ExpiryPrompt { .. }, FlowEvent::PromptConfirmed) => {
            (state, FlowAction::AcknowledgeExpiry)
        }

        (FlowState::Unauthenticated, FlowEvent::ForcedLogout | FlowEvent::SignedOut) => {
            (FlowState::Unauthenticated, FlowAction::None)
        }
        (_, FlowEvent::ForcedLogout | FlowEvent::SignedOut) => {
            (FlowState::Unauthenticated, FlowAction::NavigateToLogin)
        }

        (state, FlowEvent::PromptConfirmed) => (state, FlowAction::None),
    }
}
