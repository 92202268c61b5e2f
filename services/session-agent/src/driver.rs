//! Flow driver
//!
//! Runs the pure `flow` state machine against the live session: bus events
//! and operator commands go in, and the I/O each `FlowAction` implies comes
//! out. The current `FlowState` is published on a watch channel for the
//! status endpoints.

use std::collections::VecDeque;
use std::sync::Arc;

use session_auth::LoginRequest;
use session_core::{Acknowledgement, SessionEvent, SessionManager};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::flow::{FlowAction, FlowEvent, FlowState, handle_event};
use crate::metrics;

/// Operator commands accepted by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCommand {
    /// The expiry prompt was seen
    ConfirmPrompt,
    /// The operator signed out through the agent
    SignedOut,
}

/// Handle for talking to a running driver.
#[derive(Clone)]
pub struct FlowHandle {
    commands: mpsc::Sender<FlowCommand>,
    state: watch::Receiver<FlowState>,
}

impl FlowHandle {
    pub fn state(&self) -> FlowState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.state.clone()
    }

    /// Returns false if the driver has stopped.
    pub async fn confirm_prompt(&self) -> bool {
        self.commands.send(FlowCommand::ConfirmPrompt).await.is_ok()
    }

    pub async fn signed_out(&self) -> bool {
        self.commands.send(FlowCommand::SignedOut).await.is_ok()
    }
}

/// Driver settings.
pub struct DriverOptions {
    /// Credentials used to sign back in after a forced logout
    pub relogin: Option<LoginRequest>,
    /// Confirm the expiry prompt without waiting for an operator
    pub auto_acknowledge: bool,
}

struct Driver {
    manager: Arc<SessionManager>,
    options: DriverOptions,
    state: FlowState,
    pending_ack: Option<Acknowledgement>,
    queue: VecDeque<FlowEvent>,
    state_tx: watch::Sender<FlowState>,
}

/// Spawn the driver. Subscribes to the session bus before returning, so
/// no event published after this call is missed.
pub fn spawn(
    manager: Arc<SessionManager>,
    options: DriverOptions,
    initial: FlowState,
) -> (FlowHandle, JoinHandle<()>) {
    let mut events = manager.events().subscribe();
    let (command_tx, mut command_rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(initial.clone());
    metrics::set_session_active(matches!(initial, FlowState::Authenticated { .. }));

    let mut driver = Driver {
        manager,
        options,
        state: initial,
        pending_ack: None,
        queue: VecDeque::new(),
        state_tx,
    };

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => driver.on_session_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "flow driver lagged behind session events");
                    }
                    Err(RecvError::Closed) => break,
                },
                command = command_rx.recv() => match command {
                    Some(FlowCommand::ConfirmPrompt) => driver.queue.push_back(FlowEvent::PromptConfirmed),
                    Some(FlowCommand::SignedOut) => driver.queue.push_back(FlowEvent::SignedOut),
                    None => break,
                },
            }
            driver.drain().await;
        }
        debug!("flow driver stopped");
    });

    (
        FlowHandle {
            commands: command_tx,
            state: state_rx,
        },
        task,
    )
}

impl Driver {
    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SessionExpired { message, ack } => {
                self.pending_ack = Some(ack);
                self.queue.push_back(FlowEvent::SessionExpired { message });
            }
            SessionEvent::ForcedLogout { reason } => {
                debug!(reason = %reason, "forced logout reached flow driver");
                self.queue.push_back(FlowEvent::ForcedLogout);
            }
            SessionEvent::RefreshFailed { reason } => {
                debug!(reason = %reason, "refresh failed");
            }
            SessionEvent::SilentTokenRefreshed { .. } => {}
        }
    }

    async fn drain(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            let forced = event == FlowEvent::ForcedLogout;
            let previous = self.state.clone();
            let (next, action) = handle_event(previous.clone(), event);
            if next != previous {
                info!(from = previous.label(), to = next.label(), "flow transition");
            }
            self.state = next;
            self.state_tx.send_replace(self.state.clone());
            self.execute(action, forced).await;
        }
    }

    async fn execute(&mut self, action: FlowAction, forced: bool) {
        match action {
            FlowAction::ShowExpiryPrompt { message } => {
                warn!(message = %message, "session expired");
                if self.options.auto_acknowledge {
                    self.queue.push_back(FlowEvent::PromptConfirmed);
                }
            }
            FlowAction::AcknowledgeExpiry => match self.pending_ack.take() {
                Some(ack) => {
                    if !ack.acknowledge() {
                        debug!("expiry already acknowledged");
                    }
                }
                None => debug!("no expiry awaiting acknowledgement"),
            },
            FlowAction::NavigateToLogin => {
                self.pending_ack = None;
                metrics::set_session_active(false);
                if forced {
                    self.sign_back_in().await;
                }
            }
            FlowAction::None => {}
        }
    }

    async fn sign_back_in(&mut self) {
        let Some(request) = self.options.relogin.clone() else {
            info!("signed out; no credentials configured for sign-in");
            return;
        };
        match self.manager.login(&request).await {
            Ok(_) => {
                metrics::set_session_active(true);
                self.queue.push_back(FlowEvent::SignedIn {
                    email: Some(request.email),
                });
            }
            Err(e) => error!(error = %e, "sign-in after forced logout failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use common::Secret;
    use session_auth::{
        AuthClient, Error as AuthError, LoginResult, MemoryStore, RegisterRequest, TokenPair,
    };
    use session_core::{BroadcastBus, CoordinatorConfig, EventBus, RefreshTrigger};

    use super::*;

    /// Auth client whose refreshes always fail with a dead refresh token.
    struct RevokingClient {
        logins: AtomicUsize,
        reject_login: Mutex<bool>,
    }

    impl RevokingClient {
        fn new(reject_login: bool) -> Self {
            Self {
                logins: AtomicUsize::new(0),
                reject_login: Mutex::new(reject_login),
            }
        }
    }

    impl AuthClient for RevokingClient {
        fn login<'a>(
            &'a self,
            _request: &'a LoginRequest,
            _client_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = session_auth::Result<LoginResult>> + Send + 'a>> {
            Box::pin(async move {
                if *self.reject_login.lock().unwrap() {
                    return Err(AuthError::Rejected("bad credentials".into()));
                }
                let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(LoginResult {
                    tokens: TokenPair::new(format!("at_login{n}"), format!("rt_login{n}")),
                    user: None,
                    profile: None,
                })
            })
        }

        fn register<'a>(
            &'a self,
            _request: &'a RegisterRequest,
            _client_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }

        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
            _client_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = session_auth::Result<TokenPair>> + Send + 'a>> {
            Box::pin(async { Err(AuthError::InvalidRefreshToken("revoked".into())) })
        }
    }

    fn credentials() -> LoginRequest {
        LoginRequest {
            email: "ana@example.com".into(),
            password: Secret::from("hunter2"),
        }
    }

    async fn signed_in_manager(
        client: Arc<RevokingClient>,
    ) -> (Arc<SessionManager>, Arc<dyn EventBus>) {
        let bus: Arc<dyn EventBus> = Arc::new(BroadcastBus::new());
        let config = CoordinatorConfig {
            client_id: "test-client".into(),
            ack_timeout: Duration::from_secs(5),
            ..CoordinatorConfig::default()
        };
        let manager = Arc::new(SessionManager::new(
            Arc::new(MemoryStore::new()),
            client,
            bus.clone(),
            config,
        ));
        manager.login(&credentials()).await.unwrap();
        (manager, bus)
    }

    async fn wait_for(handle: &FlowHandle, want: impl Fn(&FlowState) -> bool) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !want(&rx.borrow_and_update()) {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn auto_acknowledge_signs_back_in() {
        let client = Arc::new(RevokingClient::new(false));
        let (manager, _bus) = signed_in_manager(client.clone()).await;
        let (handle, task) = spawn(
            Arc::clone(&manager),
            DriverOptions {
                relogin: Some(credentials()),
                auto_acknowledge: true,
            },
            FlowState::Authenticated {
                email: Some("ana@example.com".into()),
            },
        );

        let _ = manager
            .coordinator()
            .perform_refresh(RefreshTrigger::Reactive)
            .await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.logins.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        wait_for(&handle, |s| matches!(s, FlowState::Authenticated { .. })).await;
        assert_eq!(
            manager.coordinator().current_token().await.unwrap().as_deref(),
            Some("at_login2")
        );
        task.abort();
        manager.logout().await.unwrap();
    }

    #[tokio::test]
    async fn prompt_waits_for_operator_confirmation() {
        let client = Arc::new(RevokingClient::new(false));
        let (manager, bus) = signed_in_manager(client).await;
        let mut observer = bus.subscribe();
        let (handle, task) = spawn(
            Arc::clone(&manager),
            DriverOptions {
                relogin: None,
                auto_acknowledge: false,
            },
            FlowState::Authenticated { email: None },
        );

        let _ = manager
            .coordinator()
            .perform_refresh(RefreshTrigger::Reactive)
            .await;
        wait_for(&handle, |s| matches!(s, FlowState::ExpiryPrompt { .. })).await;

        // No logout until the prompt is confirmed
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = observer.try_recv() {
            assert!(!matches!(event, SessionEvent::ForcedLogout { .. }));
        }
        assert!(manager.projection().snapshot().is_logged_in);

        assert!(handle.confirm_prompt().await);
        wait_for(&handle, |s| *s == FlowState::Unauthenticated).await;
        task.abort();
    }

    #[tokio::test]
    async fn failed_relogin_stays_signed_out() {
        let client = Arc::new(RevokingClient::new(false));
        let (manager, _bus) = signed_in_manager(client.clone()).await;
        *client.reject_login.lock().unwrap() = true;
        let (handle, task) = spawn(
            Arc::clone(&manager),
            DriverOptions {
                relogin: Some(credentials()),
                auto_acknowledge: true,
            },
            FlowState::Authenticated { email: None },
        );

        let _ = manager
            .coordinator()
            .perform_refresh(RefreshTrigger::Reactive)
            .await;

        wait_for(&handle, |s| *s == FlowState::Unauthenticated).await;
        assert!(!manager.coordinator().is_active());
        task.abort();
    }

    #[tokio::test]
    async fn operator_sign_out_does_not_relogin() {
        let client = Arc::new(RevokingClient::new(false));
        let (manager, _bus) = signed_in_manager(client.clone()).await;
        let (handle, task) = spawn(
            Arc::clone(&manager),
            DriverOptions {
                relogin: Some(credentials()),
                auto_acknowledge: true,
            },
            FlowState::Authenticated { email: None },
        );

        manager.logout().await.unwrap();
        assert!(handle.signed_out().await);
        wait_for(&handle, |s| *s == FlowState::Unauthenticated).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.logins.load(Ordering::SeqCst), 1);
        task.abort();
    }
}
