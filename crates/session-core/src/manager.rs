//! Session lifecycle: login, registration, restore, logout
//!
//! `SessionManager` is the entry point an application holds. It owns the
//! coordinator and the projection and keeps them in step with the store.
//! Forced logouts and silent refreshes reach the projection through an
//! event bridge task subscribed to the bus.

use std::sync::Arc;

use api_transport::Transport;
use session_auth::credentials::{StoredSession, clear_session, persist_login};
use session_auth::{AuthClient, KeyValueStore, LoginRequest, REFRESH_TOKEN_KEY, RegisterRequest};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::{CoordinatorConfig, RefreshCoordinator};
use crate::error::{Error, Result};
use crate::events::{EventBus, SessionEvent};
use crate::interceptor::AuthPipeline;
use crate::state::{SessionAction, SessionProjection, SessionState};

/// Owns one user session.
pub struct SessionManager {
    store: Arc<dyn KeyValueStore>,
    client: Arc<dyn AuthClient>,
    events: Arc<dyn EventBus>,
    coordinator: Arc<RefreshCoordinator>,
    projection: Arc<SessionProjection>,
    client_id: String,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        client: Arc<dyn AuthClient>,
        events: Arc<dyn EventBus>,
        config: CoordinatorConfig,
    ) -> Self {
        let client_id = config.client_id.clone();
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&client),
            Arc::clone(&events),
            config,
        );
        Self {
            store,
            client,
            events,
            coordinator,
            projection: Arc::new(SessionProjection::new()),
            client_id,
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn projection(&self) -> &Arc<SessionProjection> {
        &self.projection
    }

    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.events
    }

    /// Pipeline that sends requests over `transport` with this session's
    /// credentials.
    pub fn pipeline(&self, transport: Arc<dyn Transport>) -> AuthPipeline {
        AuthPipeline::new(transport, Arc::clone(&self.coordinator))
    }

    /// Sign in, persist the session, and start the proactive timer.
    pub async fn login(&self, request: &LoginRequest) -> Result<SessionState> {
        let login = self
            .client
            .login(request, &self.client_id)
            .await
            .map_err(Error::Auth)?;

        self.coordinator.reset();
        // Keys the new response omits must not survive from the previous user
        clear_session(&*self.store).await.map_err(Error::store)?;
        persist_login(&*self.store, &login)
            .await
            .map_err(Error::store)?;
        self.coordinator.start_session().await?;

        self.projection.dispatch(SessionAction::LoggedIn {
            tokens: login.tokens,
            user: login.user,
            profile: login.profile,
        });
        info!(email = %request.email, "signed in");
        Ok(self.projection.snapshot())
    }

    /// Create an account, then sign in with the same credentials.
    pub async fn register(&self, request: &RegisterRequest) -> Result<SessionState> {
        self.client
            .register(request, &self.client_id)
            .await
            .map_err(Error::Auth)?;
        info!(email = %request.email, "account registered");

        self.login(&LoginRequest {
            email: request.email.clone(),
            password: request.password.clone(),
        })
        .await
    }

    /// Pick up a session a previous run left in the store. Returns false if
    /// there is none.
    pub async fn restore(&self) -> Result<bool> {
        let stored = StoredSession::load(&*self.store)
            .await
            .map_err(Error::store)?;
        let (Some(access_token), Some(refresh_token)) = (stored.access_token, stored.refresh_token)
        else {
            debug!("no stored session");
            return Ok(false);
        };

        self.projection.dispatch(SessionAction::LoggedIn {
            tokens: session_auth::TokenPair::new(access_token, refresh_token),
            user: stored.user,
            profile: stored.profile,
        });
        if let Err(e) = self.coordinator.resume_session().await {
            warn!(error = %e, "restored session could not resume refresh schedule");
        }

        // Resuming may have refreshed or ended the session
        let restored = self.coordinator.is_active();
        if restored {
            if let Ok(Some(token)) = self.coordinator.current_token().await {
                self.projection.dispatch(SessionAction::TokenRefreshed {
                    access_token: token,
                    refresh_token: self.store.get(REFRESH_TOKEN_KEY).await.ok().flatten(),
                });
            }
            info!("session restored");
        } else {
            self.projection.dispatch(SessionAction::LoggedOut);
        }
        Ok(restored)
    }

    /// Sign out: stop the timer, drop queued callers, clear the store.
    pub async fn logout(&self) -> Result<()> {
        if let Err(e) = self.coordinator.cancel_proactive_refresh().await {
            warn!(error = %e, "failed to remove token expiry");
        }
        self.coordinator.reset();
        clear_session(&*self.store).await.map_err(Error::store)?;
        self.projection.dispatch(SessionAction::LoggedOut);
        info!("signed out");
        Ok(())
    }

    /// A usable access token, refreshed first if near expiry.
    pub async fn refresh_now(&self) -> Result<String> {
        self.coordinator.ensure_fresh().await
    }

    /// Keep the projection in step with bus events. Subscribes before
    /// returning, so no event published after this call is missed.
    pub fn spawn_event_bridge(&self) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let projection = Arc::clone(&self.projection);
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::ForcedLogout { reason }) => {
                        info!(reason = %reason, "forced logout, clearing session state");
                        projection.dispatch(SessionAction::LoggedOut);
                    }
                    Ok(SessionEvent::SilentTokenRefreshed { token }) => {
                        let refresh_token = match store.get(REFRESH_TOKEN_KEY).await {
                            Ok(token) => token,
                            Err(e) => {
                                warn!(error = %e, "could not read rotated refresh token");
                                None
                            }
                        };
                        projection.dispatch(SessionAction::TokenRefreshed {
                            access_token: token.expose().clone(),
                            refresh_token,
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event bridge lagged behind session events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
