//! Single-flight token refresh
//!
//! At most one refresh runs per session. The first caller that needs a new
//! token becomes the leader; everyone arriving while it runs is queued and
//! resolved, in arrival order, with the leader's result. The leader's network
//! call runs in its own task so a caller that gives up cannot strand the lock.
//!
//! Lock state is a `std::sync::Mutex` that is never held across an await.
//! Two counters keep stale work out:
//! - `generation` advances on every successful refresh, so a caller that read
//!   the store before a refresh finished can pick up the result instead of
//!   refreshing again
//! - `epoch` advances when a session starts or ends, so a refresh that
//!   outlives its session cannot write tokens back into the store

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use session_auth::{
    ACCESS_TOKEN_KEY, AuthClient, KeyValueStore, REFRESH_MARGIN, REFRESH_TOKEN_KEY,
    TOKEN_LIFETIME, TokenPair,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{Acknowledgement, EventBus, SessionEvent, emit_guarded};
use crate::metrics;
use crate::policy::{FailureSeverity, RefreshFailure, RefreshTrigger, classify_refresh_failure};
use crate::timer::TimerSlot;

/// Message shown to the user when the session cannot be refreshed.
pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please sign in again.";

/// Default wait for the user to acknowledge an expired session.
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(120);

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Client identifier sent with every refresh
    pub client_id: String,
    /// Assumed access token lifetime; also the proactive timer delay
    pub token_lifetime: Duration,
    /// A token closer than this to expiry is refreshed before use
    pub refresh_margin: Duration,
    /// How long `SessionExpired` waits for acknowledgement before the forced
    /// logout goes out anyway
    pub ack_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            token_lifetime: TOKEN_LIFETIME,
            refresh_margin: REFRESH_MARGIN,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct LockState {
    refreshing: bool,
    waiters: VecDeque<oneshot::Sender<TokenPair>>,
    generation: u64,
    epoch: u64,
    latest: Option<TokenPair>,
}

enum Ticket {
    /// Token already refreshed since the caller looked.
    Ready(TokenPair),
    /// Queued behind the running refresh.
    Follow(oneshot::Receiver<TokenPair>),
    /// This caller runs the refresh.
    Lead { epoch: u64 },
}

/// Owns the refresh lock, the waiter queue, and the proactive timer.
pub struct RefreshCoordinator {
    pub(crate) store: Arc<dyn KeyValueStore>,
    client: Arc<dyn AuthClient>,
    pub(crate) events: Arc<dyn EventBus>,
    pub(crate) config: CoordinatorConfig,
    lock: Mutex<LockState>,
    pub(crate) timer: Mutex<Option<TimerSlot>>,
    pub(crate) next_timer_id: AtomicU64,
    active: AtomicBool,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        client: Arc<dyn AuthClient>,
        events: Arc<dyn EventBus>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            events,
            config,
            lock: Mutex::new(LockState::default()),
            timer: Mutex::new(None),
            next_timer_id: AtomicU64::new(0),
            active: AtomicBool::new(false),
        })
    }

    /// Begin a session with freshly issued tokens (login).
    pub async fn start_session(self: &Arc<Self>) -> Result<()> {
        self.open_session();
        self.schedule_proactive_refresh().await
    }

    /// Begin a session from tokens a previous run persisted.
    pub async fn resume_session(self: &Arc<Self>) -> Result<()> {
        self.open_session();
        self.resume_proactive_refresh().await
    }

    fn open_session(&self) {
        {
            let mut state = self.state();
            state.epoch += 1;
            state.latest = None;
        }
        self.active.store(true, Ordering::SeqCst);
    }

    /// Drop all in-memory session state: timer, queue, refreshing flag.
    /// Queued callers see `RefreshAborted`. A refresh still in flight is
    /// discarded when it finishes.
    pub fn reset(&self) {
        self.cancel_timer_task();
        let abandoned = {
            let mut state = self.state();
            state.refreshing = false;
            state.epoch += 1;
            state.latest = None;
            std::mem::take(&mut state.waiters)
        };
        self.active.store(false, Ordering::SeqCst);
        if !abandoned.is_empty() {
            debug!(waiters = abandoned.len(), "dropping queued refresh callers on reset");
        }
    }

    /// Whether a session is running (login or restore happened, no logout yet).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.state().refreshing
    }

    /// Number of callers queued behind the running refresh.
    pub fn queued_waiters(&self) -> usize {
        self.state().waiters.len()
    }

    /// Successful refreshes so far. Pass to `refresh_after_rejection`.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Stored access token, if any.
    pub async fn current_token(&self) -> Result<Option<String>> {
        self.store.get(ACCESS_TOKEN_KEY).await.map_err(Error::store)
    }

    /// Return a usable access token, refreshing first if it expires within
    /// the refresh margin. Joins a refresh already in flight.
    pub async fn ensure_fresh(self: &Arc<Self>) -> Result<String> {
        let seen = self.generation();
        let token = self.current_token().await?;
        let expires_at = session_auth::credentials::load_expiry(&*self.store)
            .await
            .map_err(Error::store)?;

        let ticket = {
            let mut state = self.state();
            if state.refreshing {
                Ticket::Follow(enqueue(&mut state))
            } else if let Some(latest) = state.latest.clone().filter(|_| state.generation != seen) {
                Ticket::Ready(latest)
            } else {
                match token {
                    None => return Err(Error::NotAuthenticated),
                    Some(token) if !self.needs_refresh(expires_at) => return Ok(token),
                    Some(_) => {
                        state.refreshing = true;
                        Ticket::Lead { epoch: state.epoch }
                    }
                }
            }
        };

        self.redeem(ticket, RefreshTrigger::OnDemand)
            .await
            .map(|pair| pair.access_token)
    }

    /// Refresh now, or join the refresh already in flight.
    pub async fn perform_refresh(self: &Arc<Self>, trigger: RefreshTrigger) -> Result<TokenPair> {
        let ticket = {
            let mut state = self.state();
            if state.refreshing {
                Ticket::Follow(enqueue(&mut state))
            } else {
                state.refreshing = true;
                Ticket::Lead { epoch: state.epoch }
            }
        };
        self.redeem(ticket, trigger).await
    }

    /// Refresh after the server rejected a token read at `seen` (see
    /// `generation`). If another refresh completed since, its tokens are
    /// returned without a second network call.
    pub async fn refresh_after_rejection(self: &Arc<Self>, seen: u64) -> Result<TokenPair> {
        let ticket = {
            let mut state = self.state();
            if state.refreshing {
                Ticket::Follow(enqueue(&mut state))
            } else if let Some(latest) = state.latest.clone().filter(|_| state.generation != seen) {
                Ticket::Ready(latest)
            } else {
                state.refreshing = true;
                Ticket::Lead { epoch: state.epoch }
            }
        };
        self.redeem(ticket, RefreshTrigger::Reactive).await
    }

    async fn redeem(self: &Arc<Self>, ticket: Ticket, trigger: RefreshTrigger) -> Result<TokenPair> {
        match ticket {
            Ticket::Ready(pair) => {
                debug!("token already refreshed by another caller");
                Ok(pair)
            }
            Ticket::Follow(rx) => {
                debug!(trigger = %trigger, "joining refresh in flight");
                rx.await
                    .map_err(|_| Error::RefreshAborted("refresh in flight did not produce a token".into()))
            }
            Ticket::Lead { epoch } => self.lead(trigger, epoch).await,
        }
    }

    async fn lead(self: &Arc<Self>, trigger: RefreshTrigger, epoch: u64) -> Result<TokenPair> {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_refresh(trigger, epoch).await });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, trigger = %trigger, "refresh task did not complete");
                self.release(epoch, None);
                metrics::record_refresh(trigger, "abandoned");
                Err(Error::RefreshAborted(e.to_string()))
            }
        }
    }

    async fn run_refresh(self: &Arc<Self>, trigger: RefreshTrigger, epoch: u64) -> Result<TokenPair> {
        info!(trigger = %trigger, "refreshing access token");

        let pair = match self.fetch_tokens().await {
            Ok(pair) => pair,
            Err(failure) => return self.fail(trigger, epoch, failure).await,
        };

        if !self.is_current(epoch) {
            return Err(self.discard(trigger, epoch));
        }
        if let Err(e) = session_auth::credentials::persist_tokens(&*self.store, &pair).await {
            return self
                .fail(trigger, epoch, RefreshFailure::Persist(e.to_string()))
                .await;
        }

        let Some(waiters) = self.release(epoch, Some(&pair)) else {
            // Session ended while the tokens were being written
            self.forget_tokens(&pair).await;
            return Err(self.discard(trigger, epoch));
        };

        metrics::record_refresh(trigger, "success");
        metrics::record_refresh_waiters(waiters.len());
        info!(
            trigger = %trigger,
            waiters = waiters.len(),
            token = %common::fingerprint(&pair.access_token),
            "access token refreshed"
        );
        for waiter in waiters {
            let _ = waiter.send(pair.clone());
        }

        if let Err(e) = self.schedule_proactive_refresh().await {
            warn!(error = %e, "failed to restart proactive refresh timer");
        }
        emit_guarded(
            &*self.events,
            SessionEvent::SilentTokenRefreshed {
                token: common::Secret::new(pair.access_token.clone()),
            },
        );
        Ok(pair)
    }

    async fn fetch_tokens(&self) -> std::result::Result<TokenPair, RefreshFailure> {
        let refresh_token = match self.store.get(REFRESH_TOKEN_KEY).await {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => return Err(RefreshFailure::MissingRefreshToken),
            Err(e) => return Err(RefreshFailure::Persist(e.to_string())),
        };
        Ok(self
            .client
            .refresh(&refresh_token, &self.config.client_id)
            .await?)
    }

    async fn fail(
        self: &Arc<Self>,
        trigger: RefreshTrigger,
        epoch: u64,
        failure: RefreshFailure,
    ) -> Result<TokenPair> {
        if !self.is_current(epoch) {
            return Err(self.discard(trigger, epoch));
        }
        let severity = classify_refresh_failure(&failure, trigger);
        // The lock stays held until the dead credentials are gone, so callers
        // arriving meanwhile queue instead of refreshing with them again
        if severity == FailureSeverity::Fatal {
            self.clear_credentials().await;
        }
        let Some(waiters) = self.release(epoch, None) else {
            return Err(self.discard(trigger, epoch));
        };
        drop(waiters);

        emit_guarded(
            &*self.events,
            SessionEvent::RefreshFailed {
                reason: failure.to_string(),
            },
        );
        match severity {
            FailureSeverity::Deferred => {
                metrics::record_refresh(trigger, "deferred");
                warn!(trigger = %trigger, error = %failure, "refresh failed, keeping session until next attempt");
            }
            FailureSeverity::Fatal => {
                metrics::record_refresh(trigger, "fatal");
                warn!(trigger = %trigger, error = %failure, "refresh failed, ending session");
                self.notify_expiry(failure.to_string());
            }
        }
        Err(Error::Refresh(failure))
    }

    /// Flip `refreshing` off and take the queue, if `epoch` is still the
    /// running session. On success the generation advances.
    fn release(
        &self,
        epoch: u64,
        pair: Option<&TokenPair>,
    ) -> Option<VecDeque<oneshot::Sender<TokenPair>>> {
        let mut state = self.state();
        if state.epoch != epoch {
            return None;
        }
        state.refreshing = false;
        if let Some(pair) = pair {
            state.generation += 1;
            state.latest = Some(pair.clone());
        }
        Some(std::mem::take(&mut state.waiters))
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.state().epoch == epoch
    }

    fn discard(&self, trigger: RefreshTrigger, epoch: u64) -> Error {
        debug!(trigger = %trigger, epoch, "session ended during refresh, discarding result");
        metrics::record_refresh(trigger, "abandoned");
        Error::RefreshAborted("session ended during refresh".into())
    }

    /// Remove tokens this refresh wrote, unless something newer replaced them.
    async fn forget_tokens(&self, pair: &TokenPair) {
        match self.store.get(ACCESS_TOKEN_KEY).await {
            Ok(Some(current)) if current == pair.access_token => {
                if let Err(e) = session_auth::credentials::clear_session(&*self.store).await {
                    warn!(error = %e, "failed to remove tokens from ended session");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to check tokens from ended session"),
        }
    }

    /// Remove every session key and stop the timer.
    async fn clear_credentials(&self) {
        if let Err(e) = session_auth::credentials::clear_session(&*self.store).await {
            error!(error = %e, "failed to clear session store");
        }
        self.cancel_timer_task();
        self.state().latest = None;
    }

    /// Tell the user the session ended, then log out once they acknowledge.
    ///
    /// Runs once per session; later failures of the same session only clear
    /// credentials.
    fn notify_expiry(&self, reason: String) {
        if !self.active.swap(false, Ordering::SeqCst) {
            debug!("session already ended, skipping logout notification");
            return;
        }
        metrics::record_forced_logout();

        let (ack, acknowledged) = Acknowledgement::new();
        let delivered = emit_guarded(
            &*self.events,
            SessionEvent::SessionExpired {
                message: SESSION_EXPIRED_MESSAGE.to_string(),
                ack,
            },
        );
        if delivered == 0 {
            info!(reason = %reason, "no listener for session expiry, logging out directly");
            emit_guarded(&*self.events, SessionEvent::ForcedLogout { reason });
            return;
        }

        let events = Arc::clone(&self.events);
        let ack_timeout = self.config.ack_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(ack_timeout, acknowledged).await {
                Ok(Ok(())) => debug!("session expiry acknowledged"),
                Ok(Err(_)) => warn!("session expiry dropped without acknowledgement"),
                Err(_) => warn!(timeout_secs = ack_timeout.as_secs(), "session expiry not acknowledged in time"),
            }
            info!(reason = %reason, "forced logout");
            emit_guarded(&*events, SessionEvent::ForcedLogout { reason });
        });
    }

    fn needs_refresh(&self, expires_at: Option<u64>) -> bool {
        // Unknown expiry: trust the token until the server says otherwise
        let Some(expires_at) = expires_at else {
            return false;
        };
        let margin = self.config.refresh_margin.as_millis() as u64;
        expires_at <= session_auth::now_millis() + margin
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn enqueue(state: &mut LockState) -> oneshot::Receiver<TokenPair> {
    let (tx, rx) = oneshot::channel();
    state.waiters.push_back(tx);
    rx
}
