//! Proactive refresh timer
//!
//! One timer per session, armed for the token lifetime after every login and
//! successful refresh. Arming always replaces the previous timer. The expiry
//! it targets is persisted so a restarted process can pick the schedule back
//! up with `resume_proactive_refresh`.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use session_auth::credentials::{load_expiry, persist_expiry};
use session_auth::{REFRESH_TOKEN_KEY, TOKEN_EXPIRY_KEY, now_millis};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::RefreshCoordinator;
use crate::error::{Error, Result};
use crate::policy::RefreshTrigger;

/// The armed timer task and the id it was armed with.
pub(crate) struct TimerSlot {
    id: u64,
    handle: JoinHandle<()>,
}

impl RefreshCoordinator {
    /// Persist `now + token_lifetime` as the expiry and arm the timer for it,
    /// replacing any armed timer.
    pub async fn schedule_proactive_refresh(self: &Arc<Self>) -> Result<()> {
        self.cancel_timer_task();
        let lifetime = self.config.token_lifetime;
        let expires_at = now_millis() + lifetime.as_millis() as u64;
        persist_expiry(&*self.store, expires_at)
            .await
            .map_err(Error::store)?;
        self.arm_timer(lifetime);
        debug!(expires_at, "proactive refresh scheduled");
        Ok(())
    }

    /// Re-arm after a restart or on the first request of a process.
    ///
    /// Does nothing if a timer is armed or no session is stored. A persisted
    /// expiry far enough out arms the timer for the remaining time; one
    /// inside the refresh margin refreshes right away; no expiry at all
    /// starts a fresh schedule.
    pub async fn resume_proactive_refresh(self: &Arc<Self>) -> Result<()> {
        if self.has_armed_timer() {
            return Ok(());
        }
        if self.current_token().await?.is_none() {
            return Ok(());
        }

        let now = now_millis();
        let margin = self.config.refresh_margin.as_millis() as u64;
        match load_expiry(&*self.store).await.map_err(Error::store)? {
            Some(expires_at) if expires_at > now + margin => {
                let remaining = Duration::from_millis(expires_at - now);
                debug!(remaining_secs = remaining.as_secs(), "resuming proactive refresh timer");
                self.arm_timer(remaining);
            }
            Some(_) => {
                info!("stored token at or near expiry, refreshing now");
                self.perform_refresh(RefreshTrigger::Proactive).await?;
            }
            None => self.schedule_proactive_refresh().await?,
        }
        Ok(())
    }

    /// Stop the timer and forget the persisted expiry.
    pub async fn cancel_proactive_refresh(&self) -> Result<()> {
        self.cancel_timer_task();
        self.store
            .remove(TOKEN_EXPIRY_KEY)
            .await
            .map_err(Error::store)
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn has_armed_timer(&self) -> bool {
        self.timer_slot()
            .as_ref()
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Stop the timer but keep the persisted expiry, so a later
    /// `resume_proactive_refresh` picks up where this one left off.
    pub fn cancel_timer_task(&self) {
        if let Some(slot) = self.timer_slot().take() {
            slot.handle.abort();
            debug!(timer = slot.id, "proactive refresh timer cancelled");
        }
    }

    fn arm_timer(self: &Arc<Self>, delay: Duration) {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let coordinator = Arc::downgrade(self);
        // Deadline is fixed at arm time to match the persisted expiry
        let deadline = tokio::time::Instant::now() + delay;

        // Hold the slot while spawning so the task cannot look for itself
        // before it is registered
        let mut slot = self.timer_slot();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.on_timer_fired(id).await;
            }
        });
        if let Some(previous) = slot.replace(TimerSlot { id, handle }) {
            previous.handle.abort();
        }
    }

    async fn on_timer_fired(self: Arc<Self>, id: u64) {
        {
            let mut slot = self.timer_slot();
            if !slot.as_ref().is_some_and(|current| current.id == id) {
                debug!(timer = id, "superseded timer fired, ignoring");
                return;
            }
            // Detach so the reschedule after a successful refresh does not
            // abort this task
            slot.take();
        }

        if self.is_refreshing() {
            debug!("refresh already in flight, skipping proactive refresh");
            return;
        }
        match self.store.get(REFRESH_TOKEN_KEY).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("no refresh token stored, skipping proactive refresh");
                return;
            }
            Err(e) => {
                warn!(error = %e, "cannot read refresh token, skipping proactive refresh");
                return;
            }
        }

        if let Err(e) = self.perform_refresh(RefreshTrigger::Proactive).await {
            warn!(error = %e, "proactive refresh failed");
        }
    }

    fn timer_slot(&self) -> std::sync::MutexGuard<'_, Option<TimerSlot>> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }
}
