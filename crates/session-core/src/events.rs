//! Session event bus
//!
//! Decouples the token machinery from whatever presents session changes to
//! the user. Events are fanned out over a `tokio::sync::broadcast` channel;
//! publishing never blocks and never fails loudly. `emit_guarded` logs a
//! failed publish and carries on.

use std::sync::{Arc, Mutex};

use common::Secret;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Capacity of the broadcast ring buffer. Session events are rare.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Session state changes published by the core.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session can no longer be refreshed. The consumer shows `message`
    /// and calls `ack.acknowledge()` once the user has seen it.
    SessionExpired {
        message: String,
        ack: Acknowledgement,
    },
    /// Final logout signal; consumers reset to the signed-out flow.
    ForcedLogout { reason: String },
    /// A refresh succeeded without user involvement.
    SilentTokenRefreshed { token: Secret<String> },
    /// A refresh attempt failed (fatal or not).
    RefreshFailed { reason: String },
}

impl SessionEvent {
    /// Stable event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SessionExpired { .. } => "session_expired",
            SessionEvent::ForcedLogout { .. } => "forced_logout",
            SessionEvent::SilentTokenRefreshed { .. } => "silent_token_refreshed",
            SessionEvent::RefreshFailed { .. } => "refresh_failed",
        }
    }
}

/// One-shot acknowledgement handle carried by `SessionExpired`.
///
/// Clones share the same underlying sender; the first `acknowledge()` wins.
#[derive(Clone)]
pub struct Acknowledgement {
    sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl Acknowledgement {
    /// Create a handle and the receiver that resolves on acknowledgement.
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Acknowledge. Returns false if already acknowledged or nobody waits.
    pub fn acknowledge(&self) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Whether nobody has acknowledged yet.
    pub fn is_pending(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl std::fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acknowledgement")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Errors from publishing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventError {
    #[error("no subscribers for {0}")]
    NoSubscribers(&'static str),
}

/// Publish/subscribe channel for session events.
pub trait EventBus: Send + Sync {
    /// Publish an event. Returns how many subscribers received it.
    fn publish(&self, event: SessionEvent) -> Result<usize, EventError>;

    /// Subscribe to all events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}

/// In-process bus on a tokio broadcast channel.
pub struct BroadcastBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: SessionEvent) -> Result<usize, EventError> {
        let name = event.name();
        self.tx
            .send(event)
            .map_err(|_| EventError::NoSubscribers(name))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

/// Publish without propagating failure. Returns the delivery count (0 when
/// the publish failed).
pub fn emit_guarded(bus: &dyn EventBus, event: SessionEvent) -> usize {
    let name = event.name();
    match bus.publish(event) {
        Ok(delivered) => {
            debug!(event = name, delivered, "session event published");
            delivered
        }
        Err(e) => {
            warn!(event = name, error = %e, "session event not delivered");
            0
        }
    }
}
