//! Test doubles shared by the unit tests in this crate.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_transport::{ApiError, ApiRequest, ApiResponse, StatusCode, Transport};
use session_auth::{
    AuthClient, KeyValueStore, LoginRequest, LoginResult, MemoryStore, RegisterRequest, TokenPair,
    UserRecord,
};
use tokio::sync::{Semaphore, broadcast};

use crate::coordinator::{CoordinatorConfig, RefreshCoordinator};
use crate::events::{EventBus, EventError, SessionEvent};

pub(crate) const BARE_EMAIL: &str = "bare@example.com";

/// Scripted auth server. Refresh issues `at_N`/`rt_N` for the Nth call
/// unless a failure was queued with `fail_next`. Logins for `BARE_EMAIL`
/// carry no user record or profile.
pub(crate) struct MockAuthClient {
    refresh_calls: AtomicUsize,
    login_calls: AtomicUsize,
    failures: Mutex<VecDeque<session_auth::Error>>,
    refresh_tokens_seen: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockAuthClient {
    pub(crate) fn new() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            refresh_tokens_seen: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Refresh calls block until a permit is added to the returned gate.
    pub(crate) fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let client = Self {
            gate: Some(gate.clone()),
            ..Self::new()
        };
        (client, gate)
    }

    pub(crate) fn fail_next(&self, error: session_auth::Error) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens_seen.lock().unwrap().clone()
    }
}

impl AuthClient for MockAuthClient {
    fn login<'a>(
        &'a self,
        request: &'a LoginRequest,
        _client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<LoginResult>> + Send + 'a>> {
        Box::pin(async move {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            if request.password.expose() == "wrong" {
                return Err(session_auth::Error::Rejected("Invalid credentials".into()));
            }
            if request.email == BARE_EMAIL {
                return Ok(LoginResult {
                    tokens: TokenPair::new("at_bare", "rt_bare"),
                    user: None,
                    profile: None,
                });
            }
            Ok(LoginResult {
                tokens: TokenPair::new("at_login", "rt_login"),
                user: Some(UserRecord {
                    email: Some(request.email.clone()),
                    ..UserRecord::default()
                }),
                profile: Some(serde_json::json!({"theme": "dark"})),
            })
        })
    }

    fn register<'a>(
        &'a self,
        request: &'a RegisterRequest,
        _client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if request.email == "taken@example.com" {
                return Err(session_auth::Error::Rejected("Email already registered".into()));
            }
            Ok(())
        })
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
        _client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<TokenPair>> + Send + 'a>> {
        Box::pin(async move {
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.refresh_tokens_seen
                .lock()
                .unwrap()
                .push(refresh_token.to_string());
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if let Some(error) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            Ok(TokenPair::new(format!("at_{n}"), format!("rt_{n}")))
        })
    }
}

/// Bus that records every published event and also broadcasts it.
pub(crate) struct RecordingBus {
    events: Mutex<Vec<SessionEvent>>,
    tx: broadcast::Sender<SessionEvent>,
}

impl RecordingBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            events: Mutex::new(Vec::new()),
            tx,
        }
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(SessionEvent::name).collect()
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl EventBus for RecordingBus {
    fn publish(&self, event: SessionEvent) -> Result<usize, EventError> {
        let name = event.name();
        self.events.lock().unwrap().push(event.clone());
        self.tx.send(event).map_err(|_| EventError::NoSubscribers(name))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

/// Transport that accepts any bearer token except the rejected ones.
///
/// - `/fail` answers 500
/// - `/offline` fails without a response
/// - `/always-401` answers 401 whatever the token
pub(crate) struct ScriptedTransport {
    rejected: Mutex<HashSet<String>>,
    sent: Mutex<Vec<Option<String>>>,
}

impl ScriptedTransport {
    pub(crate) fn rejecting(tokens: &[&str]) -> Self {
        Self {
            rejected: Mutex::new(tokens.iter().map(|t| t.to_string()).collect()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Bearer tokens of every request sent, in order.
    pub(crate) fn sent_tokens(&self) -> Vec<Option<String>> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn id(&self) -> &str {
        "scripted"
    }

    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> Pin<Box<dyn Future<Output = api_transport::Result<ApiResponse>> + Send + 'a>> {
        Box::pin(async move {
            let bearer = request.bearer().map(str::to_string);
            self.sent.lock().unwrap().push(bearer.clone());
            // Let concurrent requests interleave the way a network would
            tokio::task::yield_now().await;

            let status = match request.path.as_str() {
                "/offline" => return Err(ApiError::NoResponse("connection reset".into())),
                "/fail" => 500,
                "/always-401" => 401,
                _ => match &bearer {
                    Some(token) if !self.rejected.lock().unwrap().contains(token) => 200,
                    _ => 401,
                },
            };
            Ok(response(status, &bearer))
        })
    }
}

fn response(status: u16, bearer: &Option<String>) -> ApiResponse {
    let body = serde_json::json!({ "token": bearer }).to_string();
    ApiResponse::new(StatusCode::from_u16(status).unwrap(), body)
}

pub(crate) async fn seeded_store(access: &str, refresh: &str, expires_at: Option<u64>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    session_auth::credentials::persist_tokens(&*store, &TokenPair::new(access, refresh))
        .await
        .unwrap();
    if let Some(expires_at) = expires_at {
        session_auth::credentials::persist_expiry(&*store, expires_at)
            .await
            .unwrap();
    }
    store
}

pub(crate) fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        client_id: "test-client".into(),
        ack_timeout: Duration::from_secs(5),
        ..CoordinatorConfig::default()
    }
}

pub(crate) fn coordinator(
    store: Arc<MemoryStore>,
    client: Arc<MockAuthClient>,
    bus: Arc<RecordingBus>,
) -> Arc<RefreshCoordinator> {
    let store: Arc<dyn KeyValueStore> = store;
    RefreshCoordinator::new(store, client, bus, test_config())
}

/// Memory store whose bulk remove waits for a permit on `gate`.
pub(crate) struct SlowClearStore {
    pub(crate) inner: Arc<MemoryStore>,
    pub(crate) gate: Arc<Semaphore>,
    pub(crate) clears_started: AtomicUsize,
}

impl SlowClearStore {
    pub(crate) fn wrap(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            gate: Arc::new(Semaphore::new(0)),
            clears_started: AtomicUsize::new(0),
        }
    }
}

impl KeyValueStore for SlowClearStore {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<Option<String>>> + Send + 'a>> {
        self.inner.get(key)
    }

    fn set_many<'a>(
        &'a self,
        entries: Vec<(&'a str, String)>,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + 'a>> {
        self.inner.set_many(entries)
    }

    fn remove_many<'a>(
        &'a self,
        keys: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.clears_started.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            self.inner.remove_many(keys).await
        })
    }
}
