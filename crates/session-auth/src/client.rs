//! Auth Remote Client: login, registration, and token refresh
//!
//! Every auth endpoint answers with the same envelope:
//! `{"success": bool, "data": {...}, "message": "..."}`. Token fields may be
//! camelCase (`accessToken`) or snake_case (`access_token`) depending on the
//! server version. Both are accepted here and normalized into `TokenPair`, so
//! nothing past this module ever sees the difference.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::constants::{INVALID_REFRESH_PATTERNS, LOGIN_PATH, REFRESH_PATH, REGISTER_PATH};
use crate::credentials::{LoginResult, TokenPair, UserRecord};
use crate::error::{Error, Result};

/// Login credentials.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: Secret<String>,
}

/// Account registration details.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub email: String,
    pub password: Secret<String>,
    pub name: String,
    pub language: Option<String>,
}

/// Abstraction over the remote auth API.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn AuthClient>`), so tests can script refresh outcomes.
pub trait AuthClient: Send + Sync {
    /// Exchange email + password for tokens, user, and profile.
    fn login<'a>(
        &'a self,
        request: &'a LoginRequest,
        client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<LoginResult>> + Send + 'a>>;

    /// Create an account. Does not sign in.
    fn register<'a>(
        &'a self,
        request: &'a RegisterRequest,
        client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Exchange a refresh token for a new token pair.
    ///
    /// Returns `InvalidRefreshToken` when the server explicitly says the
    /// refresh token is dead; every other failure uses the other variants.
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
        client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenPair>> + Send + 'a>>;
}

/// Endpoint paths relative to the API base URL.
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub login: String,
    pub register: String,
    pub refresh: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login: LOGIN_PATH.to_string(),
            register: REGISTER_PATH.to_string(),
            refresh: REFRESH_PATH.to_string(),
        }
    }
}

/// Which call a response belongs to; decides what a 401 means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Login,
    Register,
    Refresh,
}

/// `{success, data, message}` response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: Option<bool>,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

/// Token fields in either naming convention.
#[derive(Debug, Default, Deserialize)]
struct RawTokens {
    #[serde(rename = "accessToken")]
    access_camel: Option<String>,
    #[serde(rename = "access_token")]
    access_snake: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_camel: Option<String>,
    #[serde(rename = "refresh_token")]
    refresh_snake: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLoginData {
    #[serde(flatten)]
    tokens: RawTokens,
    #[serde(default)]
    user: Option<UserRecord>,
    #[serde(default)]
    profile: Option<serde_json::Value>,
}

impl RawTokens {
    /// Collapse both conventions into one pair. Empty strings count as missing.
    fn normalize(self) -> Result<TokenPair> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let access = non_empty(self.access_camel).or(non_empty(self.access_snake));
        let refresh = non_empty(self.refresh_camel).or(non_empty(self.refresh_snake));
        match (access, refresh) {
            (Some(access_token), Some(refresh_token)) => Ok(TokenPair {
                access_token,
                refresh_token,
            }),
            (None, _) => Err(Error::MalformedResponse(
                "response has neither accessToken nor access_token".into(),
            )),
            (_, None) => Err(Error::MalformedResponse(
                "response has neither refreshToken nor refresh_token".into(),
            )),
        }
    }
}

/// Normalize a refresh response body into a token pair.
pub fn parse_refresh_body(body: &str) -> Result<TokenPair> {
    let data: RawTokens = parse_envelope(body, Operation::Refresh)?;
    data.normalize()
}

/// Normalize a login response body.
pub fn parse_login_body(body: &str) -> Result<LoginResult> {
    let data: RawLoginData = parse_envelope(body, Operation::Login)?;
    Ok(LoginResult {
        tokens: data.tokens.normalize()?,
        user: data.user,
        profile: data.profile,
    })
}

/// Whether a server message says the refresh token is invalid or expired.
pub fn is_invalid_refresh_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    INVALID_REFRESH_PATTERNS.iter().any(|p| lower.contains(p))
}

fn parse_envelope<T: DeserializeOwned>(body: &str, op: Operation) -> Result<T> {
    let envelope: Envelope<T> = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("{op:?} response is not valid JSON: {e}")))?;
    if envelope.success == Some(false) {
        let message = envelope
            .message
            .unwrap_or_else(|| format!("{op:?} unsuccessful"));
        return Err(rejection(op, None, message));
    }
    envelope
        .data
        .ok_or_else(|| Error::MalformedResponse(format!("{op:?} response has no data")))
}

/// Map a refused call to an error variant.
fn rejection(op: Operation, status: Option<u16>, message: String) -> Error {
    if op == Operation::Refresh
        && (matches!(status, Some(401) | Some(403)) || is_invalid_refresh_message(&message))
    {
        return Error::InvalidRefreshToken(message);
    }
    match status {
        Some(status) => Error::Rejected(format!("{op:?} returned {status}: {message}")),
        None => Error::Rejected(message),
    }
}

/// Auth client speaking JSON over reqwest.
pub struct HttpAuthClient {
    client: reqwest::Client,
    base_url: String,
    endpoints: AuthEndpoints,
    timeout: Duration,
}

impl HttpAuthClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            endpoints: AuthEndpoints::default(),
            timeout,
        }
    }

    pub fn with_endpoints(mut self, endpoints: AuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// POST a JSON body and return the raw response text of a 2xx answer.
    async fn post(&self, op: Operation, path: &str, body: serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{op:?} request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading {op:?} response: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(&text)
                .ok()
                .and_then(|env| env.message)
                .unwrap_or(text);
            warn!(operation = ?op, status = status.as_u16(), "auth call rejected");
            return Err(rejection(op, Some(status.as_u16()), message));
        }

        debug!(operation = ?op, status = status.as_u16(), "auth call succeeded");
        Ok(text)
    }
}

impl AuthClient for HttpAuthClient {
    fn login<'a>(
        &'a self,
        request: &'a LoginRequest,
        client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<LoginResult>> + Send + 'a>> {
        Box::pin(async move {
            let body = serde_json::json!({
                "email": request.email,
                "password": request.password.expose(),
                "clientId": client_id,
            });
            let text = self.post(Operation::Login, &self.endpoints.login, body).await?;
            parse_login_body(&text)
        })
    }

    fn register<'a>(
        &'a self,
        request: &'a RegisterRequest,
        client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let body = serde_json::json!({
                "email": request.email,
                "password": request.password.expose(),
                "name": request.name,
                "language": request.language,
                "clientId": client_id,
            });
            let text = self
                .post(Operation::Register, &self.endpoints.register, body)
                .await?;
            // Registration data is not used; only the success flag matters
            let envelope: Envelope<serde_json::Value> = serde_json::from_str(&text).map_err(|e| {
                Error::MalformedResponse(format!("Register response is not valid JSON: {e}"))
            })?;
            if envelope.success == Some(false) {
                let message = envelope
                    .message
                    .unwrap_or_else(|| "registration unsuccessful".into());
                return Err(rejection(Operation::Register, None, message));
            }
            Ok(())
        })
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
        client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenPair>> + Send + 'a>> {
        Box::pin(async move {
            let body = serde_json::json!({
                "refreshToken": refresh_token,
                "clientId": client_id,
            });
            let text = self
                .post(Operation::Refresh, &self.endpoints.refresh, body)
                .await?;
            parse_refresh_body(&text)
        })
    }
}
