//! Transport abstraction for remote API calls
//!
//! Defines the `Transport` trait that decouples the session pipeline from the
//! concrete HTTP client. `ReqwestTransport` is the production implementation;
//! tests substitute scripted transports. A transport returns every received
//! response as `Ok`, whatever its status; deciding what a status means is the
//! caller's job.

pub mod reqwest_transport;

pub use reqwest::header::HeaderMap;
pub use reqwest::{Method, StatusCode};
pub use reqwest_transport::ReqwestTransport;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;

/// Failures observed while talking to the remote API.
///
/// The first three mirror what an HTTP client can report: a response with an
/// error status, no response at all, or a request that could not be built.
/// All get distinct user-facing messages but share one retry policy: only a
/// 401 is ever retried, and only once.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Error response, with headers and body as received.
    #[error("server responded with status {status}")]
    Status {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },

    #[error("no response received: {0}")]
    NoResponse(String),

    #[error("request setup failed: {0}")]
    Setup(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),
}

impl ApiError {
    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            ApiError::Status { .. } => "The server returned an error. Please try again.",
            ApiError::NoResponse(_) => {
                "Unable to reach the server. Check your connection and try again."
            }
            ApiError::Setup(_) => "The request could not be sent.",
            ApiError::AuthenticationRequired(_) => "Your session has ended. Please sign in again.",
        }
    }

    /// HTTP status carried by the error, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// An outgoing API request, relative to the transport's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path and query, e.g. `/users/me?include=profile`
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Replace the Authorization header with a bearer credential.
    pub fn set_bearer(&mut self, token: &str) -> Result<()> {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ApiError::Setup(format!("invalid bearer token: {e}")))?;
        value.set_sensitive(true);
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    /// The bearer token currently attached, if any.
    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }

    /// Whether this request has already been resubmitted after a 401.
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub fn mark_retried(&mut self) {
        self.retried = true;
    }
}

/// A response received from the remote API (any status).
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Turn an error response into `ApiError::Status`, keeping headers and
    /// raw body.
    pub fn into_error(self) -> ApiError {
        ApiError::Status {
            status: self.status.as_u16(),
            headers: self.headers,
            body: self.body,
        }
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ApiError::Setup(format!("invalid JSON response body: {e}")))
    }
}

/// Abstraction over the HTTP client used for API calls.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Identifier for logging (e.g. "reqwest")
    fn id(&self) -> &str;

    /// Send one request and return whatever response arrives.
    ///
    /// Errors only when no response was received (`NoResponse`) or the request
    /// could not be built (`Setup`).
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>>;
}
