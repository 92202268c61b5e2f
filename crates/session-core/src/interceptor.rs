//! Authenticated request pipeline
//!
//! Every API call goes through `AuthPipeline::execute`:
//! 1. Make sure the proactive timer runs (first request after a restart)
//! 2. Attach the stored access token as a bearer token
//! 3. Send
//! 4. On 401, refresh (or join the refresh in flight) and resend once
//!
//! A request is never retried twice; a second 401 goes back to the caller.

use std::sync::Arc;

use api_transport::{ApiError, ApiRequest, ApiResponse, StatusCode, Transport};
use tracing::{debug, warn};

use crate::coordinator::RefreshCoordinator;
use crate::metrics;

/// Sends requests with session credentials attached.
#[derive(Clone)]
pub struct AuthPipeline {
    transport: Arc<dyn Transport>,
    coordinator: Arc<RefreshCoordinator>,
}

impl AuthPipeline {
    pub fn new(transport: Arc<dyn Transport>, coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            transport,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Send a request, refreshing and retrying once on 401.
    ///
    /// Non-2xx responses come back as `ApiError::Status`. If the refresh after
    /// a 401 fails the caller gets `AuthenticationRequired`; by then the
    /// session has already been cleared.
    pub async fn execute(&self, mut request: ApiRequest) -> api_transport::Result<ApiResponse> {
        let seen = self.prepare(&mut request).await?;
        let response = self.transport.send(&request).await?;

        if response.status != StatusCode::UNAUTHORIZED || request.is_retried() {
            return into_result(response);
        }

        request.mark_retried();
        debug!(
            method = %request.method,
            path = %request.path,
            transport = self.transport.id(),
            "request unauthorized, refreshing token"
        );

        let tokens = match self.coordinator.refresh_after_rejection(seen).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(path = %request.path, error = %e, "token refresh after 401 failed");
                return Err(ApiError::AuthenticationRequired(e.to_string()));
            }
        };

        request.set_bearer(&tokens.access_token)?;
        metrics::record_request_retry();
        into_result(self.transport.send(&request).await?)
    }

    /// Outgoing phase. Returns the refresh generation the attached token
    /// belongs to.
    async fn prepare(&self, request: &mut ApiRequest) -> api_transport::Result<u64> {
        if let Err(e) = self.coordinator.resume_proactive_refresh().await {
            warn!(error = %e, "could not resume proactive refresh");
        }

        let seen = self.coordinator.generation();
        match self.coordinator.current_token().await {
            Ok(Some(token)) => request.set_bearer(&token)?,
            Ok(None) => debug!(path = %request.path, "no access token, sending unauthenticated"),
            Err(e) => warn!(error = %e, "could not read access token"),
        }
        Ok(seen)
    }
}

fn into_result(response: ApiResponse) -> api_transport::Result<ApiResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(response.into_error())
    }
}
