//! Authenticated forwarding
//!
//! Turns an inbound request into an `ApiRequest`, sends it through the
//! session's `AuthPipeline` (bearer token, refresh-and-retry on 401), and
//! maps the outcome back to an HTTP response. Hop-by-hop headers are
//! stripped both ways; an inbound `authorization` header is replaced by the
//! session token.

use api_transport::{ApiError, ApiRequest, ApiResponse, HeaderMap};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use session_core::AuthPipeline;
use std::time::Instant;
use tracing::{error, instrument, warn};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers the transport or pipeline sets itself
const REPLACED_HEADERS: &[&str] = &["host", "content-length", "authorization"];

/// Largest inbound body accepted
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Forward an inbound request to the remote API with session credentials.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn forward_request(
    pipeline: &AuthPipeline,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && !is_replaced(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let mut api_request = ApiRequest::new(method.clone(), path);
    api_request.headers = headers;
    if !body.is_empty() {
        api_request.body = Some(body);
    }

    let response = match pipeline.execute(api_request).await {
        Ok(upstream) => into_response(upstream, &request_id),
        Err(e) => api_error_response(e, &request_id),
    };
    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

fn into_response(upstream: ApiResponse, request_id: &str) -> Response {
    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) && *name != axum::http::header::CONTENT_LENGTH {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "agent_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Map a pipeline failure to a response. Upstream error statuses pass
/// through with their headers and body untouched.
fn api_error_response(err: ApiError, request_id: &str) -> Response {
    let message = err.user_message();
    match err {
        ApiError::Status {
            status,
            headers,
            body,
        } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            into_response(
                ApiResponse {
                    status,
                    headers,
                    body,
                },
                request_id,
            )
        }
        ApiError::AuthenticationRequired(reason) => {
            metrics::record_upstream_error("authentication_required");
            warn!(reason = %reason, "session ended while forwarding");
            error_response(
                StatusCode::UNAUTHORIZED,
                "authentication_required",
                message,
                request_id,
            )
        }
        ApiError::NoResponse(detail) => {
            metrics::record_upstream_error("no_response");
            error!(error = %detail, "remote API unreachable");
            error_response(StatusCode::BAD_GATEWAY, "no_response", message, request_id)
        }
        ApiError::Setup(detail) => {
            metrics::record_upstream_error("setup");
            error!(error = %detail, "could not build upstream request");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "agent_error",
                message,
                request_id,
            )
        }
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_replaced(name: &str) -> bool {
    REPLACED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}
