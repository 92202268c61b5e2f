//! Reqwest-backed transport
//!
//! Joins the request path onto a fixed base URL and enforces a per-request
//! timeout. A timeout counts as "no response", the same as a refused
//! connection.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::debug;

use crate::{ApiError, ApiRequest, ApiResponse, Result, Transport};

/// Transport sending requests with a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Absolute URL for a request path.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl Transport for ReqwestTransport {
    fn id(&self) -> &str {
        "reqwest"
    }

    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.url_for(&request.path);
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(request.headers.clone())
                .timeout(self.timeout);
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await.map_err(map_send_error)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| ApiError::NoResponse(format!("reading response body: {e}")))?;

            debug!(method = %request.method, url = %url, status = status.as_u16(), "api response");
            Ok(ApiResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn map_send_error(e: reqwest::Error) -> ApiError {
    if e.is_builder() {
        ApiError::Setup(e.to_string())
    } else if e.is_timeout() {
        ApiError::NoResponse(format!("request timed out: {e}"))
    } else {
        ApiError::NoResponse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use tokio::net::TcpListener;

    /// Start a server that echoes method, path, and Authorization back as JSON,
    /// answering `/fail` with a 500.
    async fn start_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|request: axum::http::Request<Body>| async move {
                if request.uri().path() == "/fail" {
                    return (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string());
                }
                let auth = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let body = serde_json::json!({
                    "method": request.method().as_str(),
                    "path": request.uri().path(),
                    "authorization": auth,
                });
                (StatusCode::OK, body.to_string())
            });
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    #[test]
    fn url_for_joins_without_double_slash() {
        let transport =
            ReqwestTransport::new(reqwest::Client::new(), "https://api.example.com/", Duration::from_secs(5));
        assert_eq!(transport.url_for("/users/me"), "https://api.example.com/users/me");
        assert_eq!(transport.url_for("users/me"), "https://api.example.com/users/me");
    }

    #[tokio::test]
    async fn sends_request_with_headers() {
        let base = start_echo_server().await;
        let transport = ReqwestTransport::new(reqwest::Client::new(), base, Duration::from_secs(5));

        let mut request = ApiRequest::get("/users/me");
        request.set_bearer("at_123").unwrap();
        let response = transport.send(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        let echoed: serde_json::Value = response.json().unwrap();
        assert_eq!(echoed["path"], "/users/me");
        assert_eq!(echoed["authorization"], "Bearer at_123");
    }

    #[tokio::test]
    async fn error_status_is_returned_as_response() {
        let base = start_echo_server().await;
        let transport = ReqwestTransport::new(reqwest::Client::new(), base, Duration::from_secs(5));

        let response = transport.send(&ApiRequest::get("/fail")).await.unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&response.body[..], b"boom");
    }

    #[tokio::test]
    async fn refused_connection_is_no_response() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ReqwestTransport::new(
            reqwest::Client::new(),
            format!("http://{addr}"),
            Duration::from_secs(2),
        );
        let err = transport.send(&ApiRequest::get("/")).await.unwrap_err();
        assert!(matches!(err, ApiError::NoResponse(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn unparseable_url_is_setup_error() {
        let transport =
            ReqwestTransport::new(reqwest::Client::new(), "not a url", Duration::from_secs(2));
        let err = transport.send(&ApiRequest::get("/x")).await.unwrap_err();
        assert!(matches!(err, ApiError::Setup(_)), "got: {err:?}");
    }
}
