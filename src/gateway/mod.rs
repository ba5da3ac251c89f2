//! HTTP gateway to the auction backend.
//!
//! One `reqwest::Client` with a single outgoing-request hook: resolve the
//! stored bearer token and attach it, unless the request opts out
//! (registration is unauthenticated). Responses are never interpreted
//! here: any response received, 2xx or not, passes through untouched as
//! an [`ApiResponse`]; only a transport-level failure (no response at
//! all) is an error. No retries.

use reqwest::multipart::Form;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::ApiConfig;
use crate::store::SessionStore;

/// Transport-level failures: nothing was received from the backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No response from server. Check if the backend is running.")]
    Unreachable(#[source] reqwest::Error),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Failed to read session store: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Failed to serialize request body: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to prepare request body: {0}")]
    Body(#[source] anyhow::Error),
}

/// Raw backend response: status plus parsed body. Non-2xx statuses are
/// data here, not errors; classification happens in the caller.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Best human-readable message out of a backend error body.
    pub fn error_message(&self) -> String {
        self.body
            .get("error")
            .or_else(|| self.body.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Server error: {}", self.status.as_u16()))
    }
}

/// Whether the outgoing request carries the stored bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAuth {
    Bearer,
    /// Registration must be sent without an Authorization header.
    None,
}

/// Thin client over the backend REST API. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    http: reqwest::Client,
    base_url: String,
    store: SessionStore,
}

impl Gateway {
    pub fn new(config: &ApiConfig, store: SessionStore) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(TransportError::Client)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            store,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        auth: RequestAuth,
        body: Option<RequestBody>,
    ) -> Result<ApiResponse, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), &url);

        if auth == RequestAuth::Bearer {
            if let Some(token) = self.store.token().await.map_err(TransportError::Store)? {
                request = request.bearer_auth(token);
            }
        }

        // JSON bodies get the JSON content type; multipart bodies must
        // not, so reqwest can set the boundary itself.
        request = match body {
            Some(RequestBody::Json(value)) => request.json(&value),
            Some(RequestBody::Multipart(form)) => request.multipart(form),
            None => request,
        };

        debug!(%method, %url, "Sending request");

        let response = request.send().await.map_err(TransportError::Unreachable)?;
        let status = response.status();
        let text = response.text().await.map_err(TransportError::Unreachable)?;
        let body = if text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };

        debug!(%status, "Received response");
        Ok(ApiResponse { status, body })
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, TransportError> {
        self.execute(Method::GET, path, RequestAuth::Bearer, None).await
    }

    pub async fn post_json<B: Serialize>(
        &self,
        path: &str,
        auth: RequestAuth,
        body: &B,
    ) -> Result<ApiResponse, TransportError> {
        let value = serde_json::to_value(body).map_err(TransportError::Serialize)?;
        self.execute(Method::POST, path, auth, Some(RequestBody::Json(value)))
            .await
    }

    pub async fn post_multipart(
        &self,
        path: &str,
        auth: RequestAuth,
        form: Form,
    ) -> Result<ApiResponse, TransportError> {
        self.execute(Method::POST, path, auth, Some(RequestBody::Multipart(form)))
            .await
    }

    pub async fn put_json<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse, TransportError> {
        let value = serde_json::to_value(body).map_err(TransportError::Serialize)?;
        self.execute(
            Method::PUT,
            path,
            RequestAuth::Bearer,
            Some(RequestBody::Json(value)),
        )
        .await
    }

    pub async fn put_multipart(
        &self,
        path: &str,
        form: Form,
    ) -> Result<ApiResponse, TransportError> {
        self.execute(
            Method::PUT,
            path,
            RequestAuth::Bearer,
            Some(RequestBody::Multipart(form)),
        )
        .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, TransportError> {
        self.execute(Method::DELETE, path, RequestAuth::Bearer, None).await
    }
}

enum RequestBody {
    Json(serde_json::Value),
    Multipart(Form),
}
