//! Auth service: thin request wrappers over the gateway.
//!
//! This is the only layer that speaks auth HTTP verbs. It holds no state
//! and never interprets responses: status and body are forwarded raw to
//! the lifecycle controller, which owns classification. The transport
//! seam is a trait so the controller can be exercised against a mock.

pub mod lifecycle;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use std::path::Path;

use crate::gateway::{ApiResponse, Gateway, RequestAuth, TransportError};

/// Registration payload, mirroring the backend's user fields.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firstname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lastname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cin: Option<i64>,
}

#[async_trait]
pub trait AuthTransport: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<ApiResponse, TransportError>;

    /// Register a new account. Always sent without an Authorization
    /// header; multipart when a profile photo is attached.
    async fn register(
        &self,
        request: &RegisterRequest,
        photo: Option<&Path>,
    ) -> Result<ApiResponse, TransportError>;

    /// Activate the account server-side, keyed by email.
    async fn verify_account(&self, email: &str) -> Result<ApiResponse, TransportError>;
}

/// Production transport over the HTTP gateway.
pub struct HttpAuthTransport {
    gateway: Gateway,
}

impl HttpAuthTransport {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[async_trait]
impl AuthTransport for HttpAuthTransport {
    async fn login(&self, email: &str, password: &str) -> Result<ApiResponse, TransportError> {
        self.gateway
            .post_json(
                "/api/auth/login",
                RequestAuth::Bearer,
                &LoginRequest { email, password },
            )
            .await
    }

    async fn register(
        &self,
        request: &RegisterRequest,
        photo: Option<&Path>,
    ) -> Result<ApiResponse, TransportError> {
        match photo {
            Some(path) => {
                let user_json = serde_json::to_string(request)
                    .map_err(TransportError::Serialize)?;
                let form = Form::new()
                    .text("user", user_json)
                    .part("photo", file_part(path).await.map_err(TransportError::Body)?);
                self.gateway
                    .post_multipart("/api/auth/register", RequestAuth::None, form)
                    .await
            }
            None => {
                self.gateway
                    .post_json("/api/auth/register", RequestAuth::None, request)
                    .await
            }
        }
    }

    async fn verify_account(&self, email: &str) -> Result<ApiResponse, TransportError> {
        self.gateway
            .post_json(
                &format!("/api/auth/verify/{email}"),
                RequestAuth::Bearer,
                &serde_json::json!({}),
            )
            .await
    }
}


/// Build a multipart file part from a path, guessing the content type
/// from the extension.
pub(crate) async fn file_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read file: {}", path.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(mime.essence_str())
        .context("Invalid mime type for upload")
}
