//! User profile client.
//!
//! Profile reads and updates, including the one sanctioned partial
//! mutation: removing the profile photo clears `photoId` in place
//! instead of replacing the whole record.

use anyhow::{bail, Context, Result};
use reqwest::multipart::Form;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::auth::file_part;
use crate::gateway::{ApiResponse, Gateway};

#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
    #[serde(default)]
    pub cin: Option<i64>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "photoId", default)]
    pub photo_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firstname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lastname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cin: Option<i64>,
}

#[derive(Clone)]
pub struct UserClient {
    gateway: Gateway,
}

impl UserClient {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub async fn get(&self, id: i64) -> Result<UserProfile> {
        let response = self.gateway.get(&format!("/api/users/{id}")).await?;
        parse(response).with_context(|| format!("Failed to fetch user {id}"))
    }

    /// Update profile fields, optionally replacing the photo. With a
    /// photo the request is multipart (`user` JSON part + `photo` file
    /// part); without one it is plain JSON.
    pub async fn update(
        &self,
        id: i64,
        update: &UserUpdate,
        photo: Option<&Path>,
    ) -> Result<UserProfile> {
        let response = match photo {
            Some(path) => {
                let form = Form::new()
                    .text("user", serde_json::to_string(update)?)
                    .part("photo", file_part(path).await?);
                self.gateway
                    .put_multipart(&format!("/api/users/{id}"), form)
                    .await?
            }
            None => {
                self.gateway
                    .put_json(&format!("/api/users/{id}"), update)
                    .await?
            }
        };
        parse(response).with_context(|| format!("Failed to update user {id}"))
    }

    /// Remove the profile photo. On success, callers holding a cached
    /// profile clear its `photo_id` rather than refetching.
    pub async fn delete_photo(&self, id: i64) -> Result<()> {
        let response = self
            .gateway
            .delete(&format!("/api/users/{id}/photo"))
            .await?;
        if !response.is_success() {
            bail!(
                "Failed to delete photo for user {id}: {} - {}",
                response.status,
                response.error_message()
            );
        }
        info!(id, "Profile photo removed");
        Ok(())
    }
}

fn parse<T: serde::de::DeserializeOwned>(response: ApiResponse) -> Result<T> {
    if !response.is_success() {
        bail!("{} - {}", response.status, response.error_message());
    }
    serde_json::from_value(response.body).context("Unexpected response shape")
}
