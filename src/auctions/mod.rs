//! Auction CRUD client.
//!
//! Listing and fetching are public; create, update and delete ride on
//! the stored bearer token. Creation is multipart: one `auction` part
//! holding the JSON document plus one `files` part per photo, which is
//! the shape the backend's upload handler expects.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::gateway::{ApiResponse, Gateway, RequestAuth};

#[derive(Debug, Clone, Deserialize)]
pub struct Auction {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "startingPrice", default)]
    pub starting_price: f64,
    #[serde(rename = "Category", alias = "category", default)]
    pub category: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "sellerId", default)]
    pub seller_id: Option<i64>,
}

/// Fields for a new auction. The wire document adds `status: "active"`
/// and uses the backend's field casing (`startingPrice`, `Category`).
#[derive(Debug, Clone)]
pub struct NewAuction {
    pub title: String,
    pub description: String,
    pub starting_price: f64,
    pub category: String,
}

#[derive(Serialize)]
struct AuctionDocument<'a> {
    title: &'a str,
    description: &'a str,
    #[serde(rename = "startingPrice")]
    starting_price: f64,
    #[serde(rename = "Category")]
    category: &'a str,
    status: &'a str,
}

/// Partial update; `None` fields are omitted from the request body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuctionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "startingPrice", skip_serializing_if = "Option::is_none")]
    pub starting_price: Option<f64>,
    #[serde(rename = "Category", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Clone)]
pub struct AuctionClient {
    gateway: Gateway,
}

impl AuctionClient {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub async fn list(&self) -> Result<Vec<Auction>> {
        let response = self.gateway.get("/api/auctions").await?;
        parse(response).context("Failed to list auctions")
    }

    pub async fn get(&self, id: i64) -> Result<Auction> {
        let response = self.gateway.get(&format!("/api/auctions/{id}")).await?;
        parse(response).with_context(|| format!("Failed to fetch auction {id}"))
    }

    /// Create an auction with its photos in a single multipart request.
    pub async fn create(&self, auction: &NewAuction, photos: &[&Path]) -> Result<Auction> {
        let document = serde_json::to_string(&AuctionDocument {
            title: &auction.title,
            description: &auction.description,
            starting_price: auction.starting_price,
            category: &auction.category,
            status: "active",
        })?;

        let mut form = Form::new().text("auction", document);
        for (index, path) in photos.iter().enumerate() {
            form = form.part("files", photo_part(path, index).await?);
        }

        let response = self
            .gateway
            .post_multipart("/api/auctions", RequestAuth::Bearer, form)
            .await?;
        let created: Auction = parse(response).context("Failed to create auction")?;
        info!(id = created.id, title = %created.title, "Auction created");
        Ok(created)
    }

    pub async fn update(&self, id: i64, update: &AuctionUpdate) -> Result<Auction> {
        let response = self
            .gateway
            .put_json(&format!("/api/auctions/{id}"), update)
            .await?;
        parse(response).with_context(|| format!("Failed to update auction {id}"))
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let response = self.gateway.delete(&format!("/api/auctions/{id}")).await?;
        if !response.is_success() {
            bail!(
                "Failed to delete auction {id}: {} - {}",
                response.status,
                response.error_message()
            );
        }
        info!(id, "Auction deleted");
        Ok(())
    }

    pub async fn list_by_seller(&self, user_id: i64) -> Result<Vec<Auction>> {
        let response = self
            .gateway
            .get(&format!("/api/auctions/seller/{user_id}"))
            .await?;
        parse(response).with_context(|| format!("Failed to list auctions for seller {user_id}"))
    }
}

fn parse<T: serde::de::DeserializeOwned>(response: ApiResponse) -> Result<T> {
    if !response.is_success() {
        bail!("{} - {}", response.status, response.error_message());
    }
    serde_json::from_value(response.body).context("Unexpected response shape")
}

/// Photo upload part, named the way the mobile client names them so the
/// backend's filename-based dedup keeps working.
async fn photo_part(path: &Path, index: usize) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read photo: {}", path.display()))?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg");
    let file_name = format!("auction_{}_{index}.{extension}", Utc::now().timestamp_millis());
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(mime.essence_str())
        .context("Invalid mime type for photo")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auction_document_uses_backend_casing() {
        let document = serde_json::to_value(AuctionDocument {
            title: "Vintage radio",
            description: "Works",
            starting_price: 45.5,
            category: "Electronics",
            status: "active",
        })
        .unwrap();

        assert_eq!(
            document,
            json!({
                "title": "Vintage radio",
                "description": "Works",
                "startingPrice": 45.5,
                "Category": "Electronics",
                "status": "active"
            })
        );
    }

    #[test]
    fn test_update_omits_unset_fields() {
        let update = AuctionUpdate {
            title: Some("New title".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value, json!({"title": "New title"}));
    }

    #[test]
    fn test_auction_accepts_both_category_casings() {
        let upper: Auction =
            serde_json::from_value(json!({"id": 1, "title": "x", "Category": "Art"})).unwrap();
        let lower: Auction =
            serde_json::from_value(json!({"id": 1, "title": "x", "category": "Art"})).unwrap();
        assert_eq!(upper.category.as_deref(), Some("Art"));
        assert_eq!(lower.category.as_deref(), Some("Art"));
    }

    #[test]
    fn test_parse_surfaces_server_error_body() {
        let response = ApiResponse {
            status: reqwest::StatusCode::FORBIDDEN,
            body: json!({"error": "Not the seller"}),
        };
        let err = parse::<Auction>(response).unwrap_err();
        assert!(err.to_string().contains("Not the seller"));
    }
}
