//! Compute image registry seam and its HTTP implementation

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::http::{self, Endpoint};

const API_VERSION: &str = "20160918";

/// Lifecycle state of a registered image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageState {
    Available,
    Importing,
    /// The registry does not know the id yet (or any more).
    NotFound,
    Other(String),
}

impl ImageState {
    pub fn parse(state: &str) -> Self {
        match state {
            "AVAILABLE" => Self::Available,
            "IMPORTING" => Self::Importing,
            "NOT_FOUND" => Self::NotFound,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Importing => "IMPORTING",
            Self::NotFound => "NOT_FOUND",
            Self::Other(state) => state,
        }
    }
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object storage source of an import
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    pub source_type: String,
    pub namespace_name: String,
    pub bucket_name: String,
    pub object_name: String,
    pub source_image_type: String,
    pub operating_system: String,
    pub operating_system_version: String,
}

impl ImageSource {
    /// A QCOW2 NixOS image stored as an object.
    pub fn nixos_qcow2(
        namespace: impl Into<String>,
        bucket: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            source_type: "objectStorageTuple".to_string(),
            namespace_name: namespace.into(),
            bucket_name: bucket.into(),
            object_name: object.into(),
            source_image_type: "QCOW2".to_string(),
            operating_system: "NixOS".to_string(),
            operating_system_version: "24.11".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImageRequest {
    pub compartment_id: String,
    pub display_name: String,
    pub image_source_details: ImageSource,
    pub launch_mode: String,
}

/// An image as returned by list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    pub id: String,
    pub display_name: String,
    pub lifecycle_state: String,
    #[serde(default)]
    pub time_created: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Register an image and return its (still importing) id.
    async fn create_image(&self, request: &CreateImageRequest) -> Result<String>;

    /// Current lifecycle state; an unknown id is [`ImageState::NotFound`].
    async fn image_state(&self, image_id: &str) -> Result<ImageState>;

    /// Images in a compartment whose display name starts with `prefix`.
    async fn list_images(
        &self,
        compartment_id: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ImageSummary>>;
}

#[derive(Debug, Clone)]
pub struct HttpImageRegistry {
    endpoint: Endpoint,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    id: String,
    #[serde(default)]
    lifecycle_state: Option<String>,
}

impl HttpImageRegistry {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(base_url, token, reqwest::Client::new())
    }

    pub fn with_client(
        base_url: impl Into<String>,
        token: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(base_url, token, client),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.endpoint.base_url
    }
}

#[async_trait]
impl ImageRegistry for HttpImageRegistry {
    async fn create_image(&self, request: &CreateImageRequest) -> Result<String> {
        let url = self.endpoint.url([API_VERSION, "images"])?;
        let builder = self.endpoint.client.post(url).json(request);
        let response = self.endpoint.authorize(builder).send().await?;
        let image: ImageResponse = http::json(response).await?;
        Ok(image.id)
    }

    async fn image_state(&self, image_id: &str) -> Result<ImageState> {
        let url = self.endpoint.url([API_VERSION, "images", image_id])?;
        let builder = self.endpoint.client.get(url);
        let response = self.endpoint.authorize(builder).send().await?;
        match http::json::<ImageResponse>(response).await {
            Ok(image) => Ok(image
                .lifecycle_state
                .as_deref()
                .map(ImageState::parse)
                .unwrap_or(ImageState::NotFound)),
            Err(err) if err.is_not_found() => Ok(ImageState::NotFound),
            Err(err) => Err(err),
        }
    }

    async fn list_images(
        &self,
        compartment_id: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ImageSummary>> {
        let url = self.endpoint.url([API_VERSION, "images"])?;
        let mut images = Vec::new();
        let mut page: Option<String> = None;

        loop {
            let mut query = vec![("compartmentId", compartment_id.to_string())];
            if let Some(token) = &page {
                query.push(("page", token.clone()));
            }
            let builder = self.endpoint.client.get(url.clone()).query(&query);
            let response = http::check(self.endpoint.authorize(builder).send().await?).await?;
            let next = response
                .headers()
                .get("opc-next-page")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            let batch: Vec<ImageSummary> = http::json(response).await?;
            images.extend(
                batch
                    .into_iter()
                    .filter(|img| prefix.is_none_or(|p| img.display_name.starts_with(p))),
            );

            match next {
                Some(token) if !token.is_empty() => page = Some(token),
                _ => break,
            }
        }

        Ok(images)
    }
}
