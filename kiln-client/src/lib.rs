//! Kiln Transfer Client
//!
//! Moves built images into the cloud: chunked upload into object storage,
//! registration as a compute image, and the poll-with-timeout wait until the
//! registry reports the image available.
//!
//! The two remote services sit behind the [`ObjectStore`] and
//! [`ImageRegistry`] traits. [`HttpObjectStore`] and [`HttpImageRegistry`]
//! talk to OCI-shaped REST endpoints with a bearer token; tests substitute
//! in-memory doubles.
//!
//! # Example
//!
//! ```no_run
//! use kiln_client::TransferClient;
//! use kiln_core::Config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (config, _) = Config::load(None)?;
//! let client = TransferClient::from_config(&config.storage, ".")?;
//! let uploaded = client.upload_image("headscale").await?;
//! let imported = client.import_object("headscale", &uploaded.object_name).await?;
//! client.wait_for_image(&imported.image, &imported.image_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
mod http;
mod import;
pub mod registry;
pub mod retry;
pub mod store;
mod upload;

#[cfg(test)]
mod fakes;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::{CancelSignal, LogSink, StorageConfig, TracingSink};
use tokio::sync::OnceCell;

pub use error::{ClientError, Result, TransferError};
pub use import::{ImportedImage, display_name, extract_image_name};
pub use registry::{
    CreateImageRequest, HttpImageRegistry, ImageRegistry, ImageSource, ImageState, ImageSummary,
};
pub use retry::RetryPolicy;
pub use store::{HttpObjectStore, ObjectLocation, ObjectStore, UploadedPart};
pub use upload::{UploadedObject, object_name, part_count, part_percent};

/// Settings for the upload, import and wait protocols
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSettings {
    pub compartment_id: String,
    pub bucket_name: String,
    /// Skips the namespace lookup when set.
    pub namespace: Option<String>,
    /// Directory holding the `result-<name>` build outputs.
    pub work_dir: PathBuf,
    pub part_size: u64,
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub retry: RetryPolicy,
}

impl TransferSettings {
    pub fn from_storage(storage: &StorageConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            compartment_id: storage.compartment_id.clone(),
            bucket_name: storage.bucket_name.clone(),
            namespace: storage.namespace.clone().filter(|ns| !ns.is_empty()),
            work_dir: work_dir.into(),
            part_size: storage.part_size_bytes(),
            initial_delay: storage.initial_delay(),
            poll_interval: storage.poll_interval(),
            max_wait: storage.max_wait(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Client for the object store and image registry
pub struct TransferClient {
    store: Arc<dyn ObjectStore>,
    registry: Arc<dyn ImageRegistry>,
    settings: TransferSettings,
    sink: Arc<dyn LogSink>,
    cancel: CancelSignal,
    namespace: OnceCell<String>,
}

impl TransferClient {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<dyn ImageRegistry>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            sink: Arc::new(TracingSink),
            cancel: CancelSignal::never(),
            namespace: OnceCell::new(),
        }
    }

    /// Build the HTTP client from the `[storage]` config.
    ///
    /// The bearer token is read from the environment variable named by
    /// `auth_token_env`.
    pub fn from_config(storage: &StorageConfig, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let token = std::env::var(&storage.auth_token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::MissingCredentials(storage.auth_token_env.clone()))?;

        let http = reqwest::Client::new();
        let store = HttpObjectStore::with_client(
            storage.object_storage_url(),
            Some(token.clone()),
            http.clone(),
        );
        let registry = HttpImageRegistry::with_client(storage.compute_url(), Some(token), http);
        Ok(Self::new(
            Arc::new(store),
            Arc::new(registry),
            TransferSettings::from_storage(storage, work_dir),
        ))
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// `<work dir>/result-<name>/nixos.qcow2`
    pub fn artifact_path(&self, image: &str) -> PathBuf {
        artifact_path(&self.settings.work_dir, image)
    }

    /// Object storage namespace, looked up once and cached.
    pub async fn namespace(&self) -> std::result::Result<String, TransferError> {
        if let Some(ns) = &self.settings.namespace {
            return Ok(ns.clone());
        }
        self.namespace
            .get_or_try_init(|| async {
                self.settings
                    .retry
                    .run("get namespace", &self.cancel, self.sink.as_ref(), || {
                        self.store.namespace()
                    })
                    .await
            })
            .await
            .cloned()
    }

    pub async fn get_image_status(
        &self,
        image_id: &str,
    ) -> std::result::Result<ImageState, TransferError> {
        self.settings
            .retry
            .run("get image status", &self.cancel, self.sink.as_ref(), || {
                self.registry.image_state(image_id)
            })
            .await
    }

    /// Images in the configured compartment, optionally filtered by display-name prefix.
    pub async fn list_images(
        &self,
        prefix: Option<&str>,
    ) -> std::result::Result<Vec<ImageSummary>, TransferError> {
        let compartment = self.settings.compartment_id.as_str();
        self.settings
            .retry
            .run("list images", &self.cancel, self.sink.as_ref(), || {
                self.registry.list_images(compartment, prefix)
            })
            .await
    }
}

pub fn artifact_path(work_dir: &Path, image: &str) -> PathBuf {
    work_dir
        .join(format!("result-{}", image))
        .join("nixos.qcow2")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeRegistry, FakeStore, settings};

    #[test]
    fn settings_follow_storage_config() {
        let storage = StorageConfig {
            compartment_id: "c".into(),
            bucket_name: "b".into(),
            region: "r".into(),
            namespace: Some(String::new()),
            ..StorageConfig::default()
        };
        let s = TransferSettings::from_storage(&storage, "/work");
        assert_eq!(s.namespace, None);
        assert_eq!(s.part_size, 64 * 1024 * 1024);
        assert_eq!(s.retry, RetryPolicy::default());
        assert_eq!(s.work_dir, PathBuf::from("/work"));
    }

    #[test]
    fn artifact_path_layout() {
        assert_eq!(
            artifact_path(Path::new("/repo"), "derp"),
            PathBuf::from("/repo/result-derp/nixos.qcow2")
        );
    }

    #[tokio::test]
    async fn namespace_is_looked_up_once() {
        let store = Arc::new(FakeStore::default());
        let client = TransferClient::new(
            store.clone(),
            Arc::new(FakeRegistry::default()),
            settings(std::env::temp_dir()),
        );
        assert_eq!(client.namespace().await.unwrap(), "tenancy");
        assert_eq!(client.namespace().await.unwrap(), "tenancy");
        assert_eq!(store.calls_named("namespace"), 1);
    }

    #[tokio::test]
    async fn configured_namespace_skips_lookup() {
        let store = Arc::new(FakeStore::default());
        let mut s = settings(std::env::temp_dir());
        s.namespace = Some("fixed".into());
        let client = TransferClient::new(store.clone(), Arc::new(FakeRegistry::default()), s);
        assert_eq!(client.namespace().await.unwrap(), "fixed");
        assert_eq!(store.calls_named("namespace"), 0);
    }
}
