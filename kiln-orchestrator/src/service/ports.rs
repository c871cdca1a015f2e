//! Pipeline ports
//!
//! The orchestrator only sees these two traits. The real builder and
//! transfer client implement them here; tests drive the pipeline with doubles.

use std::path::PathBuf;

use async_trait::async_trait;
use kiln_builder::{BuildError, BuildResult, Builder, CommandRunner};
use kiln_client::{ImportedImage, TransferClient, TransferError, UploadedObject};
use kiln_core::ImageDefinition;

#[async_trait]
pub trait BuildBackend: Send + Sync {
    async fn build_image(&self, image: &ImageDefinition) -> Result<BuildResult, BuildError>;
}

#[async_trait]
pub trait ImageTransfer: Send + Sync {
    /// Where the upload step reads the artifact of `image` from.
    fn artifact_path(&self, image: &str) -> PathBuf;

    async fn upload_image(&self, image: &str) -> Result<UploadedObject, TransferError>;

    async fn import_object(
        &self,
        image: &str,
        object_name: &str,
    ) -> Result<ImportedImage, TransferError>;

    /// Poll until the image is available, failing on timeout or a bad state.
    async fn wait_for_image(&self, image: &str, image_id: &str) -> Result<(), TransferError>;
}

#[async_trait]
impl<R: CommandRunner> BuildBackend for Builder<R> {
    async fn build_image(&self, image: &ImageDefinition) -> Result<BuildResult, BuildError> {
        Builder::build_image(self, image).await
    }
}

#[async_trait]
impl ImageTransfer for TransferClient {
    fn artifact_path(&self, image: &str) -> PathBuf {
        TransferClient::artifact_path(self, image)
    }

    async fn upload_image(&self, image: &str) -> Result<UploadedObject, TransferError> {
        TransferClient::upload_image(self, image).await
    }

    async fn import_object(
        &self,
        image: &str,
        object_name: &str,
    ) -> Result<ImportedImage, TransferError> {
        TransferClient::import_object(self, image, object_name).await
    }

    async fn wait_for_image(&self, image: &str, image_id: &str) -> Result<(), TransferError> {
        TransferClient::wait_for_image(self, image, image_id).await
    }
}
