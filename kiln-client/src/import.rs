//! Image registration and the wait for availability

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::TransferClient;
use crate::error::TransferError;
use crate::registry::{CreateImageRequest, ImageSource, ImageState};

const LAUNCH_MODE: &str = "PARAVIRTUALIZED";

/// A registration that has been accepted by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedImage {
    pub image: String,
    pub object_name: String,
    pub image_id: String,
}

/// Logical image name of an uploaded object.
///
/// `headscale-20240115-123456.qcow2` becomes `headscale`; a name without a
/// dash loses its `.qcow2` extension.
pub fn extract_image_name(object_name: &str) -> &str {
    match object_name.split_once('-') {
        Some((name, _)) => name,
        None => object_name
            .strip_suffix(".qcow2")
            .filter(|name| !name.is_empty())
            .unwrap_or(object_name),
    }
}

/// `<name>-nixos-YYYYMMDD-HHMMSS`
pub fn display_name(image: &str, at: DateTime<Utc>) -> String {
    format!("{}-nixos-{}", image, at.format("%Y%m%d-%H%M%S"))
}

fn short_id(id: &str) -> String {
    match id.get(..20) {
        Some(prefix) if id.len() > 20 => format!("{}...", prefix),
        _ => id.to_string(),
    }
}

impl TransferClient {
    /// Register several uploaded objects, naming each after its object.
    pub async fn import(&self, objects: &[String]) -> Result<Vec<ImportedImage>, TransferError> {
        let at = Utc::now();
        let mut imported = Vec::with_capacity(objects.len());
        for object in objects {
            let image = extract_image_name(object);
            imported.push(self.import_at(image, object, at).await?);
        }
        Ok(imported)
    }

    /// Register one object as a compute image; returns while the import is still running.
    pub async fn import_object(
        &self,
        image: &str,
        object_name: &str,
    ) -> Result<ImportedImage, TransferError> {
        self.import_at(image, object_name, Utc::now()).await
    }

    async fn import_at(
        &self,
        image: &str,
        object_name: &str,
        at: DateTime<Utc>,
    ) -> Result<ImportedImage, TransferError> {
        let namespace = self.namespace().await?;
        let request = CreateImageRequest {
            compartment_id: self.settings.compartment_id.clone(),
            display_name: display_name(image, at),
            image_source_details: ImageSource::nixos_qcow2(
                namespace,
                self.settings.bucket_name.clone(),
                object_name,
            ),
            launch_mode: LAUNCH_MODE.to_string(),
        };

        self.sink
            .info(&format!("Importing {} as a custom image...", object_name));
        self.sink
            .info(&format!("  Display name: {}", request.display_name));
        self.sink
            .info(&format!("  Source bucket: {}", self.settings.bucket_name));

        let image_id = self
            .settings
            .retry
            .run("create image", &self.cancel, self.sink.as_ref(), || {
                self.registry.create_image(&request)
            })
            .await
            .inspect_err(|err| self.sink.error(&format!("  Import failed: {}", err)))?;

        self.sink.info(&format!("  Import initiated: {}", image_id));
        tracing::info!(image, image_id = %image_id, "import initiated");

        Ok(ImportedImage {
            image: image.to_string(),
            object_name: object_name.to_string(),
            image_id,
        })
    }

    /// Wait for each `(image, id)` in turn, stopping at the first failure.
    pub async fn wait_for_images(&self, images: &[(String, String)]) -> Result<(), TransferError> {
        for (image, image_id) in images {
            self.wait_for_image(image, image_id).await?;
        }
        Ok(())
    }

    /// Poll until the registry reports the image available.
    ///
    /// Waits the initial delay, then polls every interval. `IMPORTING` and
    /// `NOT_FOUND` keep polling, any other state is fatal. The timeout is
    /// measured from the first poll.
    pub async fn wait_for_image(&self, image: &str, image_id: &str) -> Result<(), TransferError> {
        let initial_delay = self.settings.initial_delay;
        let poll_interval = self.settings.poll_interval;
        let max_wait = self.settings.max_wait;

        self.sink.info(&format!(
            "Waiting for image {} to be available...",
            short_id(image_id)
        ));
        self.sink.info(&format!(
            "  Initial delay: {}s, poll interval: {}s, max wait: {}s",
            initial_delay.as_secs(),
            poll_interval.as_secs(),
            max_wait.as_secs()
        ));

        self.cancel.sleep(initial_delay).await?;
        let start = Instant::now();

        loop {
            let elapsed = start.elapsed();
            let elapsed_secs = elapsed.as_secs();

            match self.get_image_status(image_id).await? {
                ImageState::Available => {
                    self.sink
                        .info(&format!("  Image is AVAILABLE ({}s elapsed)", elapsed_secs));
                    return Ok(());
                }
                ImageState::Importing => {
                    self.sink
                        .info(&format!("  Status: IMPORTING ({}s elapsed)", elapsed_secs));
                }
                ImageState::NotFound => {
                    self.sink.info(&format!(
                        "  Status: NOT_FOUND - waiting for import to register ({}s elapsed)",
                        elapsed_secs
                    ));
                }
                ImageState::Other(state) => {
                    return Err(TransferError::UnexpectedImageState {
                        image: image.to_string(),
                        state,
                    });
                }
            }

            if elapsed >= max_wait {
                self.sink.error(&format!(
                    "  Timeout waiting for image after {}s",
                    elapsed_secs
                ));
                return Err(TransferError::ImportTimeout {
                    image: image.to_string(),
                    elapsed_secs,
                });
            }

            self.cancel.sleep(poll_interval).await?;
        }
    }
}
