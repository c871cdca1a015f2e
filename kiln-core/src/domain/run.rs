//! Pipeline run domain types
//!
//! A [`PipelineRun`] is the persisted record of one attempt to take a set of
//! images from source to registered compute images. Each image carries its own
//! [`ImageProgress`] so a restarted process can pick up exactly where the last
//! one stopped.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stage of the run as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Pending,
    Build,
    Upload,
    Import,
    Complete,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Pending => "pending",
            RunStage::Build => "build",
            RunStage::Upload => "upload",
            RunStage::Import => "import",
            RunStage::Complete => "complete",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage of a single image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStage {
    Pending,
    BuildComplete,
    UploadComplete,
    Importing,
    Complete,
    Error,
}

impl ImageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStage::Pending => "pending",
            ImageStage::BuildComplete => "build_complete",
            ImageStage::UploadComplete => "upload_complete",
            ImageStage::Importing => "importing",
            ImageStage::Complete => "complete",
            ImageStage::Error => "error",
        }
    }
}

impl fmt::Display for ImageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the three working stages an image passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Build,
    Upload,
    Import,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Upload => "upload",
            Stage::Import => "import",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Stage> for RunStage {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Build => RunStage::Build,
            Stage::Upload => RunStage::Upload,
            Stage::Import => RunStage::Import,
        }
    }
}

/// A checkpoint was recorded before the one it depends on
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot record {stage} for image '{image}': {missing} is not recorded yet")]
pub struct StageOrderError {
    pub image: String,
    pub stage: Stage,
    pub missing: &'static str,
}

/// The run was asked to complete while some images have no image id
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("run is incomplete, images without an image id: {}", .missing.join(", "))]
pub struct IncompleteRun {
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_completed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_completed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_completed: Option<DateTime<Utc>>,
}

impl StageTimings {
    /// Record the start of a stage, clearing any completion left by an earlier attempt.
    pub fn start(&mut self, stage: Stage, at: DateTime<Utc>) {
        let (started, completed) = self.slots_mut(stage);
        *started = Some(at);
        *completed = None;
    }

    pub fn complete(&mut self, stage: Stage, at: DateTime<Utc>) {
        *self.slots_mut(stage).1 = Some(at);
    }

    pub fn started(&self, stage: Stage) -> Option<DateTime<Utc>> {
        self.slots(stage).0
    }

    pub fn completed(&self, stage: Stage) -> Option<DateTime<Utc>> {
        self.slots(stage).1
    }

    /// Duration of a stage; zero unless both timestamps are set, never negative.
    pub fn span(&self, stage: Stage) -> chrono::Duration {
        match self.slots(stage) {
            (Some(start), Some(end)) if end > start => end - start,
            _ => chrono::Duration::zero(),
        }
    }

    fn slots(&self, stage: Stage) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        match stage {
            Stage::Build => (self.build_started, self.build_completed),
            Stage::Upload => (self.upload_started, self.upload_completed),
            Stage::Import => (self.import_started, self.import_completed),
        }
    }

    fn slots_mut(
        &mut self,
        stage: Stage,
    ) -> (&mut Option<DateTime<Utc>>, &mut Option<DateTime<Utc>>) {
        match stage {
            Stage::Build => (&mut self.build_started, &mut self.build_completed),
            Stage::Upload => (&mut self.upload_started, &mut self.upload_completed),
            Stage::Import => (&mut self.import_started, &mut self.import_completed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetrics {
    #[serde(default)]
    pub build_size_bytes: u64,
    #[serde(default)]
    pub upload_size_bytes: u64,
    #[serde(default)]
    pub upload_parts: u32,
}

/// Progress of one image through the pipeline
///
/// The checkpoint fields are only written through the `record_*` methods,
/// which refuse to record an object name before a local path or an image id
/// before an object name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageProgress {
    pub name: String,
    pub stage: ImageStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timings: StageTimings,
    #[serde(default)]
    pub metrics: ImageMetrics,
}

impl ImageProgress {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage: ImageStage::Pending,
            local_path: None,
            object_name: None,
            image_id: None,
            error: None,
            timings: StageTimings::default(),
            metrics: ImageMetrics::default(),
        }
    }

    pub fn local_path(&self) -> Option<&PathBuf> {
        self.local_path.as_ref().filter(|p| !p.as_os_str().is_empty())
    }

    pub fn object_name(&self) -> Option<&str> {
        self.object_name.as_deref().filter(|s| !s.is_empty())
    }

    pub fn image_id(&self) -> Option<&str> {
        self.image_id.as_deref().filter(|s| !s.is_empty())
    }

    /// A new artifact invalidates the object and image made from the old one.
    pub fn record_build(&mut self, path: impl Into<PathBuf>, size_bytes: u64) {
        self.local_path = Some(path.into());
        self.object_name = None;
        self.image_id = None;
        self.metrics = ImageMetrics {
            build_size_bytes: size_bytes,
            ..ImageMetrics::default()
        };
        self.timings.import_started = None;
        self.timings.import_completed = None;
        self.stage = ImageStage::BuildComplete;
        self.error = None;
    }

    pub fn record_upload(
        &mut self,
        object_name: impl Into<String>,
        size_bytes: u64,
        parts: u32,
    ) -> Result<(), StageOrderError> {
        if self.local_path().is_none() {
            return Err(self.order_error(Stage::Upload, "local path"));
        }
        self.object_name = Some(object_name.into());
        self.image_id = None;
        self.timings.import_started = None;
        self.timings.import_completed = None;
        self.metrics.upload_size_bytes = size_bytes;
        self.metrics.upload_parts = parts;
        self.stage = ImageStage::UploadComplete;
        self.error = None;
        Ok(())
    }

    pub fn record_import(&mut self, image_id: impl Into<String>) -> Result<(), StageOrderError> {
        if self.object_name().is_none() {
            return Err(self.order_error(Stage::Import, "object name"));
        }
        self.image_id = Some(image_id.into());
        self.stage = ImageStage::Importing;
        self.error = None;
        Ok(())
    }

    /// The registered image became available.
    pub fn mark_available(&mut self) -> Result<(), StageOrderError> {
        if self.image_id().is_none() {
            return Err(self.order_error(Stage::Import, "image id"));
        }
        self.stage = ImageStage::Complete;
        self.error = None;
        Ok(())
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.stage = ImageStage::Error;
        self.error = Some(message.into());
    }

    fn order_error(&self, stage: Stage, missing: &'static str) -> StageOrderError {
        StageOrderError {
            image: self.name.clone(),
            stage,
            missing,
        }
    }
}

/// The persisted record of one pipeline attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub stage: RunStage,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub images: Vec<ImageProgress>,
}

impl PipelineRun {
    /// A fresh run with every image pending and the run at the build stage.
    pub fn new<I, S>(names: I, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut run = Self {
            run_id: now.format("%Y%m%d-%H%M%S").to_string(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            stage: RunStage::Build,
            complete: false,
            images: Vec::new(),
        };
        for name in names {
            run.ensure_image(name.into());
        }
        run
    }

    pub fn image(&self, name: &str) -> Option<&ImageProgress> {
        self.images.iter().find(|img| img.name == name)
    }

    pub fn image_mut(&mut self, name: &str) -> Option<&mut ImageProgress> {
        self.images.iter_mut().find(|img| img.name == name)
    }

    /// Append a pending record unless one already exists. Returns true when appended.
    pub fn ensure_image(&mut self, name: String) -> bool {
        if self.image(&name).is_some() {
            return false;
        }
        self.images.push(ImageProgress::pending(name));
        true
    }

    pub fn image_names(&self) -> Vec<&str> {
        self.images.iter().map(|img| img.name.as_str()).collect()
    }

    /// A run that has not completed can be resumed or extended.
    pub fn is_resumable(&self) -> bool {
        !self.complete
    }

    /// Names of images that have no image id yet.
    pub fn missing_image_ids(&self) -> Vec<String> {
        self.images
            .iter()
            .filter(|img| img.image_id().is_none())
            .map(|img| img.name.clone())
            .collect()
    }

    pub fn mark_complete(&mut self, now: DateTime<Utc>) -> Result<(), IncompleteRun> {
        let missing = self.missing_image_ids();
        if !missing.is_empty() {
            return Err(IncompleteRun { missing });
        }
        self.stage = RunStage::Complete;
        self.complete = true;
        self.completed_at = Some(now);
        Ok(())
    }
}
