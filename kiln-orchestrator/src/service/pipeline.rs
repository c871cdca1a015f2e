//! Pipeline Service
//!
//! Runs images through build, upload and import, checkpointing every step
//! into the [`StateStore`]. Each step writes its start timestamp, its result
//! and its completion timestamp. A failing step marks the image as errored
//! and stops the call; images handled before it keep their checkpoints.

use std::sync::Arc;

use kiln_builder::BuildResult;
use kiln_client::{ImportedImage, UploadedObject, extract_image_name};
use kiln_core::{
    ImageDefinition, ImageStage, LogSink, RunStage, Stage, StageOrderError, TracingSink,
};

use crate::error::{PipelineError, StateError};
use crate::repository::state::StateStore;
use crate::service::ports::{BuildBackend, ImageTransfer};

/// What a resume did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The remaining stages ran and the run is now complete.
    Completed,
    /// The run was already complete.
    NothingToDo,
}

pub struct Pipeline<B, T> {
    backend: B,
    transfer: T,
    store: StateStore,
    catalog: Vec<ImageDefinition>,
    sink: Arc<dyn LogSink>,
}

impl<B, T> Pipeline<B, T> {
    /// `catalog` holds every configured image; runs refer to images by name.
    pub fn new(backend: B, transfer: T, store: StateStore, catalog: Vec<ImageDefinition>) -> Self {
        Self {
            backend,
            transfer,
            store,
            catalog,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn into_store(self) -> StateStore {
        self.store
    }

    /// `(variable, image id)` for every imported image of the run.
    pub fn outputs(&self) -> Vec<(String, String)> {
        self.store
            .image_ids()
            .into_iter()
            .map(|(name, id)| (self.output_variable(&name), id))
            .collect()
    }

    /// Downstream variable name for `image`.
    pub fn output_variable(&self, image: &str) -> String {
        match self.definition(image) {
            Ok(def) => def.output_variable(),
            Err(_) => format!("{}_image_ocid", image),
        }
    }

    fn record_failure(&mut self, name: &str, err: &dyn std::error::Error) {
        let message = err.to_string();
        tracing::error!(image = name, error = %message, "Pipeline step failed");
        if let Err(e) = self.store.update_image(name, |img| {
            img.record_error(message.clone());
            Ok(())
        }) {
            tracing::warn!(image = name, error = %e, "Failed to record step failure");
        }
    }

    fn definition(&self, name: &str) -> Result<&ImageDefinition, PipelineError> {
        self.catalog
            .iter()
            .find(|def| def.name == name)
            .ok_or_else(|| PipelineError::NotConfigured(name.to_string()))
    }

    fn known_names(&self, names: &[String]) -> Result<Vec<String>, PipelineError> {
        if names.is_empty() {
            return Ok(self.catalog.iter().map(|def| def.name.clone()).collect());
        }
        for name in names {
            self.definition(name)?;
        }
        Ok(names.to_vec())
    }
}

/// Building needs no transfer port; `()` stands in for it.
impl<B: BuildBackend, T> Pipeline<B, T> {
    /// Build the images into the resumable run, starting one if needed.
    pub async fn run_build(&mut self, names: &[String]) -> Result<Vec<BuildResult>, PipelineError> {
        let names = self.known_names(names)?;
        self.store.begin_or_extend(&names)?;

        let mut results = Vec::with_capacity(names.len());
        for name in &names {
            results.push(self.build_step(name).await?);
        }
        Ok(results)
    }

    async fn build_step(&mut self, name: &str) -> Result<BuildResult, PipelineError> {
        let def = self.definition(name)?.clone();
        self.store.record_stage_start(name, Stage::Build)?;

        let result = match self.backend.build_image(&def).await {
            Ok(result) => result,
            Err(source) => {
                self.record_failure(name, &source);
                return Err(PipelineError::Build {
                    image: name.to_string(),
                    source,
                });
            }
        };

        self.store.update_image(name, |img| {
            img.record_build(&result.output_path, result.size_bytes);
            Ok(())
        })?;
        self.store.record_stage_complete(name, Stage::Build)?;
        Ok(result)
    }
}

/// Uploading and importing need no build port; `()` stands in for it.
impl<B, T: ImageTransfer> Pipeline<B, T> {
    /// Upload existing artifacts into the resumable run, starting one if needed.
    pub async fn run_upload(
        &mut self,
        names: &[String],
    ) -> Result<Vec<UploadedObject>, PipelineError> {
        let names = self.known_names(names)?;
        self.store.begin_or_extend(&names)?;

        let mut uploaded = Vec::with_capacity(names.len());
        for name in &names {
            uploaded.push(self.upload_step(name).await?);
        }
        Ok(uploaded)
    }

    /// Import explicitly named objects and wait for them. Leaves the run state alone.
    pub async fn run_import(
        &self,
        objects: &[String],
    ) -> Result<Vec<ImportedImage>, PipelineError> {
        let mut imported = Vec::with_capacity(objects.len());
        for object in objects {
            let image = extract_image_name(object);
            let result = self
                .transfer
                .import_object(image, object)
                .await
                .map_err(|source| PipelineError::Import {
                    image: image.to_string(),
                    source,
                })?;
            imported.push(result);
        }

        self.sink.info("Waiting for images to be available...");
        for img in &imported {
            self.transfer
                .wait_for_image(&img.image, &img.image_id)
                .await
                .map_err(|source| PipelineError::Import {
                    image: img.image.clone(),
                    source,
                })?;
        }
        Ok(imported)
    }

    /// A build is needed unless a downstream identifier exists, or the recorded
    /// artifact and the path upload reads from both still exist.
    fn needs_build(&self, name: &str) -> bool {
        let artifact_ready =
            self.store.should_skip_build(name) && self.transfer.artifact_path(name).exists();
        !(artifact_ready
            || self.store.should_skip_upload(name)
            || self.store.should_skip_import(name))
    }

    async fn upload_step(&mut self, name: &str) -> Result<UploadedObject, PipelineError> {
        let artifact = self.transfer.artifact_path(name);
        self.store.record_stage_start(name, Stage::Upload)?;

        let uploaded = match self.transfer.upload_image(name).await {
            Ok(uploaded) => uploaded,
            Err(source) => {
                self.record_failure(name, &source);
                return Err(PipelineError::Upload {
                    image: name.to_string(),
                    source,
                });
            }
        };

        self.store.update_image(name, |img| {
            // Artifacts uploaded without a recorded build still need a local path first.
            if img.local_path().is_none() {
                img.record_build(&artifact, uploaded.size_bytes);
            }
            img.record_upload(&uploaded.object_name, uploaded.size_bytes, uploaded.parts)
        })?;
        self.store.record_stage_complete(name, Stage::Upload)?;
        Ok(uploaded)
    }

    async fn import_step(&mut self, name: &str) -> Result<(), PipelineError> {
        let object = self
            .store
            .image(name)
            .and_then(|img| img.object_name())
            .map(str::to_string)
            .ok_or_else(|| {
                StateError::StageOrder(StageOrderError {
                    image: name.to_string(),
                    stage: Stage::Import,
                    missing: "object name",
                })
            })?;
        self.store.record_stage_start(name, Stage::Import)?;

        let imported = match self.transfer.import_object(name, &object).await {
            Ok(imported) => imported,
            Err(source) => {
                self.record_failure(name, &source);
                return Err(PipelineError::Import {
                    image: name.to_string(),
                    source,
                });
            }
        };

        self.store
            .update_image(name, |img| img.record_import(&imported.image_id))?;
        Ok(())
    }

    async fn wait_step(&mut self, name: &str) -> Result<(), PipelineError> {
        let Some(img) = self.store.image(name) else {
            return Err(StateError::UnknownImage(name.to_string()).into());
        };
        if img.stage == ImageStage::Complete {
            return Ok(());
        }
        let image_id = img
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| {
                StateError::StageOrder(StageOrderError {
                    image: name.to_string(),
                    stage: Stage::Import,
                    missing: "image id",
                })
            })?;

        if let Err(source) = self.transfer.wait_for_image(name, &image_id).await {
            self.record_failure(name, &source);
            return Err(PipelineError::Import {
                image: name.to_string(),
                source,
            });
        }

        self.store.update_image(name, |img| img.mark_available())?;
        self.store.record_stage_complete(name, Stage::Import)?;
        Ok(())
    }
}

impl<B: BuildBackend, T: ImageTransfer> Pipeline<B, T> {
    /// Start a new run and take every image through all three stages.
    pub async fn run_all(&mut self, names: &[String]) -> Result<(), PipelineError> {
        let names = self.known_names(names)?;
        self.store.start_new_run(&names)?;
        self.run_stages(Stage::Build).await
    }

    /// Continue the stored run from the stage it stopped at.
    pub async fn resume(&mut self) -> Result<ResumeOutcome, PipelineError> {
        let run = self.store.run().ok_or(PipelineError::NothingToResume)?;
        if run.complete {
            self.sink.info("Pipeline already complete, nothing to resume.");
            return Ok(ResumeOutcome::NothingToDo);
        }

        let from = match run.stage {
            RunStage::Pending | RunStage::Build => Stage::Build,
            RunStage::Upload => Stage::Upload,
            RunStage::Import | RunStage::Complete => Stage::Import,
        };
        self.sink.info(&format!(
            "Resuming run {} from {} stage...",
            run.run_id, from
        ));
        self.run_stages(from).await?;
        Ok(ResumeOutcome::Completed)
    }

    async fn run_stages(&mut self, from: Stage) -> Result<(), PipelineError> {
        let names: Vec<String> = match self.store.run() {
            Some(run) => run.images.iter().map(|img| img.name.clone()).collect(),
            None => return Err(StateError::NoActiveRun.into()),
        };

        if from == Stage::Build {
            self.sink.info("=== Build Stage ===");
            for name in &names {
                if self.needs_build(name) {
                    self.build_step(name).await?;
                } else {
                    self.sink
                        .info(&format!("  Skipping build for {} (already built)", name));
                }
            }
            self.store.set_stage(RunStage::Upload)?;
        }

        if from != Stage::Import {
            self.sink.info("=== Upload Stage ===");
            for name in &names {
                if self.store.should_skip_upload(name) {
                    self.sink
                        .info(&format!("  Skipping upload for {} (already uploaded)", name));
                } else {
                    self.upload_step(name).await?;
                }
            }
            self.store.set_stage(RunStage::Import)?;
        }

        self.sink.info("=== Import Stage ===");
        for name in &names {
            if self.store.should_skip_import(name) {
                self.sink
                    .info(&format!("  Skipping import for {} (already initiated)", name));
            } else {
                self.import_step(name).await?;
            }
        }

        self.sink.info("Waiting for images to be available...");
        for name in &names {
            self.wait_step(name).await?;
        }

        self.store.mark_complete()?;
        self.sink.info("=== Pipeline Complete ===");
        Ok(())
    }
}
