//! Run State Store
//!
//! Holds the single current [`PipelineRun`] and writes it through to a TOML
//! file after every mutation. Writes go to a temp file in the same directory
//! and are renamed over the old file, so a crash never leaves a torn record.
//!
//! One process owns the file at a time. Nothing prevents two processes from
//! pointing at the same path; doing so is undefined.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use kiln_core::{ImageProgress, PipelineRun, RunStage, Stage, StageOrderError};
use tempfile::NamedTempFile;

use crate::error::StateError;
use crate::repository::stats::PipelineStatistics;

pub const STATE_FILE_NAME: &str = "state.toml";

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    run: Option<PipelineRun>,
}

impl StateStore {
    /// A store at `path` with nothing loaded yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            run: None,
        }
    }

    /// Create the store and load whatever run is on disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let mut store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    /// `<user cache dir>/kiln/state.toml`
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kiln")
            .join(STATE_FILE_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file. A missing file means no run.
    pub fn load(&mut self) -> Result<Option<&PipelineRun>, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.run = None;
                return Ok(None);
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let run: PipelineRun =
            toml::from_str(&content).map_err(|source| StateError::CorruptState {
                path: self.path.clone(),
                source,
            })?;
        tracing::debug!(run_id = %run.run_id, path = %self.path.display(), "Loaded pipeline state");
        self.run = Some(run);
        Ok(self.run.as_ref())
    }

    pub fn run(&self) -> Option<&PipelineRun> {
        self.run.as_ref()
    }

    pub fn resumable_run(&self) -> Option<&PipelineRun> {
        self.run.as_ref().filter(|run| run.is_resumable())
    }

    pub fn image(&self, name: &str) -> Option<&ImageProgress> {
        self.run.as_ref().and_then(|run| run.image(name))
    }

    /// Replace the current run with a fresh one. Every image starts pending.
    pub fn start_new_run(&mut self, names: &[String]) -> Result<&PipelineRun, StateError> {
        let run = PipelineRun::new(names.iter().cloned(), Utc::now());
        tracing::info!(run_id = %run.run_id, images = ?names, "Starting new pipeline run");
        self.run = Some(run);
        self.save()?;
        self.active()
    }

    /// Reuse the resumable run, appending any names it does not have yet,
    /// or start a new run when there is none.
    pub fn begin_or_extend(&mut self, names: &[String]) -> Result<&PipelineRun, StateError> {
        if self.resumable_run().is_none() {
            return self.start_new_run(names);
        }
        let run = self.run.as_mut().ok_or(StateError::NoActiveRun)?;

        let mut added = 0;
        for name in names {
            if run.ensure_image(name.clone()) {
                added += 1;
            }
        }
        tracing::info!(run_id = %run.run_id, added, "Continuing pipeline run");
        self.save()?;
        self.active()
    }

    /// Apply `mutation` to one image record and persist the result.
    ///
    /// The mutation runs on a copy; a failed mutation leaves the record untouched.
    pub fn update_image<T, F>(&mut self, name: &str, mutation: F) -> Result<T, StateError>
    where
        F: FnOnce(&mut ImageProgress) -> Result<T, StageOrderError>,
    {
        let run = self.run.as_mut().ok_or(StateError::NoActiveRun)?;
        let record = run
            .image_mut(name)
            .ok_or_else(|| StateError::UnknownImage(name.to_string()))?;

        let mut updated = record.clone();
        let value = mutation(&mut updated)?;
        *record = updated;
        self.save()?;
        Ok(value)
    }

    pub fn set_stage(&mut self, stage: RunStage) -> Result<(), StateError> {
        let run = self.run.as_mut().ok_or(StateError::NoActiveRun)?;
        run.stage = stage;
        self.save()
    }

    /// Mark the run complete. Fails while any image lacks an image id.
    pub fn mark_complete(&mut self) -> Result<(), StateError> {
        let run = self.run.as_mut().ok_or(StateError::NoActiveRun)?;
        run.mark_complete(Utc::now())?;
        tracing::info!(run_id = %run.run_id, "Pipeline run complete");
        self.save()
    }

    pub fn record_stage_start(&mut self, name: &str, stage: Stage) -> Result<(), StateError> {
        self.update_image(name, |img| {
            img.timings.start(stage, Utc::now());
            Ok(())
        })
    }

    pub fn record_stage_complete(&mut self, name: &str, stage: Stage) -> Result<(), StateError> {
        self.update_image(name, |img| {
            img.timings.complete(stage, Utc::now());
            Ok(())
        })
    }

    /// A local artifact is recorded and still exists on disk.
    pub fn should_skip_build(&self, name: &str) -> bool {
        self.image(name)
            .and_then(|img| img.local_path())
            .is_some_and(|path| path.exists())
    }

    pub fn should_skip_upload(&self, name: &str) -> bool {
        self.image(name).and_then(|img| img.object_name()).is_some()
    }

    pub fn should_skip_import(&self, name: &str) -> bool {
        self.image(name).and_then(|img| img.image_id()).is_some()
    }

    /// Object names of uploaded images, in run order.
    pub fn object_names(&self) -> Vec<String> {
        self.records()
            .filter_map(|img| img.object_name().map(str::to_string))
            .collect()
    }

    /// `(image, image id)` for every imported image, in run order.
    pub fn image_ids(&self) -> Vec<(String, String)> {
        self.records()
            .filter_map(|img| img.image_id().map(|id| (img.name.clone(), id.to_string())))
            .collect()
    }

    pub fn compute_statistics(&self) -> Option<PipelineStatistics> {
        self.run.as_ref().map(PipelineStatistics::from_run)
    }

    /// Delete the state file. Returns whether a file was removed.
    pub fn clear(&mut self) -> Result<bool, StateError> {
        self.run = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Cleared pipeline state");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StateError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn records(&self) -> impl Iterator<Item = &ImageProgress> {
        self.run.iter().flat_map(|run| run.images.iter())
    }

    fn active(&self) -> Result<&PipelineRun, StateError> {
        self.run.as_ref().ok_or(StateError::NoActiveRun)
    }

    fn save(&mut self) -> Result<(), StateError> {
        let run = self.run.as_mut().ok_or(StateError::NoActiveRun)?;
        run.updated_at = Utc::now();
        let content = toml::to_string_pretty(run)?;
        write_atomic(&self.path, &content)
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<(), StateError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let io_err = |source: std::io::Error| StateError::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(content.as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
