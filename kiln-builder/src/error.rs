//! Build errors

use std::path::PathBuf;

use kiln_core::Arch;
use thiserror::Error;

use crate::process::ProcessError;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{tool} not found in PATH{}", .hint.map(|h| format!(". {}", h)).unwrap_or_default())]
    PrerequisiteMissing {
        tool: &'static str,
        hint: Option<&'static str>,
    },

    #[error("image '{image}' targets {arch} but no [remote_builder] is configured (use --local-only to build it here)")]
    BuilderNotConfigured { image: String, arch: Arch },

    #[error("{step} failed for image '{image}': {source}")]
    StepFailed {
        image: String,
        step: String,
        #[source]
        source: ProcessError,
    },

    #[error("build output for image '{image}' not found at {}: {source}", .path.display())]
    OutputMissing {
        image: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare {} for image '{image}': {source}", .path.display())]
    Prepare {
        image: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
