//! Orchestrator error types

use std::path::PathBuf;

use kiln_builder::BuildError;
use kiln_client::TransferError;
use kiln_core::{IncompleteRun, StageOrderError};
use thiserror::Error;

/// Errors from the run state store
#[derive(Debug, Error)]
pub enum StateError {
    #[error("no active pipeline run")]
    NoActiveRun,

    #[error("image '{0}' is not part of the current run")]
    UnknownImage(String),

    #[error("state file {} cannot be parsed (inspect it or run 'kiln state --clear'): {source}", .path.display())]
    CorruptState {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("state file error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    StageOrder(#[from] StageOrderError),

    #[error(transparent)]
    Incomplete(#[from] IncompleteRun),
}

/// Errors from the pipeline orchestrator
///
/// Stage failures carry the image they happened on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no pipeline run to resume")]
    NothingToResume,

    #[error("image '{0}' is not defined in the configuration")]
    NotConfigured(String),

    #[error("build failed for {image}: {source}")]
    Build {
        image: String,
        #[source]
        source: BuildError,
    },

    #[error("upload failed for {image}: {source}")]
    Upload {
        image: String,
        #[source]
        source: TransferError,
    },

    #[error("import failed for {image}: {source}")]
    Import {
        image: String,
        #[source]
        source: TransferError,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Build { source, .. } => source.is_cancelled(),
            Self::Upload { source, .. } | Self::Import { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
