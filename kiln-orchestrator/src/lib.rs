//! Kiln Orchestrator
//!
//! Drives images through build, upload and import against a persisted run
//! record, so an interrupted pipeline resumes where it stopped.
//!
//! - [`repository`]: the run state store and the statistics derived from it
//! - [`service`]: the pipeline orchestrator and the ports it drives

pub mod error;
pub mod repository;
pub mod service;

pub use error::{PipelineError, StateError};
pub use repository::state::StateStore;
pub use repository::stats::{ImageStatistics, PipelineStatistics, format_duration};
pub use service::pipeline::{Pipeline, ResumeOutcome};
pub use service::ports::{BuildBackend, ImageTransfer};
