//! Kiln Core
//!
//! Core types and abstractions shared by the kiln image pipeline.
//!
//! This crate contains:
//! - Domain types: image definitions, the pipeline run record and its stages
//! - Configuration: the TOML config file and its search locations
//! - Log sink: operator-facing progress output injected into every component
//! - Cancellation: the signal long-running steps observe

pub mod cancel;
pub mod config;
pub mod domain;
pub mod sink;

pub use cancel::{CancelHandle, CancelSignal, Cancelled, cancel_channel};
pub use config::{Config, ConfigError, RemoteBuilderConfig, StorageConfig};
pub use domain::image::{Arch, ImageDefinition};
pub use domain::log::{LogEntry, LogLevel};
pub use domain::run::{
    ImageMetrics, ImageProgress, ImageStage, IncompleteRun, PipelineRun, RunStage, Stage,
    StageOrderError, StageTimings,
};
pub use sink::{LogSink, MemorySink, TracingSink};
