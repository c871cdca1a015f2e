//! Kiln Builder
//!
//! Builds machine images with `nix build`, locally or on a remote builder:
//!
//! - [`strategy`]: picks local, single-hop remote, or two-hop macOS VM per image
//! - [`process`]: runs each step with streamed output and cancellation
//! - [`prerequisites`]: verifies the required tools before anything starts

mod builder;
pub mod error;
pub mod local;
pub mod macos;
pub mod prerequisites;
pub mod process;
pub mod remote;
pub mod strategy;

pub use builder::{BuildResult, Builder};
pub use error::BuildError;
pub use prerequisites::check_prerequisites;
pub use process::{CommandRunner, CommandSpec, ProcessError, StreamingRunner};
pub use strategy::{BuildStrategy, Step, select_strategy};
