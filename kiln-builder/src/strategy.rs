//! Build strategy selection
//!
//! Each image is built by exactly one strategy, chosen from its architecture,
//! the host architecture, `--local-only` and the remote builder config.

use std::fmt;

use kiln_core::{Arch, ImageDefinition, RemoteBuilderConfig};

use crate::error::BuildError;
use crate::process::CommandSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStrategy<'a> {
    /// `nix build` in the work dir
    Local,
    /// `nix build` on a Linux host over ssh
    RemoteLinux(&'a RemoteBuilderConfig),
    /// `nix build` in the Linux builder VM of a macOS host, two ssh hops away
    RemoteMacVm(&'a RemoteBuilderConfig),
}

impl fmt::Display for BuildStrategy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildStrategy::Local => "local",
            BuildStrategy::RemoteLinux(_) => "remote",
            BuildStrategy::RemoteMacVm(_) => "remote macOS VM",
        })
    }
}

impl BuildStrategy<'_> {
    pub fn is_remote(&self) -> bool {
        !matches!(self, BuildStrategy::Local)
    }
}

pub fn select_strategy<'a>(
    image: &ImageDefinition,
    host: Option<Arch>,
    local_only: bool,
    remote: Option<&'a RemoteBuilderConfig>,
) -> Result<BuildStrategy<'a>, BuildError> {
    if local_only || image.is_native(host) {
        return Ok(BuildStrategy::Local);
    }
    match remote {
        Some(remote) if remote.is_macos => Ok(BuildStrategy::RemoteMacVm(remote)),
        Some(remote) => Ok(BuildStrategy::RemoteLinux(remote)),
        None => Err(BuildError::BuilderNotConfigured {
            image: image.name.clone(),
            arch: image.arch,
        }),
    }
}

/// One command of a build protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub label: String,
    pub command: CommandSpec,
    /// Cleanup steps only warn on failure.
    pub required: bool,
}

impl Step {
    pub fn required(label: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            label: label.into(),
            command,
            required: true,
        }
    }

    pub fn cleanup(label: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            label: label.into(),
            command,
            required: false,
        }
    }
}
