//! Image definition types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Target CPU architecture of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Arch {
    /// Architecture of the machine this process runs on, if it is one we build for.
    pub fn host() -> Option<Self> {
        std::env::consts::ARCH.parse().ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            other => Err(format!("unsupported architecture: {}", other)),
        }
    }
}

/// A buildable image as declared in the configuration file
///
/// Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDefinition {
    pub name: String,
    pub build_target: String,
    pub arch: Arch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
}

impl ImageDefinition {
    pub fn new(name: impl Into<String>, build_target: impl Into<String>, arch: Arch) -> Self {
        Self {
            name: name.into(),
            build_target: build_target.into(),
            arch,
            output_var: None,
        }
    }

    /// Native images can be built on a host of the given architecture.
    pub fn is_native(&self, host: Option<Arch>) -> bool {
        host == Some(self.arch)
    }

    /// Name of the downstream variable the produced image id is exported as.
    pub fn output_variable(&self) -> String {
        match &self.output_var {
            Some(var) if !var.is_empty() => var.clone(),
            _ => format!("{}_image_ocid", self.name),
        }
    }
}
