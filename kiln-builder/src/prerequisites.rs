//! Tool availability checks run before any stage starts

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

const NIX_HINT: &str = "Install Nix from https://nixos.org/download";
const REMOTE_TOOLS: [&str; 3] = ["ssh", "rsync", "scp"];

/// `nix` is always required; `ssh`, `rsync` and `scp` only for remote builds.
pub fn check_prerequisites(need_remote: bool) -> Result<(), BuildError> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    check_prerequisites_in(&path, need_remote)
}

pub fn check_prerequisites_in(path: &OsStr, need_remote: bool) -> Result<(), BuildError> {
    if find_in_path("nix", path).is_none() {
        return Err(BuildError::PrerequisiteMissing {
            tool: "nix",
            hint: Some(NIX_HINT),
        });
    }
    if need_remote {
        for tool in REMOTE_TOOLS {
            if find_in_path(tool, path).is_none() {
                return Err(BuildError::PrerequisiteMissing { tool, hint: None });
            }
        }
    }
    tracing::debug!(need_remote, "prerequisites satisfied");
    Ok(())
}

/// First executable named `tool` in a `PATH`-style list.
pub fn find_in_path(tool: &str, path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
