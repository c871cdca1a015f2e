//! Local build protocol

use std::path::{Path, PathBuf};

use kiln_core::ImageDefinition;

use crate::error::BuildError;
use crate::process::CommandSpec;
use crate::strategy::Step;

pub(crate) fn out_link(image: &str) -> String {
    format!("result-{}", image)
}

/// `result-<name>/nixos.qcow2`, relative to the work dir.
pub(crate) fn output_relative(image: &str) -> PathBuf {
    Path::new(&out_link(image)).join("nixos.qcow2")
}

pub fn local_steps(image: &ImageDefinition, work_dir: &Path) -> Vec<Step> {
    let command = CommandSpec::new("nix")
        .arg("build")
        .arg(format!(".#{}", image.build_target))
        .arg("--out-link")
        .arg(out_link(&image.name))
        .current_dir(work_dir);
    vec![Step::required("nix build", command)]
}

/// Resolve the out-link to the real artifact in the store.
///
/// Falls back to the unresolved path when it exists but cannot be canonicalized.
pub fn resolve_local_output(image: &str, work_dir: &Path) -> Result<PathBuf, BuildError> {
    let path = work_dir.join(output_relative(image));
    match std::fs::canonicalize(&path) {
        Ok(resolved) => Ok(resolved),
        Err(_) if path.exists() => Ok(path),
        Err(source) => Err(BuildError::OutputMissing {
            image: image.to_string(),
            path,
            source,
        }),
    }
}
