//! Single-hop remote build on a Linux builder

use std::path::Path;

use kiln_core::{ImageDefinition, RemoteBuilderConfig};

use crate::local::{out_link, output_relative};
use crate::process::CommandSpec;
use crate::strategy::Step;

/// `-o BatchMode=yes`, plus `-i <key>` when a key is configured.
pub(crate) fn ssh_options(remote: &RemoteBuilderConfig) -> Vec<String> {
    let mut opts = vec!["-o".to_string(), "BatchMode=yes".to_string()];
    if let Some(key) = remote.ssh_key_path() {
        opts.push("-i".to_string());
        opts.push(key.display().to_string());
    }
    opts
}

/// Run a shell command on the builder host.
pub(crate) fn ssh(remote: &RemoteBuilderConfig, work_dir: &Path, command: String) -> CommandSpec {
    CommandSpec::new("ssh")
        .args(ssh_options(remote))
        .arg(remote.ssh_target())
        .arg(command)
        .current_dir(work_dir)
}

/// Sync only the flake inputs to the builder's repo path.
pub(crate) fn rsync_sources(remote: &RemoteBuilderConfig, work_dir: &Path) -> CommandSpec {
    CommandSpec::new("rsync")
        .args(["-az", "--delete", "-v", "-e"])
        .arg(format!("ssh {}", ssh_options(remote).join(" ")))
        .args([
            "--include=flake.nix",
            "--include=flake.lock",
            "--include=nix/***",
            "--exclude=*",
            "./",
        ])
        .arg(format!("{}:{}/", remote.ssh_target(), remote.repo_path))
        .current_dir(work_dir)
}

/// Copy a file from the builder host into `result-<name>/nixos.qcow2`.
pub(crate) fn scp_back(
    remote: &RemoteBuilderConfig,
    work_dir: &Path,
    image: &str,
    remote_file: String,
) -> CommandSpec {
    CommandSpec::new("scp")
        .args(ssh_options(remote))
        .arg(format!("{}:{}", remote.ssh_target(), remote_file))
        .arg(output_relative(image).display().to_string())
        .current_dir(work_dir)
}

pub fn remote_linux_steps(
    image: &ImageDefinition,
    remote: &RemoteBuilderConfig,
    work_dir: &Path,
) -> Vec<Step> {
    let repo = &remote.repo_path;
    let link = out_link(&image.name);
    vec![
        Step::cleanup(
            "cleanup on remote builder",
            ssh(
                remote,
                work_dir,
                format!(
                    "cd {} && rm -f result-* 2>/dev/null; nix-collect-garbage -d 2>/dev/null || true",
                    repo
                ),
            ),
        ),
        Step::required("rsync to remote builder", rsync_sources(remote, work_dir)),
        Step::required(
            "remote nix build",
            ssh(
                remote,
                work_dir,
                format!(
                    "cd {} && nix build '.#{}' --out-link {}",
                    repo, image.build_target, link
                ),
            ),
        ),
        Step::required(
            "copy result from remote builder",
            scp_back(remote, work_dir, &image.name, format!("{}/{}/nixos.qcow2", repo, link)),
        ),
    ]
}
