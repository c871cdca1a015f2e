//! Two-hop remote build through the Linux builder VM of a macOS host
//!
//! Sources are synced to the Mac, copied into the VM over a second ssh hop
//! (the VM listens on `localhost:<vm_port>` from the Mac's point of view),
//! built there, and the artifact travels back the same way.

use std::path::Path;

use kiln_core::{ImageDefinition, RemoteBuilderConfig};

use crate::local::out_link;
use crate::remote::{rsync_sources, scp_back, ssh};
use crate::strategy::Step;

const VM_SSH_OPTS: &str = "-o StrictHostKeyChecking=no";

fn vm_ssh(remote: &RemoteBuilderConfig) -> String {
    format!(
        "ssh {} -i {} -p {} {}@localhost",
        VM_SSH_OPTS, remote.vm_key_path, remote.vm_port, remote.vm_user
    )
}

fn vm_scp(remote: &RemoteBuilderConfig) -> String {
    format!(
        "scp {} -i {} -P {}",
        VM_SSH_OPTS, remote.vm_key_path, remote.vm_port
    )
}

pub fn mac_vm_steps(
    image: &ImageDefinition,
    remote: &RemoteBuilderConfig,
    work_dir: &Path,
) -> Vec<Step> {
    let repo = &remote.repo_path;
    let name = &image.name;
    let link = out_link(name);
    let vm_dir = format!("~/build-{}", name);
    let staged = format!("{}/{}-nixos.qcow2", repo, link);

    vec![
        Step::cleanup(
            "cleanup on Mac host",
            ssh(
                remote,
                work_dir,
                format!("rm -f {}/result-*-nixos.qcow2 2>/dev/null || true", repo),
            ),
        ),
        Step::cleanup(
            "cleanup in builder VM",
            ssh(
                remote,
                work_dir,
                format!(
                    "{} 'rm -rf ~/build-* 2>/dev/null; nix-collect-garbage -d 2>/dev/null || true'",
                    vm_ssh(remote)
                ),
            ),
        ),
        Step::required("rsync to Mac host", rsync_sources(remote, work_dir)),
        Step::required(
            "copy sources into builder VM",
            ssh(
                remote,
                work_dir,
                format!(
                    "{vm} 'mkdir -p {dir}' && {scp} -r {repo}/{{flake.nix,flake.lock,nix}} {user}@localhost:{dir}/",
                    vm = vm_ssh(remote),
                    dir = vm_dir,
                    scp = vm_scp(remote),
                    repo = repo,
                    user = remote.vm_user,
                ),
            ),
        ),
        Step::required(
            "nix build in builder VM",
            ssh(
                remote,
                work_dir,
                format!(
                    "{} 'cd {} && nix build '\\''.#{}'\\'' --out-link {} --max-jobs auto --extra-experimental-features nix-command --extra-experimental-features flakes'",
                    vm_ssh(remote),
                    vm_dir,
                    image.build_target,
                    link
                ),
            ),
        ),
        Step::required(
            "copy image from builder VM to Mac host",
            ssh(
                remote,
                work_dir,
                format!(
                    "{} {}@localhost:{}/{}/nixos.qcow2 {}",
                    vm_scp(remote),
                    remote.vm_user,
                    vm_dir,
                    link,
                    staged
                ),
            ),
        ),
        Step::required(
            "copy image from Mac host",
            scp_back(remote, work_dir, name, staged.clone()),
        ),
    ]
}
