//! Image builder
//!
//! Chooses a strategy per image and runs its protocol step by step,
//! streaming every command's output to the log sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::{Arch, CancelSignal, ImageDefinition, LogSink, RemoteBuilderConfig, TracingSink};

use crate::error::BuildError;
use crate::local::{local_steps, out_link, output_relative, resolve_local_output};
use crate::macos::mac_vm_steps;
use crate::process::{CommandRunner, ProcessError, StreamingRunner};
use crate::remote::remote_linux_steps;
use crate::strategy::{BuildStrategy, Step, select_strategy};

const MIB: u64 = 1024 * 1024;

/// A finished build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub image_name: String,
    pub output_path: PathBuf,
    pub size_bytes: u64,
}

pub struct Builder<R = StreamingRunner> {
    runner: R,
    work_dir: PathBuf,
    remote: Option<RemoteBuilderConfig>,
    local_only: bool,
    host: Option<Arch>,
    sink: Arc<dyn LogSink>,
    cancel: CancelSignal,
}

impl Builder<StreamingRunner> {
    pub fn new(work_dir: impl Into<PathBuf>, remote: Option<RemoteBuilderConfig>) -> Self {
        Self::with_runner(StreamingRunner, work_dir, remote)
    }
}

impl<R: CommandRunner> Builder<R> {
    pub fn with_runner(
        runner: R,
        work_dir: impl Into<PathBuf>,
        remote: Option<RemoteBuilderConfig>,
    ) -> Self {
        Self {
            runner,
            work_dir: work_dir.into(),
            remote,
            local_only: false,
            host: Arch::host(),
            sink: Arc::new(TracingSink),
            cancel: CancelSignal::never(),
        }
    }

    /// Build every image on this machine regardless of architecture.
    pub fn local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    pub fn with_host_arch(mut self, host: Option<Arch>) -> Self {
        self.host = host;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn strategy_for(&self, image: &ImageDefinition) -> Result<BuildStrategy<'_>, BuildError> {
        select_strategy(image, self.host, self.local_only, self.remote.as_ref())
    }

    /// True when any of `images` would be built remotely.
    pub fn needs_remote(&self, images: &[ImageDefinition]) -> bool {
        images
            .iter()
            .any(|img| matches!(self.strategy_for(img), Ok(s) if s.is_remote()))
    }

    /// Build images one after another, stopping at the first failure.
    pub async fn build(&self, images: &[ImageDefinition]) -> Result<Vec<BuildResult>, BuildError> {
        let mut results = Vec::with_capacity(images.len());
        for image in images {
            results.push(self.build_image(image).await?);
        }
        Ok(results)
    }

    pub async fn build_image(&self, image: &ImageDefinition) -> Result<BuildResult, BuildError> {
        let strategy = self.strategy_for(image)?;
        tracing::info!(image = %image.name, %strategy, "building image");

        let output_path = match strategy {
            BuildStrategy::Local => {
                self.sink.info(&format!("Building {} locally...", image.name));
                self.sink
                    .info(&format!("  Target: .#{}", image.build_target));
                self.sink
                    .info(&format!("  Output: {}", out_link(&image.name)));
                self.run_steps(image, &local_steps(image, &self.work_dir))
                    .await?;
                resolve_local_output(&image.name, &self.work_dir)?
            }
            BuildStrategy::RemoteLinux(remote) | BuildStrategy::RemoteMacVm(remote) => {
                let steps = if matches!(strategy, BuildStrategy::RemoteMacVm(_)) {
                    self.sink.info(&format!(
                        "Building {} on macOS builder {} (via linux-builder VM)...",
                        image.name, remote.host
                    ));
                    mac_vm_steps(image, remote, &self.work_dir)
                } else {
                    self.sink.info(&format!(
                        "Building {} on remote builder {}...",
                        image.name, remote.host
                    ));
                    remote_linux_steps(image, remote, &self.work_dir)
                };
                self.prepare_output_dir(&image.name)?;
                self.run_steps(image, &steps).await?;
                self.copied_output(&image.name)?
            }
        };

        let size_bytes = std::fs::metadata(&output_path)
            .map(|m| m.len())
            .map_err(|source| BuildError::OutputMissing {
                image: image.name.clone(),
                path: output_path.clone(),
                source,
            })?;

        self.sink.info(&format!(
            "Build complete: {} ({} MB)",
            output_path.display(),
            size_bytes / MIB
        ));

        Ok(BuildResult {
            image_name: image.name.clone(),
            output_path,
            size_bytes,
        })
    }

    async fn run_steps(&self, image: &ImageDefinition, steps: &[Step]) -> Result<(), BuildError> {
        for step in steps {
            self.sink.info(&format!("  {}...", step.label));
            tracing::debug!(image = %image.name, step = %step.label, command = %step.command, "running step");

            match self
                .runner
                .run(&step.command, self.sink.clone(), &self.cancel)
                .await
            {
                Ok(()) => {}
                Err(ProcessError::Cancelled) => return Err(BuildError::Cancelled),
                Err(err) if !step.required => {
                    tracing::warn!(image = %image.name, step = %step.label, error = %err, "cleanup failed");
                    self.sink
                        .warn(&format!("  Cleanup warning (non-fatal): {}", err));
                }
                Err(source) => {
                    return Err(BuildError::StepFailed {
                        image: image.name.clone(),
                        step: step.label.clone(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// `result-<name>` must be a real directory to receive the copied artifact.
    fn prepare_output_dir(&self, image: &str) -> Result<(), BuildError> {
        let dir = self.work_dir.join(out_link(image));
        let prepare_err = |source: std::io::Error| BuildError::Prepare {
            image: image.to_string(),
            path: dir.clone(),
            source,
        };
        // a previous local build leaves a symlink into the read-only store
        if dir.is_symlink() {
            std::fs::remove_file(&dir).map_err(prepare_err)?;
        }
        std::fs::create_dir_all(&dir).map_err(prepare_err)
    }

    fn copied_output(&self, image: &str) -> Result<PathBuf, BuildError> {
        let path = self.work_dir.join(output_relative(image));
        Ok(std::path::absolute(&path).unwrap_or(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_core::MemorySink;
    use std::sync::Mutex;

    /// Records commands; fails those whose program matches, and can fake outputs.
    #[derive(Default)]
    struct RecordingRunner {
        commands: Mutex<Vec<String>>,
        fail_program: Option<&'static str>,
        fail_first_only: bool,
        write_output: Option<(PathBuf, Vec<u8>)>,
    }

    impl RecordingRunner {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(
            &self,
            spec: &crate::process::CommandSpec,
            sink: Arc<dyn LogSink>,
            _cancel: &CancelSignal,
        ) -> Result<(), ProcessError> {
            let count = {
                let mut commands = self.commands.lock().unwrap();
                commands.push(spec.to_string());
                commands
                    .iter()
                    .filter(|c| c.starts_with(&spec.program))
                    .count()
            };
            sink.info(&format!("ran {}", spec.program));
            if self.fail_program == Some(spec.program.as_str())
                && (!self.fail_first_only || count == 1)
            {
                return Err(ProcessError::Exited {
                    program: spec.program.clone(),
                    code: Some(1),
                });
            }
            if let Some((path, content)) = &self.write_output {
                if spec.program == "scp" || spec.program == "nix" {
                    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                    std::fs::write(path, content).unwrap();
                }
            }
            Ok(())
        }
    }

    fn remote(is_macos: bool) -> RemoteBuilderConfig {
        RemoteBuilderConfig {
            host: "builder.lan".into(),
            user: "nix".into(),
            ssh_key: None,
            repo_path: "~/builds".into(),
            is_macos,
            vm_port: 31022,
            vm_user: "builder".into(),
            vm_key_path: "/etc/nix/builder_ed25519".into(),
        }
    }

    fn derp() -> ImageDefinition {
        ImageDefinition::new("derp", "oci-derp-east-image", Arch::Aarch64)
    }

    #[tokio::test]
    async fn local_build_records_resolved_output_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("result-derp").join("nixos.qcow2");
        let runner = RecordingRunner {
            write_output: Some((output.clone(), vec![0u8; 2048])),
            ..Default::default()
        };
        let sink = Arc::new(MemorySink::new());
        let builder = Builder::with_runner(runner, dir.path(), None)
            .local_only(true)
            .with_sink(sink.clone());

        let result = builder.build_image(&derp()).await.unwrap();
        assert_eq!(result.image_name, "derp");
        assert_eq!(result.size_bytes, 2048);
        assert_eq!(result.output_path, std::fs::canonicalize(&output).unwrap());
        assert_eq!(
            builder.runner.commands(),
            vec!["nix build .#oci-derp-east-image --out-link result-derp"]
        );
        assert!(sink.contains("Building derp locally"));
    }

    #[tokio::test]
    async fn remote_build_copies_into_result_dir() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("result-derp").join("nixos.qcow2");
        let runner = RecordingRunner {
            write_output: Some((output.clone(), vec![1u8; 10])),
            ..Default::default()
        };
        let builder = Builder::with_runner(runner, dir.path(), Some(remote(false)))
            .with_host_arch(Some(Arch::X86_64))
            .with_sink(Arc::new(MemorySink::new()));

        let result = builder.build_image(&derp()).await.unwrap();
        assert_eq!(result.size_bytes, 10);
        assert!(result.output_path.ends_with("result-derp/nixos.qcow2"));

        let programs: Vec<_> = builder
            .runner
            .commands()
            .iter()
            .map(|c| c.split(' ').next().unwrap().to_string())
            .collect();
        assert_eq!(programs, vec!["ssh", "rsync", "ssh", "scp"]);
    }

    #[tokio::test]
    async fn cleanup_failure_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("result-derp").join("nixos.qcow2");
        let runner = RecordingRunner {
            fail_program: Some("ssh"),
            fail_first_only: true,
            write_output: Some((output, vec![1u8; 4])),
            ..Default::default()
        };
        let sink = Arc::new(MemorySink::new());
        let builder = Builder::with_runner(runner, dir.path(), Some(remote(false)))
            .with_host_arch(Some(Arch::X86_64))
            .with_sink(sink.clone());

        builder.build_image(&derp()).await.unwrap();
        assert!(sink.contains("Cleanup warning (non-fatal)"));
        assert_eq!(builder.runner.commands().len(), 4);
    }

    #[tokio::test]
    async fn failing_step_aborts_with_its_name() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner {
            fail_program: Some("rsync"),
            ..Default::default()
        };
        let builder = Builder::with_runner(runner, dir.path(), Some(remote(true)))
            .with_host_arch(Some(Arch::X86_64))
            .with_sink(Arc::new(MemorySink::new()));

        let err = builder.build_image(&derp()).await.unwrap_err();
        match err {
            BuildError::StepFailed { image, step, .. } => {
                assert_eq!(image, "derp");
                assert_eq!(step, "rsync to Mac host");
            }
            other => panic!("expected StepFailed, got {:?}", other),
        }
        // two cleanups and the failed rsync, nothing after it
        assert_eq!(builder.runner.commands().len(), 3);
    }

    #[tokio::test]
    async fn foreign_image_without_builder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Builder::with_runner(RecordingRunner::default(), dir.path(), None)
            .with_host_arch(Some(Arch::X86_64));

        assert!(!builder.needs_remote(&[derp()]));
        let err = builder.build(&[derp()]).await.unwrap_err();
        assert!(matches!(err, BuildError::BuilderNotConfigured { .. }));
        assert!(builder.runner.commands().is_empty());
    }

    #[test]
    fn needs_remote_follows_strategy() {
        let builder = Builder::new("/repo", Some(remote(false))).with_host_arch(Some(Arch::X86_64));
        let headscale = ImageDefinition::new("headscale", "oci-headscale-image", Arch::X86_64);
        assert!(!builder.needs_remote(std::slice::from_ref(&headscale)));
        assert!(builder.needs_remote(&[headscale, derp()]));
        assert!(!Builder::new("/repo", Some(remote(false)))
            .with_host_arch(Some(Arch::X86_64))
            .local_only(true)
            .needs_remote(&[derp()]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_store_symlink_is_replaced_for_remote_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir_all(&store).unwrap();
        std::os::unix::fs::symlink(&store, dir.path().join("result-derp")).unwrap();

        let builder = Builder::with_runner(RecordingRunner::default(), dir.path(), Some(remote(false)));
        builder.prepare_output_dir("derp").unwrap();
        assert!(!dir.path().join("result-derp").is_symlink());
        assert!(dir.path().join("result-derp").is_dir());
    }
}
