//! Child process execution with line-streamed output
//!
//! Every build step is an external command (`nix`, `ssh`, `rsync`, `scp`).
//! [`StreamingRunner`] spawns it, forwards stdout and stderr to the log sink
//! line by line from two reader tasks, and kills the child on cancellation.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{CancelSignal, LogSink};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// A command line to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {}", .code.map(|c| format!("status {}", c)).unwrap_or_else(|| "a signal".to_string()))]
    Exited { program: String, code: Option<i32> },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

/// Runs commands to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        sink: Arc<dyn LogSink>,
        cancel: &CancelSignal,
    ) -> Result<(), ProcessError>;
}

/// Spawns real processes with tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingRunner;

fn forward_lines<R>(reader: R, sink: Arc<dyn LogSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.info(&line),
                Ok(None) => break,
                Err(e) => {
                    sink.warn(&format!("output read error: {}", e));
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl CommandRunner for StreamingRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        sink: Arc<dyn LogSink>,
        cancel: &CancelSignal,
    ) -> Result<(), ProcessError> {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }
        tracing::debug!(command = %spec, "spawning");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, sink.clone()));
        }

        let outcome = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let result = match outcome {
            Some(Ok(status)) if status.success() => Ok(()),
            Some(Ok(status)) => Err(ProcessError::Exited {
                program: spec.program.clone(),
                code: status.code(),
            }),
            Some(Err(source)) => Err(ProcessError::Wait {
                program: spec.program.clone(),
                source,
            }),
            None => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(program = %spec.program, error = %e, "failed to kill cancelled process");
                }
                Err(ProcessError::Cancelled)
            }
        };

        // grandchildren of a killed process can keep the pipes open
        let cancelled = matches!(result, Err(ProcessError::Cancelled));
        for reader in readers {
            if cancelled {
                reader.abort();
            }
            match reader.await {
                Err(e) if !e.is_cancelled() => {
                    tracing::warn!(error = %e, "output reader task failed");
                }
                _ => {}
            }
        }

        result
    }
}
