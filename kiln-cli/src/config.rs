//! Command context
//!
//! Global options shared by every command, and the constructors for the
//! components a command needs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use kiln_builder::Builder;
use kiln_client::TransferClient;
use kiln_core::{CancelSignal, Config, LogSink};
use kiln_orchestrator::StateStore;

pub struct Context {
    /// Explicit `--config`; the search locations are used when unset.
    pub config_path: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub sink: Arc<dyn LogSink>,
    pub cancel: CancelSignal,
}

impl Context {
    pub fn load_config(&self) -> Result<Config> {
        let (config, path) =
            Config::load(self.config_path.as_deref()).context("Failed to load configuration")?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(StateStore::default_path)
    }

    pub fn open_store(&self) -> Result<StateStore> {
        StateStore::open(self.state_path()).context("Failed to load pipeline state")
    }

    /// Build outputs land in the current directory, which holds the flake.
    pub fn work_dir(&self) -> Result<PathBuf> {
        std::env::current_dir().context("Failed to determine the working directory")
    }

    pub fn builder(&self, config: &Config, local_only: bool) -> Result<Builder> {
        Ok(Builder::new(self.work_dir()?, config.remote_builder.clone())
            .local_only(local_only)
            .with_sink(self.sink.clone())
            .with_cancel(self.cancel.clone()))
    }

    pub fn transfer(&self, config: &Config) -> Result<TransferClient> {
        let client = TransferClient::from_config(&config.storage, self.work_dir()?)
            .context("Failed to create the cloud client")?;
        Ok(client
            .with_sink(self.sink.clone())
            .with_cancel(self.cancel.clone()))
    }
}
