//! Kiln CLI
//!
//! Command-line interface for building, uploading and importing machine images.

mod commands;
mod config;
mod console;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::*;
use commands::{Commands, handle_command};
use config::Context;
use console::ConsoleSink;
use kiln_core::cancel_channel;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Resumable machine image build, upload and import pipeline", long_about = None)]
struct Cli {
    /// Config file (default: kiln.toml, scripts/kiln.toml, then the user config dir)
    #[arg(long, global = true, env = "KILN_CONFIG")]
    config: Option<PathBuf>,

    /// Pipeline state file (default: <user cache dir>/kiln/state.toml)
    #[arg(long, global = true, env = "KILN_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_file.as_deref())?;

    let (cancel_handle, cancel) = cancel_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, stopping...".yellow().bold());
            cancel_handle.cancel();
        }
    });

    let ctx = Context {
        config_path: cli.config,
        state_file: cli.state_file,
        sink: Arc::new(ConsoleSink::new(cli.verbose)),
        cancel,
    };

    handle_command(cli.command, &ctx).await
}
