//! Tracing setup
//!
//! Library events go to stderr, filtered by `RUST_LOG` or `kiln=info`
//! (`kiln=debug` with `--verbose`). The console transcript is also emitted
//! under [`CONSOLE_TARGET`]; it is kept out of stderr, which already shows it,
//! but lands in the `--log-file` if one is given.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const CONSOLE_TARGET: &str = "kiln::console";

pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default = if verbose { "kiln=debug" } else { "kiln=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter_fn(|meta| meta.target() != CONSOLE_TARGET));

    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    Ok(())
}
