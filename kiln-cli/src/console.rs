//! Console log sink

use colored::*;
use kiln_core::{LogLevel, LogSink};

use crate::logging::CONSOLE_TARGET;

/// Prints pipeline progress for the operator
///
/// Info goes to stdout, warnings and errors to stderr. Debug lines only
/// show with `--verbose`. Every line is also emitted as a tracing event.
pub struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl LogSink for ConsoleSink {
    fn write(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => {
                tracing::debug!(target: CONSOLE_TARGET, "{}", message);
                if self.verbose {
                    println!("{}", message.dimmed());
                }
            }
            LogLevel::Info => {
                tracing::info!(target: CONSOLE_TARGET, "{}", message);
                if message.starts_with("===") {
                    println!("\n{}", message.bold());
                } else {
                    println!("{}", message);
                }
            }
            LogLevel::Warning => {
                tracing::warn!(target: CONSOLE_TARGET, "{}", message);
                eprintln!("{}", message.yellow());
            }
            LogLevel::Error => {
                tracing::error!(target: CONSOLE_TARGET, "{}", message);
                eprintln!("{}", message.red());
            }
        }
    }
}
