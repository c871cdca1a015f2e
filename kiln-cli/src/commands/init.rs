//! Init command handler
//!
//! Writes the starter configuration template.

use std::path::Path;

use anyhow::{Context, Result};
use colored::*;
use kiln_core::config::{DEFAULT_AUTH_TOKEN_ENV, init_config_file};

pub fn handle_init(path: Option<&Path>) -> Result<()> {
    let path = init_config_file(path).context("Failed to create config file")?;

    println!("{}", "✓ Config file created!".green().bold());
    println!("  Path: {}", path.display().to_string().cyan());
    println!();
    println!("{}", "Next steps:".bold());
    println!("  1. Set compartment_id, bucket_name and region under [storage]");
    println!("  2. Export the API token in {}", DEFAULT_AUTH_TOKEN_ENV.cyan());
    println!("  3. Run {} to build, upload and import", "kiln all".cyan());
    Ok(())
}
