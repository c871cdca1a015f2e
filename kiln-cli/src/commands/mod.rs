//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod image;
mod init;
mod pipeline;
mod state;

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Context;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter config file
    Init {
        /// Where to write it (default: <user config dir>/kiln/config.toml)
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Build images, then upload them unless --build-only
    Build {
        /// Images to build (default: all configured)
        images: Vec<String>,

        /// Build foreign-architecture images on this machine too
        #[arg(long)]
        local_only: bool,

        /// Stop after the build stage
        #[arg(long)]
        build_only: bool,
    },
    /// Upload built images to object storage
    Upload {
        /// Images to upload (default: all configured)
        images: Vec<String>,
    },
    /// Import uploaded objects as compute images and wait for them
    Import {
        /// Object names, e.g. headscale-20240115-123456.qcow2
        #[arg(required = true)]
        objects: Vec<String>,
    },
    /// Run the whole pipeline as a new run
    All {
        /// Images to process (default: all configured)
        images: Vec<String>,

        /// Build foreign-architecture images on this machine too
        #[arg(long)]
        local_only: bool,
    },
    /// Continue the last run from where it stopped
    Resume,
    /// Show the saved pipeline state
    State {
        /// Delete the state file
        #[arg(long)]
        clear: bool,
    },
    /// Show timing statistics of the last run
    Stats,
    /// List compute images in the compartment
    List {
        /// Only show images whose display name starts with this
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Show the lifecycle state of images
    Status {
        /// Image ids
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, ctx: &Context) -> Result<()> {
    match command {
        Commands::Init { path } => init::handle_init(path.as_deref()),
        Commands::Build {
            images,
            local_only,
            build_only,
        } => pipeline::build(ctx, &images, local_only, build_only).await,
        Commands::Upload { images } => pipeline::upload(ctx, &images).await,
        Commands::Import { objects } => pipeline::import(ctx, &objects).await,
        Commands::All { images, local_only } => pipeline::all(ctx, &images, local_only).await,
        Commands::Resume => pipeline::resume(ctx).await,
        Commands::State { clear } => state::show_state(ctx, clear),
        Commands::Stats => state::show_stats(ctx),
        Commands::List { prefix } => image::list_images(ctx, prefix.as_deref()).await,
        Commands::Status { ids } => image::image_status(ctx, &ids).await,
    }
}
