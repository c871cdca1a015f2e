//! Image command handlers
//!
//! Read-only queries against the image registry.

use anyhow::Result;
use colored::*;
use kiln_client::ImageState;

use crate::config::Context;

pub async fn list_images(ctx: &Context, prefix: Option<&str>) -> Result<()> {
    let config = ctx.load_config()?;
    let client = ctx.transfer(&config)?;
    let images = client.list_images(prefix).await?;

    if images.is_empty() {
        println!("{}", "No images found".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} image(s):", images.len()).bold());
    println!();
    for image in images {
        let created = image
            .time_created
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {} [{}]",
            "●".cyan(),
            image.display_name.bold(),
            colour_state(&ImageState::parse(&image.lifecycle_state))
        );
        println!("    ID:      {}", image.id.dimmed());
        println!("    Created: {}", created.dimmed());
        println!();
    }
    Ok(())
}

pub async fn image_status(ctx: &Context, ids: &[String]) -> Result<()> {
    let config = ctx.load_config()?;
    let client = ctx.transfer(&config)?;

    for id in ids {
        let state = client.get_image_status(id).await?;
        println!("{}: {}", id, colour_state(&state));
    }
    Ok(())
}

fn colour_state(state: &ImageState) -> ColoredString {
    match state {
        ImageState::Available => state.as_str().green(),
        ImageState::Importing => state.as_str().yellow(),
        ImageState::NotFound => state.as_str().dimmed(),
        ImageState::Other(_) => state.as_str().red(),
    }
}
