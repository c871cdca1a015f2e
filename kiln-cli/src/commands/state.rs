//! State command handlers
//!
//! Inspect or clear the saved run, and print its statistics.

use anyhow::{Context as _, Result};
use colored::*;
use kiln_core::ImageStage;
use kiln_orchestrator::format_duration;

use crate::config::Context;

pub fn show_state(ctx: &Context, clear: bool) -> Result<()> {
    if clear {
        let mut store = kiln_orchestrator::StateStore::new(ctx.state_path());
        if store.clear().context("Failed to clear pipeline state")? {
            println!("{}", "✓ Pipeline state cleared".green().bold());
        } else {
            println!("No saved state to clear.");
        }
        return Ok(());
    }

    let store = ctx.open_store()?;
    let Some(run) = store.run() else {
        println!("No saved state found.");
        return Ok(());
    };

    println!("{}", format!("Pipeline run {}", run.run_id).bold());
    println!("  Stage:    {}", run.stage.to_string().cyan());
    println!(
        "  Started:  {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  Updated:  {}",
        run.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(done) = run.completed_at {
        println!("  Finished: {}", done.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();

    println!("{}", "Images:".bold());
    for img in &run.images {
        let stage = match img.stage {
            ImageStage::Complete => img.stage.to_string().green(),
            ImageStage::Error => img.stage.to_string().red(),
            ImageStage::Pending => img.stage.to_string().dimmed(),
            _ => img.stage.to_string().yellow(),
        };
        println!("  {} [{}]", img.name.cyan(), stage);
        if let Some(path) = img.local_path() {
            println!("    Local path: {}", path.display());
        }
        if let Some(object) = img.object_name() {
            println!("    Object:     {}", object);
        }
        if let Some(id) = img.image_id() {
            println!("    Image id:   {}", id);
        }
        if let Some(err) = &img.error {
            println!("    Error:      {}", err.red());
        }
    }

    println!("\nState file: {}", store.path().display().to_string().dimmed());
    if run.is_resumable() {
        println!("Run {} to continue.", "kiln resume".cyan());
    }
    Ok(())
}

pub fn show_stats(ctx: &Context) -> Result<()> {
    let store = ctx.open_store()?;
    let Some(stats) = store.compute_statistics() else {
        println!("No saved state found. Run a build first.");
        return Ok(());
    };

    println!(
        "{}",
        format!("=== Pipeline Statistics (Run: {}) ===", stats.run_id).bold()
    );
    println!();
    println!("Total Duration:     {}", format_duration(stats.total));
    println!();
    println!("Stage Durations:");
    println!("  Build:            {}", format_duration(stats.build));
    println!("  Upload:           {}", format_duration(stats.upload));
    println!("  Import:           {}", format_duration(stats.import));
    println!();

    if stats.bytes_uploaded > 0 {
        println!("Upload Statistics:");
        println!(
            "  Total Uploaded:   {:.2} GB",
            stats.bytes_uploaded as f64 / (1024.0 * 1024.0 * 1024.0)
        );
        println!("  Throughput:       {:.2} MB/s", stats.upload_throughput);
        println!();
    }

    if !stats.images.is_empty() {
        println!("Per-Image Breakdown:");
        println!(
            "  {:<12} {:>10} {:>10} {:>10} {:>10} {:>10}",
            "Image", "Build", "Upload", "Import", "Total", "MB/s"
        );
        println!("  {}", "-".repeat(64));
        for img in &stats.images {
            let throughput = if img.upload_throughput > 0.0 {
                format!("{:.2}", img.upload_throughput)
            } else {
                "-".to_string()
            };
            println!(
                "  {:<12} {:>10} {:>10} {:>10} {:>10} {:>10}",
                img.name,
                format_duration(img.build),
                format_duration(img.upload),
                format_duration(img.import),
                format_duration(img.total),
                throughput
            );
        }
    }

    println!("\nState file: {}", store.path().display());
    Ok(())
}
