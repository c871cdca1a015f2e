//! Pipeline command handlers
//!
//! Build, upload, import, all and resume. Each prints one `var = "id"`
//! line per image id it produced.

use anyhow::{Context as _, Result};
use colored::*;
use kiln_builder::check_prerequisites;
use kiln_core::{Config, RunStage};
use kiln_orchestrator::{Pipeline, PipelineError, ResumeOutcome, StateStore, format_duration};

use crate::config::Context;

pub async fn build(
    ctx: &Context,
    images: &[String],
    local_only: bool,
    build_only: bool,
) -> Result<()> {
    let config = ctx.load_config()?;
    let selected = selected_names(&config, images)?;
    let builder = ctx.builder(&config, local_only)?;
    check_prerequisites(builder.needs_remote(&config.select_images(&selected)?))?;
    let store = ctx.open_store()?;

    if build_only {
        let mut pipeline =
            Pipeline::new(builder, (), store, config.images.clone()).with_sink(ctx.sink.clone());
        let results = pipeline.run_build(&selected).await?;

        println!("\n{}", "Built images:".bold());
        for result in &results {
            println!(
                "  {}: {} ({} MB)",
                result.image_name.cyan(),
                result.output_path.display(),
                result.size_bytes / (1024 * 1024)
            );
        }
        return Ok(());
    }

    // Check credentials before spending time on the build.
    let transfer = ctx.transfer(&config)?;
    let mut pipeline =
        Pipeline::new(builder, transfer, store, config.images.clone()).with_sink(ctx.sink.clone());
    pipeline.run_build(&selected).await?;
    let uploaded = pipeline.run_upload(&selected).await?;
    print_uploaded(uploaded.iter().map(|u| u.object_name.as_str()));
    Ok(())
}

pub async fn upload(ctx: &Context, images: &[String]) -> Result<()> {
    let config = ctx.load_config()?;
    let selected = selected_names(&config, images)?;
    let transfer = ctx.transfer(&config)?;
    let store = ctx.open_store()?;

    let mut pipeline =
        Pipeline::new((), transfer, store, config.images.clone()).with_sink(ctx.sink.clone());
    let uploaded = pipeline.run_upload(&selected).await?;
    print_uploaded(uploaded.iter().map(|u| u.object_name.as_str()));
    Ok(())
}

pub async fn import(ctx: &Context, objects: &[String]) -> Result<()> {
    let config = ctx.load_config()?;
    let transfer = ctx.transfer(&config)?;
    // Explicit imports do not touch the run state.
    let store = StateStore::new(ctx.state_path());

    let pipeline =
        Pipeline::new((), transfer, store, config.images.clone()).with_sink(ctx.sink.clone());
    let imported = pipeline.run_import(objects).await?;
    print_outputs(
        imported
            .iter()
            .map(|img| (pipeline.output_variable(&img.image), img.image_id.clone())),
    );
    Ok(())
}

pub async fn all(ctx: &Context, images: &[String], local_only: bool) -> Result<()> {
    let config = ctx.load_config()?;
    let selected = selected_names(&config, images)?;
    let builder = ctx.builder(&config, local_only)?;
    check_prerequisites(builder.needs_remote(&config.select_images(&selected)?))?;
    let transfer = ctx.transfer(&config)?;
    let store = ctx.open_store()?;

    let mut pipeline =
        Pipeline::new(builder, transfer, store, config.images.clone()).with_sink(ctx.sink.clone());
    pipeline.run_all(&selected).await?;

    print_summary(pipeline.store());
    print_outputs(pipeline.outputs());
    Ok(())
}

pub async fn resume(ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let store = ctx.open_store()?;
    let Some(run) = store.run() else {
        println!("No saved state found. Run 'kiln all' to start a pipeline.");
        return Err(PipelineError::NothingToResume.into());
    };

    let builder = ctx.builder(&config, false)?;
    if matches!(run.stage, RunStage::Pending | RunStage::Build) && !run.complete {
        let names: Vec<String> = run.image_names().iter().map(|s| s.to_string()).collect();
        let definitions = config
            .select_images(&names)
            .context("Saved run refers to images missing from the configuration")?;
        check_prerequisites(builder.needs_remote(&definitions))?;
    }
    let transfer = ctx.transfer(&config)?;

    let mut pipeline =
        Pipeline::new(builder, transfer, store, config.images.clone()).with_sink(ctx.sink.clone());
    if pipeline.resume().await? == ResumeOutcome::Completed {
        print_summary(pipeline.store());
    }
    print_outputs(pipeline.outputs());
    Ok(())
}

/// Validated image names; all configured images when none are given.
fn selected_names(config: &Config, images: &[String]) -> Result<Vec<String>> {
    Ok(config
        .select_images(images)?
        .into_iter()
        .map(|def| def.name)
        .collect())
}

fn print_uploaded<'a>(objects: impl Iterator<Item = &'a str>) {
    println!("\n{}", "Uploaded objects:".bold());
    for object in objects {
        println!("  {}", object.cyan());
    }
}

fn print_summary(store: &StateStore) {
    let Some(stats) = store.compute_statistics() else {
        return;
    };
    println!("\n{}", "=== Build Statistics ===".bold());
    println!("Total Duration: {}", format_duration(stats.total));
    println!(
        "  Build: {} | Upload: {} | Import: {}",
        format_duration(stats.build),
        format_duration(stats.upload),
        format_duration(stats.import)
    );
    if stats.bytes_uploaded > 0 {
        println!(
            "Upload: {:.2} GB at {:.2} MB/s",
            stats.bytes_uploaded as f64 / (1024.0 * 1024.0 * 1024.0),
            stats.upload_throughput
        );
    }
}

fn print_outputs(outputs: impl IntoIterator<Item = (String, String)>) {
    println!("\n{}", "=== Add to terraform.tfvars ===".bold());
    for (variable, id) in outputs {
        println!("{} = \"{}\"", variable, id);
    }
}
