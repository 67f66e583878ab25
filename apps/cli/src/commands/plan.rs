//! `tandem plan`: step budget and cadence for a run.

use super::{load_config, load_dataset};
use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;
use std::path::Path;
use tandem_training::progress::ensure_epochs_supported;
use tandem_training::{
    BatchSource, DataLoader, ExampleStore, ProgressPlan, SamplerConfig, SamplerKind,
};

pub fn execute(
    config_path: &Path,
    train_path: &Path,
    val_path: Option<&Path>,
    json_output: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let global_batch_size = config.trainer.global_batch_size;

    let train = load_dataset("train", train_path, &config)?;
    let fingerprint = train.records().fingerprint()?;
    let train_examples = train.len();
    let train_loader = DataLoader::new(train, global_batch_size, config.sampler.clone())?;
    ensure_epochs_supported(train_loader.reshuffles_each_epoch(), config.trainer.max_epochs)?;

    let val_batches = match val_path {
        Some(path) => {
            let val = load_dataset("val", path, &config)?;
            let sampler = SamplerConfig { kind: SamplerKind::Sequential, ..config.sampler.clone() };
            DataLoader::new(val, global_batch_size, sampler)?.num_batches()
        }
        None => 0,
    };

    let train_batches = train_loader.global_batches_per_epoch()?;
    let plan = ProgressPlan::resolve(&config.trainer, train_batches, val_batches)
        .context("Failed to resolve the training plan")?;

    if json_output {
        let out = json!({
            "train_examples": train_examples,
            "train_fingerprint": fingerprint,
            "global_batch_size": global_batch_size,
            "max_epochs": config.trainer.max_epochs,
            "steps_per_epoch": plan.steps_per_epoch,
            "max_steps": plan.max_steps,
            "val_check_interval": plan.val_check_interval,
            "limit_val_batches": plan.limit_val_batches,
            "save_interval": plan.save_interval,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", "Training Plan".bold().cyan());
    println!();
    println!(
        "  {:<22} {} ({})",
        "Train examples:",
        train_examples,
        fingerprint.to_string().dimmed()
    );
    println!("  {:<22} {}", "Global batch size:", global_batch_size);
    println!("  {:<22} {}", "Steps per epoch:", plan.steps_per_epoch);
    println!("  {:<22} {}", "Max steps:", plan.max_steps.to_string().green());
    if plan.limit_val_batches > 0 && plan.val_check_interval > 0 {
        println!(
            "  {:<22} every {} steps, {} batches",
            "Validation:", plan.val_check_interval, plan.limit_val_batches
        );
    } else {
        println!("  {:<22} {}", "Validation:", "disabled".dimmed());
    }
    if plan.save_interval > 0 {
        println!("  {:<22} every {} steps", "Save:", plan.save_interval);
    } else {
        println!("  {:<22} {}", "Save:", "disabled".dimmed());
    }
    println!();
    Ok(())
}
