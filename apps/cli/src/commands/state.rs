//! `tandem state`: newest trainer state saved in a checkpoint directory.

use anyhow::{Context, Result, bail};
use colored::Colorize;
use std::path::Path;
use tandem_training::load_latest_state;

pub fn execute(dir: &Path, json_output: bool) -> Result<()> {
    let state = load_latest_state(dir)
        .with_context(|| format!("Failed to read trainer state from {}", dir.display()))?;
    let Some(state) = state else {
        bail!("No saved trainer state in {}", dir.display());
    };

    if json_output {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!();
    println!("{}", "Saved Trainer State".bold().cyan());
    println!();
    println!("  {:<18} {}", "Step:", state.step.to_string().green());
    println!("  {:<18} {}", "Consumed samples:", state.consumed_samples);
    println!("  {:<18} {}", "Epoch:", state.epoch);
    println!();
    Ok(())
}
