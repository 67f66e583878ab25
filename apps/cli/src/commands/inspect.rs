//! `tandem inspect`: what the collator makes of a dataset.

use super::{load_config, load_dataset};
use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tandem_training::{
    Batch, BatchSource, Collator, DataLoader, Example, ExampleStore, IGNORE_INDEX, SamplerConfig,
    SingleProcess,
};

#[derive(Debug, Serialize)]
struct BatchSummary {
    index: usize,
    variant: &'static str,
    rows: usize,
    seq_len: usize,
    masked_examples: usize,
    padding_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    segments_per_row: Option<Vec<usize>>,
}

impl BatchSummary {
    fn new(index: usize, examples: &[Example], batch: &Batch) -> Self {
        let rows = batch.model_rows();
        let seq_len = batch.seq_len();
        let real_tokens: usize = examples.iter().map(real_tokens).sum();
        let masked_examples = match batch {
            // packed rows carry no per-row weight; a masked row has every label ignored
            Batch::Packed(_) => examples
                .iter()
                .filter(|e| {
                    matches!(e, Example::Packed(r) if r.labels.iter().all(|&l| l == IGNORE_INDEX))
                })
                .count(),
            _ => batch.example_weights().iter().filter(|&&w| w <= 0.0).count(),
        };
        let segments_per_row = matches!(batch, Batch::Packed(_)).then(|| {
            examples
                .iter()
                .filter_map(|e| match e {
                    Example::Packed(r) => Some(r.num_segments()),
                    _ => None,
                })
                .collect()
        });

        Self {
            index,
            variant: match batch {
                Batch::Pairs(_) => "pairs",
                Batch::Packed(_) => "packed",
                Batch::Regression(_) => "regression",
                Batch::Kto(_) => "kto",
            },
            rows,
            seq_len,
            masked_examples,
            padding_tokens: (rows * seq_len).saturating_sub(real_tokens),
            segments_per_row,
        }
    }
}

/// Tokens an example puts into the batch before padding.
fn real_tokens(example: &Example) -> usize {
    match example {
        Example::Pair(p) => p.chosen_length + p.rejected_length,
        // each segment gives up one position to the next-token shift
        Example::Packed(r) => r.input_ids.len().saturating_sub(r.num_segments()),
        Example::Regression(s) => s.length,
        Example::Kto(s) => s.sample_length,
    }
}

pub fn execute(
    dataset_path: &Path,
    config_path: &Path,
    batches: usize,
    json_output: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let dataset = load_dataset("inspect", dataset_path, &config)?;
    let total = dataset.len();

    // one worker sees the whole global batch
    let sampler =
        SamplerConfig { data_parallel_size: 1, data_parallel_rank: 0, ..config.sampler.clone() };
    let loader = DataLoader::new(dataset, config.trainer.global_batch_size, sampler)?;
    let collator = Collator::new(config.data.clone(), Arc::new(SingleProcess))?;

    let mut summaries = Vec::new();
    for (index, examples) in loader.iter_from(0).take(batches).enumerate() {
        let examples =
            examples.with_context(|| format!("Failed to produce examples for batch {index}"))?;
        let batch = collator
            .collate(&examples)
            .with_context(|| format!("Failed to collate batch {index}"))?;
        summaries.push(BatchSummary::new(index, &examples, &batch));
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({
            "examples": total,
            "batches": summaries,
        }))?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Batches ({} from {} examples)", summaries.len(), total).bold().cyan());
    println!();
    if summaries.is_empty() {
        println!("  {}", "Dataset is too small for one global batch.".dimmed());
        println!();
        return Ok(());
    }

    println!(
        "{:<6} {:<11} {:>5} {:>8} {:>7} {:>8}  {}",
        "Batch", "Variant", "Rows", "Width", "Masked", "Padding", "Segments"
    );
    println!("{}", "─".repeat(70));
    for s in &summaries {
        let segments = s
            .segments_per_row
            .as_ref()
            .map(|v| v.iter().map(ToString::to_string).collect::<Vec<_>>().join(","))
            .unwrap_or_default();
        let masked = if s.masked_examples > 0 {
            s.masked_examples.to_string().yellow()
        } else {
            "0".normal()
        };
        println!(
            "{:<6} {:<11} {:>5} {:>8} {:>7} {:>8}  {}",
            s.index,
            s.variant.cyan(),
            s.rows,
            s.seq_len,
            masked,
            s.padding_tokens,
            segments.dimmed()
        );
    }
    println!();
    Ok(())
}
