//! Subcommand implementations.

pub mod inspect;
pub mod plan;
pub mod state;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tandem_training::{PreferenceDataset, RunConfig};

pub(crate) fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::load_from_file(path)
        .with_context(|| format!("Failed to load run configuration {}", path.display()))
}

/// Datasets are opened without a tokenizer: only tokenized records can be collated.
pub(crate) fn load_dataset(
    name: &str,
    path: &Path,
    config: &RunConfig,
) -> Result<Arc<PreferenceDataset>> {
    let dataset = PreferenceDataset::from_jsonl(name, path, config.data.clone(), None)
        .with_context(|| format!("Failed to load {name} dataset {}", path.display()))?;
    Ok(Arc::new(dataset))
}
