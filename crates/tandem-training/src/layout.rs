use crate::error::TrainingResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Identifier of one `fit` invocation; names its run directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Filesystem layout for run outputs.
///
/// Default layout is under `.tandem/runs/<run_id>/...`
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn for_workspace_root(workspace_root: &Path) -> Self {
        Self::new(workspace_root.join(".tandem").join("runs"))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.0.as_str())
    }

    #[must_use]
    pub fn checkpoints_dir(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("checkpoints")
    }

    #[must_use]
    pub fn metrics_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("metrics.jsonl")
    }

    /// `step` is zero-padded so lexical order matches step order.
    #[must_use]
    pub fn state_path(&self, run_id: &RunId, step: u64) -> PathBuf {
        self.checkpoints_dir(run_id).join(format!("trainer_state_step{step:010}.json"))
    }

    pub fn ensure_run_dirs(&self, run_id: &RunId) -> TrainingResult<()> {
        std::fs::create_dir_all(self.checkpoints_dir(run_id))?;
        Ok(())
    }
}
