//! Trainer state and where it goes on save.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::{RunId, RunLayout};
use crate::logger::Metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Progress owned by the orchestrator. The epoch is always derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainerState {
    pub step: u64,
    pub consumed_samples: u64,
}

impl TrainerState {
    pub fn epoch(&self, steps_per_epoch: u64) -> u64 {
        self.step.checked_div(steps_per_epoch).unwrap_or(0)
    }

    pub fn snapshot(&self, steps_per_epoch: u64) -> TrainerStateSnapshot {
        TrainerStateSnapshot {
            step: self.step,
            consumed_samples: self.consumed_samples,
            epoch: self.epoch(steps_per_epoch),
        }
    }

    /// Values compared across workers on load.
    pub fn as_words(&self) -> [u64; 2] {
        [self.step, self.consumed_samples]
    }
}

/// Persisted form. `epoch` is informational and recomputed on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerStateSnapshot {
    pub step: u64,
    pub consumed_samples: u64,
    pub epoch: u64,
}

impl From<TrainerStateSnapshot> for TrainerState {
    fn from(snapshot: TrainerStateSnapshot) -> Self {
        Self { step: snapshot.step, consumed_samples: snapshot.consumed_samples }
    }
}

/// Everything handed to a sink on save: trainer state plus `train_`/`val_` metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveCandidates {
    pub state: TrainerStateSnapshot,
    pub metrics: Metrics,
}

pub trait CheckpointSink: Send {
    fn custom_save(
        &mut self,
        candidates: &SaveCandidates,
        is_train_end: bool,
    ) -> TrainingResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedState {
    #[serde(flatten)]
    state: TrainerStateSnapshot,
    run_id: RunId,
    saved_at: DateTime<Utc>,
    is_train_end: bool,
    metrics: Metrics,
}

/// Writes the trainer state as JSON under the run's checkpoint directory.
/// Model weights are saved elsewhere.
#[derive(Debug, Clone)]
pub struct JsonStateSink {
    layout: RunLayout,
    run_id: RunId,
}

impl JsonStateSink {
    pub fn new(layout: RunLayout, run_id: RunId) -> TrainingResult<Self> {
        layout.ensure_run_dirs(&run_id)?;
        Ok(Self { layout, run_id })
    }

    pub fn checkpoints_dir(&self) -> std::path::PathBuf {
        self.layout.checkpoints_dir(&self.run_id)
    }
}

impl CheckpointSink for JsonStateSink {
    fn custom_save(
        &mut self,
        candidates: &SaveCandidates,
        is_train_end: bool,
    ) -> TrainingResult<()> {
        let saved = SavedState {
            state: candidates.state,
            run_id: self.run_id.clone(),
            saved_at: Utc::now(),
            is_train_end,
            metrics: candidates.metrics.clone(),
        };
        let path = self.layout.state_path(&self.run_id, candidates.state.step);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&saved)?)?;
        std::fs::rename(&tmp, &path)?;
        info!(step = candidates.state.step, path = %path.display(), "saved trainer state");
        Ok(())
    }
}

/// Newest state written by [`JsonStateSink`] in `dir`, if any.
pub fn load_latest_state(dir: &Path) -> TrainingResult<Option<TrainerStateSnapshot>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_state = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("trainer_state_step") && n.ends_with(".json"));
        if is_state {
            candidates.push(path);
        }
    }
    candidates.sort();
    let Some(latest) = candidates.pop() else {
        return Ok(None);
    };
    let content = std::fs::read_to_string(&latest)?;
    let saved: SavedState = serde_json::from_str(&content).map_err(|e| {
        let context = format!("unreadable trainer state {}", latest.display());
        TrainingError::Other(anyhow::Error::new(e).context(context))
    })?;
    Ok(Some(saved.state))
}
