//! Metric sinks.

use crate::error::TrainingResult;
use crate::layout::{RunId, RunLayout};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Named scalar metrics, ordered by name.
pub type Metrics = BTreeMap<String, f64>;

/// Copy of `metrics` with every key prefixed.
pub fn prefixed(metrics: &Metrics, prefix: &str) -> Metrics {
    metrics.iter().map(|(k, v)| (format!("{prefix}{k}"), *v)).collect()
}

pub trait MetricsLogger: Send {
    /// Log `metrics` at `step` with keys prefixed by `prefix` (e.g. `train/`).
    fn log_metrics(&mut self, metrics: &Metrics, step: u64, prefix: &str) -> TrainingResult<()>;

    fn log_hyperparams(&mut self, params: &serde_json::Value) -> TrainingResult<()>;

    /// Flush buffered output. Called once when a run stops, however it stops.
    fn finalize(&mut self) -> TrainingResult<()>;
}

/// Emits metrics as structured `tracing` events.
#[derive(Debug, Default)]
pub struct TracingMetricsLogger;

impl MetricsLogger for TracingMetricsLogger {
    fn log_metrics(&mut self, metrics: &Metrics, step: u64, prefix: &str) -> TrainingResult<()> {
        let metrics = serde_json::to_string(&prefixed(metrics, prefix))?;
        info!(target: "tandem::metrics", step, %metrics, "metrics");
        Ok(())
    }

    fn log_hyperparams(&mut self, params: &serde_json::Value) -> TrainingResult<()> {
        info!(target: "tandem::metrics", hyperparams = %params, "hyperparameters");
        Ok(())
    }

    fn finalize(&mut self) -> TrainingResult<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonlRecord<'a> {
    Metrics { step: u64, timestamp: String, metrics: Metrics },
    Hyperparams { timestamp: String, params: &'a serde_json::Value },
}

/// Appends one JSON object per call to a file.
#[derive(Debug)]
pub struct JsonlMetricsLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlMetricsLogger {
    pub fn create(path: &Path) -> TrainingResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { path: path.to_path_buf(), writer: BufWriter::new(file) })
    }

    /// Logger writing to `metrics.jsonl` in the run's directory.
    pub fn for_run(layout: &RunLayout, run_id: &RunId) -> TrainingResult<Self> {
        Self::create(&layout.metrics_path(run_id))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, record: &JsonlRecord<'_>) -> TrainingResult<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl MetricsLogger for JsonlMetricsLogger {
    fn log_metrics(&mut self, metrics: &Metrics, step: u64, prefix: &str) -> TrainingResult<()> {
        self.write_record(&JsonlRecord::Metrics {
            step,
            timestamp: chrono::Utc::now().to_rfc3339(),
            metrics: prefixed(metrics, prefix),
        })
    }

    fn log_hyperparams(&mut self, params: &serde_json::Value) -> TrainingResult<()> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        self.write_record(&JsonlRecord::Hyperparams { timestamp, params })
    }

    fn finalize(&mut self) -> TrainingResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards every call to each inner logger. The first error wins, but every
/// logger still sees the call.
#[derive(Default)]
pub struct FanoutLogger {
    loggers: Vec<Box<dyn MetricsLogger>>,
}

impl FanoutLogger {
    #[must_use]
    pub fn new(loggers: Vec<Box<dyn MetricsLogger>>) -> Self {
        Self { loggers }
    }

    #[must_use]
    pub fn with(mut self, logger: Box<dyn MetricsLogger>) -> Self {
        self.loggers.push(logger);
        self
    }

    fn each(
        &mut self,
        mut f: impl FnMut(&mut dyn MetricsLogger) -> TrainingResult<()>,
    ) -> TrainingResult<()> {
        let mut first_err = None;
        for logger in &mut self.loggers {
            if let Err(e) = f(logger.as_mut()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl MetricsLogger for FanoutLogger {
    fn log_metrics(&mut self, metrics: &Metrics, step: u64, prefix: &str) -> TrainingResult<()> {
        self.each(|l| l.log_metrics(metrics, step, prefix))
    }

    fn log_hyperparams(&mut self, params: &serde_json::Value) -> TrainingResult<()> {
        self.each(|l| l.log_hyperparams(params))
    }

    fn finalize(&mut self) -> TrainingResult<()> {
        self.each(|l| l.finalize())
    }
}
