//! Wall-clock budget for a run and per-step timing.

use crate::error::{TrainingError, TrainingResult};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Decides when a run has used up its time budget.
pub trait RunTimer: Send {
    fn start_time(&mut self);
    fn is_finished(&self) -> bool;
}

/// Parse a `DD:HH:MM:SS` budget.
pub fn parse_time_limit(value: &str) -> TrainingResult<Duration> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 4 {
        return Err(TrainingError::Configuration(format!(
            "time limit '{value}' must be formatted as DD:HH:MM:SS"
        )));
    }
    let mut fields = [0u64; 4];
    for (slot, part) in fields.iter_mut().zip(&parts) {
        *slot = part.parse::<u64>().map_err(|_| {
            TrainingError::Configuration(format!(
                "time limit '{value}' has a non-numeric field '{part}'"
            ))
        })?;
    }
    let [days, hours, minutes, seconds] = fields;
    Ok(Duration::from_secs(((days * 24 + hours) * 60 + minutes) * 60 + seconds))
}

/// Budget measured from the first `start_time` call. No budget never finishes.
#[derive(Debug, Clone)]
pub struct WallClockTimer {
    budget: Option<Duration>,
    started: Option<Instant>,
}

impl WallClockTimer {
    #[must_use]
    pub fn new(budget: Option<Duration>) -> Self {
        Self { budget, started: None }
    }

    pub fn from_config(limit: Option<&str>) -> TrainingResult<Self> {
        Ok(Self::new(limit.map(parse_time_limit).transpose()?))
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }
}

impl RunTimer for WallClockTimer {
    fn start_time(&mut self) {
        // restarts of fit() keep the original start
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn is_finished(&self) -> bool {
        match (self.budget, self.started) {
            (Some(budget), Some(started)) => started.elapsed() >= budget,
            _ => false,
        }
    }
}

/// Named stopwatch used for `step_time` style metrics.
#[derive(Debug, Default)]
pub struct StepTimer {
    running: HashMap<String, Instant>,
    last: HashMap<String, Duration>,
}

impl StepTimer {
    pub fn start(&mut self, name: &str) {
        self.running.insert(name.to_string(), Instant::now());
    }

    pub fn stop(&mut self, name: &str) {
        if let Some(started) = self.running.remove(name) {
            self.last.insert(name.to_string(), started.elapsed());
        }
    }

    /// Seconds recorded by the last start/stop pair, zero if never stopped.
    pub fn get(&self, name: &str) -> f64 {
        self.last.get(name).map_or(0.0, Duration::as_secs_f64)
    }
}
