//! Step planning and the per-step progress decision.
//!
//! Everything here is pure arithmetic over the configuration and dataloader
//! sizes. [`ProgressPlan`] is derived state: never serialized, recomputed on
//! every load.

use crate::config::{BatchLimit, TrainerConfig, ValCheckInterval};
use crate::error::{TrainingError, TrainingResult};

/// Apply a fractional or absolute cap to `num_batches`.
pub fn compute_limit_batches(num_batches: u64, limit: BatchLimit) -> u64 {
    match limit {
        BatchLimit::Fraction(f) => (num_batches as f64 * f) as u64,
        BatchLimit::Count(c) => num_batches.min(c),
    }
}

/// Optimizer steps per epoch given the sampler's global batches per epoch.
pub fn steps_per_epoch(global_batches: u64, limit_train_batches: BatchLimit) -> u64 {
    compute_limit_batches(global_batches, limit_train_batches)
}

/// Epoch-derived step budget, capped by a non-negative override.
pub fn max_steps(steps_per_epoch: u64, max_epochs: u64, override_steps: i64) -> u64 {
    let derived = steps_per_epoch.saturating_mul(max_epochs);
    match u64::try_from(override_steps) {
        Ok(cap) => derived.min(cap),
        Err(_) => derived,
    }
}

/// Steps left in the epoch that `step` falls in, bounded by the run budget.
pub fn num_steps_in_epoch(step: u64, max_steps: u64, steps_per_epoch: u64) -> u64 {
    if steps_per_epoch == 0 {
        return 0;
    }
    max_steps.saturating_sub(step).min(steps_per_epoch - step % steps_per_epoch)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressCheck {
    pub run_val: bool,
    pub save_model: bool,
    pub is_train_end: bool,
}

/// Decide what happens after the optimizer step that produced `step`.
pub fn check_progress(
    step: u64,
    max_steps: u64,
    val_check_interval: u64,
    save_interval: u64,
    limit_val_batches: u64,
    time_limit_exceeded: bool,
) -> ProgressCheck {
    let validation_enabled = limit_val_batches > 0 && val_check_interval > 0;
    let save_enabled = save_interval > 0;
    let is_train_end = step == max_steps;

    let run_val = validation_enabled
        && (step % val_check_interval.max(1) == 0 || is_train_end || time_limit_exceeded);
    let save_model =
        save_enabled && (step % save_interval.max(1) == 0 || is_train_end || time_limit_exceeded);

    ProgressCheck { run_val, save_model, is_train_end }
}

/// Refuse multi-epoch runs over a sampler that repeats the same order each epoch.
pub fn ensure_epochs_supported(reshuffles_each_epoch: bool, max_epochs: u64) -> TrainingResult<()> {
    if !reshuffles_each_epoch && max_epochs > 1 {
        return Err(TrainingError::Configuration(format!(
            "max_epochs={max_epochs} needs a sampler that reshuffles each epoch; \
             a sequential sampler would repeat every epoch in the same order"
        )));
    }
    Ok(())
}

/// Derived run schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPlan {
    pub steps_per_epoch: u64,
    pub max_steps: u64,
    pub val_check_interval: u64,
    pub limit_val_batches: u64,
    pub save_interval: u64,
}

impl ProgressPlan {
    pub fn resolve(
        config: &TrainerConfig,
        train_global_batches: u64,
        val_batches: u64,
    ) -> TrainingResult<Self> {
        let steps_per_epoch = steps_per_epoch(train_global_batches, config.limit_train_batches);
        if steps_per_epoch == 0 {
            return Err(TrainingError::Configuration(format!(
                "no training steps per epoch: {train_global_batches} batches limited by {:?}",
                config.limit_train_batches
            )));
        }
        let val_check_interval = match config.val_check_interval {
            ValCheckInterval::Steps(n) => n,
            ValCheckInterval::Fraction(f) => (f * steps_per_epoch as f64) as u64,
        };
        let limit_val_batches = compute_limit_batches(val_batches, config.limit_val_batches);

        let validation_enabled = limit_val_batches > 0 && val_check_interval > 0;
        if validation_enabled && config.save_interval % val_check_interval != 0 {
            return Err(TrainingError::Configuration(format!(
                "save_interval={} must be divisible by val_check_interval={val_check_interval}",
                config.save_interval
            )));
        }

        Ok(Self {
            steps_per_epoch,
            max_steps: max_steps(steps_per_epoch, config.max_epochs, config.max_steps),
            val_check_interval,
            limit_val_batches,
            save_interval: config.save_interval,
        })
    }

    pub fn check(&self, step: u64, time_limit_exceeded: bool) -> ProgressCheck {
        check_progress(
            step,
            self.max_steps,
            self.val_check_interval,
            self.save_interval,
            self.limit_val_batches,
            time_limit_exceeded,
        )
    }

    /// Zero-based epoch of `step`.
    pub fn epoch(&self, step: u64) -> u64 {
        step / self.steps_per_epoch
    }

    pub fn num_steps_in_epoch(&self, step: u64) -> u64 {
        num_steps_in_epoch(step, self.max_steps, self.steps_per_epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_check_progress_validation_only() {
        let check = check_progress(100, 1000, 100, 500, 10, false);
        assert_eq!(check, ProgressCheck { run_val: true, save_model: false, is_train_end: false });
    }

    #[test]
    fn test_check_progress_train_end_saves_and_validates() {
        let check = check_progress(1000, 1000, 300, 600, 10, false);
        assert_eq!(check, ProgressCheck { run_val: true, save_model: true, is_train_end: true });
    }

    #[test]
    fn test_check_progress_time_limit_forces_both() {
        let check = check_progress(7, 1000, 100, 500, 10, true);
        assert!(check.run_val && check.save_model && !check.is_train_end);
    }

    #[test]
    fn test_check_progress_disabled_paths() {
        let check = check_progress(100, 100, 100, 0, 0, true);
        assert_eq!(check, ProgressCheck { run_val: false, save_model: false, is_train_end: true });
    }

    #[test]
    fn test_max_steps_examples() {
        assert_eq!(max_steps(100, 3, -1), 300);
        assert_eq!(max_steps(100, 3, 50), 50);
        assert_eq!(max_steps(100, 3, 1000), 300);
        assert_eq!(max_steps(100, 3, 0), 0);
    }

    #[test]
    fn test_limit_batches() {
        assert_eq!(compute_limit_batches(10, BatchLimit::Fraction(0.55)), 5);
        assert_eq!(compute_limit_batches(10, BatchLimit::Count(4)), 4);
        assert_eq!(compute_limit_batches(10, BatchLimit::Count(40)), 10);
    }

    #[test]
    fn test_steps_in_epoch_respects_budget() {
        assert_eq!(num_steps_in_epoch(0, 300, 100), 100);
        assert_eq!(num_steps_in_epoch(150, 300, 100), 50);
        assert_eq!(num_steps_in_epoch(250, 260, 100), 10);
        assert_eq!(num_steps_in_epoch(300, 300, 100), 0);
    }

    #[test]
    fn test_plan_resolves_fractional_interval() {
        let mut config = TrainerConfig::new(8);
        config.max_epochs = 2;
        config.val_check_interval = ValCheckInterval::Fraction(0.5);
        config.save_interval = 10;
        let plan = ProgressPlan::resolve(&config, 20, 4).unwrap();
        assert_eq!(plan.steps_per_epoch, 20);
        assert_eq!(plan.max_steps, 40);
        assert_eq!(plan.val_check_interval, 10);
        assert_eq!(plan.limit_val_batches, 4);
        assert_eq!(plan.epoch(39), 1);
    }

    #[test]
    fn test_plan_rejects_indivisible_save_interval() {
        let mut config = TrainerConfig::new(8);
        config.val_check_interval = ValCheckInterval::Steps(3);
        config.save_interval = 10;
        assert!(matches!(
            ProgressPlan::resolve(&config, 20, 4),
            Err(TrainingError::Configuration(_))
        ));

        // no validation data: the interval constraint does not apply
        assert!(ProgressPlan::resolve(&config, 20, 0).is_ok());
    }

    #[test]
    fn test_plan_rejects_empty_epoch() {
        let config = TrainerConfig::new(8);
        assert!(ProgressPlan::resolve(&config, 0, 4).is_err());
    }

    #[test]
    fn test_sequential_sampler_single_epoch_only() {
        assert!(ensure_epochs_supported(false, 1).is_ok());
        assert!(ensure_epochs_supported(false, 2).is_err());
        assert!(ensure_epochs_supported(true, 5).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_max_steps_monotone_in_epochs(spe in 1u64..1000, epochs in 1u64..50) {
            prop_assert!(max_steps(spe, epochs + 1, -1) >= max_steps(spe, epochs, -1));
        }

        #[test]
        fn prop_override_is_a_cap(spe in 1u64..1000, epochs in 1u64..50, cap in 0i64..100_000) {
            let steps = max_steps(spe, epochs, cap);
            prop_assert_eq!(steps, (spe * epochs).min(cap as u64));
        }

        #[test]
        fn prop_limit_never_exceeds_available(
            n in 0u64..10_000,
            f in 0.0f64..=1.0,
            c in 0u64..20_000,
        ) {
            prop_assert!(compute_limit_batches(n, BatchLimit::Fraction(f)) <= n);
            prop_assert!(compute_limit_batches(n, BatchLimit::Count(c)) <= n);
        }

        #[test]
        fn prop_epochs_cover_budget(spe in 1u64..50, epochs in 1u64..6) {
            let max = max_steps(spe, epochs, -1);
            let mut step = 0;
            for _ in 0..epochs {
                step += num_steps_in_epoch(step, max, spe);
            }
            prop_assert_eq!(step, max);
        }
    }
}
