//! Solver configuration, validation, and error types.
//!
//! [`SolverConfig`] is the single place every pipeline tunable lives.
//! [`validate()`](SolverConfig::validate) checks it at startup; the
//! solver constructor calls it before spawning anything.

use std::error::Error;
use std::fmt;

// ── ThreadingMode ─────────────────────────────────────────────────

/// Where simulation steps execute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadingMode {
    /// Steps run inline on the producer thread inside `advance()`.
    #[default]
    SingleThreaded,
    /// Steps run on a dedicated simulation thread, strictly in order.
    /// The producer enqueues and returns without waiting.
    TaskThread,
}

// ── BlockMode ─────────────────────────────────────────────────────

/// Which in-flight step the producer waits for before reading results.
///
/// Only meaningful with [`ThreadingMode::TaskThread`]. Synchronous pulls
/// always wait for the latest step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockMode {
    /// Wait until the most recently scheduled step has completed.
    /// Lowest latency to fresh results, no overlap with the producer.
    #[default]
    BlockOnLatest,
    /// Wait until the step scheduled before the latest has completed.
    /// The newest step overlaps with the producer's next tick, and at
    /// least one completed result ahead of the previous one is available.
    BlockOnSecondLatest,
    /// Never wait. Results are whatever has completed so far. Steps the
    /// full task channel cannot take are held back on the producer side.
    NoBlock,
}

// ── InterpolationConfig ───────────────────────────────────────────

/// Result interpolation and resimulation-reconciliation tunables.
#[derive(Clone, Debug, PartialEq)]
pub struct InterpolationConfig {
    /// Interpolate between consecutive results instead of presenting the
    /// latest one. Default: true.
    pub enabled: bool,
    /// How far behind the producer clock the interpolation query runs,
    /// in simulation steps. Default: 2.0.
    pub delay_steps: f64,
    /// Superseded results kept for resimulation comparison. Default: 4.
    pub result_history: usize,
    /// Time over which a diverged object is leashed back onto corrected
    /// results, in producer time units. `<= 0` snaps immediately.
    /// Default: 1.0.
    pub resim_time_constant: f64,
    /// Per-query blend strength toward the corrected target while leashed.
    /// Default: 0.2.
    pub resim_strength: f32,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_steps: 2.0,
            result_history: 4,
            resim_time_constant: 1.0,
            resim_strength: 0.2,
        }
    }
}

// ── ConfigError ───────────────────────────────────────────────────

/// Errors detected during [`SolverConfig::validate()`] or solver setup.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// `fixed_dt` is NaN, infinite, zero, or negative.
    InvalidFixedDt {
        /// The invalid value.
        value: f64,
    },
    /// `max_step_dt` is NaN, infinite, zero, or negative.
    InvalidMaxStepDt {
        /// The invalid value.
        value: f64,
    },
    /// `max_substeps` is zero.
    ZeroSubsteps,
    /// `task_queue_capacity` is zero.
    TaskQueueZero,
    /// An interpolation tunable is out of range.
    InvalidInterpolation {
        /// Description of which tunable was rejected.
        reason: String,
    },
    /// The simulation thread could not be spawned.
    ThreadSpawnFailed {
        /// Description of the failure.
        reason: String,
    },
    /// The step runner could not be recovered from the simulation thread
    /// (e.g. the thread panicked).
    RunnerRecoveryFailed,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFixedDt { value } => {
                write!(f, "fixed_dt must be finite and positive, got {value}")
            }
            Self::InvalidMaxStepDt { value } => {
                write!(f, "max_step_dt must be finite and positive, got {value}")
            }
            Self::ZeroSubsteps => write!(f, "max_substeps must be at least 1"),
            Self::TaskQueueZero => write!(f, "task_queue_capacity must be at least 1"),
            Self::InvalidInterpolation { reason } => {
                write!(f, "invalid interpolation config: {reason}")
            }
            Self::ThreadSpawnFailed { reason } => {
                write!(f, "thread spawn failed: {reason}")
            }
            Self::RunnerRecoveryFailed => {
                write!(f, "step runner could not be recovered from simulation thread")
            }
        }
    }
}

impl Error for ConfigError {}

// ── SolverConfig ──────────────────────────────────────────────────

/// Complete configuration for a [`Solver`](crate::solver::Solver).
#[derive(Clone, Debug, PartialEq)]
pub struct SolverConfig {
    /// Fixed simulation step. `None` runs one variable step per producer
    /// tick (subject to `max_step_dt`). Default: `None`.
    pub fixed_dt: Option<f64>,
    /// Where steps execute. Default: single-threaded.
    pub threading: ThreadingMode,
    /// Producer blocking policy for task-thread mode.
    pub block_mode: BlockMode,
    /// Upper bound on steps per producer tick in variable-step mode.
    /// Default: 4.
    pub max_substeps: u32,
    /// Longest allowed variable step. Producer ticks longer than this are
    /// split into equal sub-steps, at most `max_substeps`. Default: `None`.
    pub max_step_dt: Option<f64>,
    /// Number of initial step pops that yield nothing, emulating
    /// scheduling latency. Default: 0.
    pub artificial_delay: u32,
    /// Consumed push snapshots retained for rewind and resimulation.
    /// 0 disables rewinding. Default: 0.
    pub rewind_history: usize,
    /// Capacity of the producer → simulation-thread task channel. Steps
    /// beyond it wait in the dispatcher's backlog. Default: 64.
    pub task_queue_capacity: usize,
    /// Result interpolation tunables.
    pub interpolation: InterpolationConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            fixed_dt: None,
            threading: ThreadingMode::SingleThreaded,
            block_mode: BlockMode::BlockOnLatest,
            max_substeps: 4,
            max_step_dt: None,
            artificial_delay: 0,
            rewind_history: 0,
            task_queue_capacity: 64,
            interpolation: InterpolationConfig::default(),
        }
    }
}

impl SolverConfig {
    /// Validate all invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 1. Step lengths must be finite and positive.
        if let Some(value) = self.fixed_dt {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidFixedDt { value });
            }
        }
        if let Some(value) = self.max_step_dt {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidMaxStepDt { value });
            }
        }
        // 2. Substep and queue bounds.
        if self.max_substeps == 0 {
            return Err(ConfigError::ZeroSubsteps);
        }
        if self.task_queue_capacity == 0 {
            return Err(ConfigError::TaskQueueZero);
        }
        // 3. Interpolation tunables. A non-positive time constant is legal
        //    (hard snap); NaN is not.
        let i = &self.interpolation;
        if !i.delay_steps.is_finite() || i.delay_steps < 0.0 {
            return Err(ConfigError::InvalidInterpolation {
                reason: format!(
                    "delay_steps must be finite and >= 0, got {}",
                    i.delay_steps
                ),
            });
        }
        if i.resim_time_constant.is_nan() {
            return Err(ConfigError::InvalidInterpolation {
                reason: "resim_time_constant is NaN".to_string(),
            });
        }
        if !i.resim_strength.is_finite() || !(0.0..=1.0).contains(&i.resim_strength) {
            return Err(ConfigError::InvalidInterpolation {
                reason: format!(
                    "resim_strength must be in [0.0, 1.0], got {}",
                    i.resim_strength
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SolverConfig::default().validate().is_ok());
    }

    #[test]
    fn defaults_match_documentation() {
        let cfg = SolverConfig::default();
        assert_eq!(cfg.fixed_dt, None);
        assert_eq!(cfg.block_mode, BlockMode::BlockOnLatest);
        assert_eq!(cfg.interpolation.delay_steps, 2.0);
        assert_eq!(cfg.interpolation.resim_time_constant, 1.0);
        assert_eq!(cfg.interpolation.resim_strength, 0.2);
    }

    #[test]
    fn rejects_bad_fixed_dt() {
        for value in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let cfg = SolverConfig {
                fixed_dt: Some(value),
                ..Default::default()
            };
            match cfg.validate() {
                Err(ConfigError::InvalidFixedDt { .. }) => {}
                other => panic!("expected InvalidFixedDt for {value}, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_zero_substeps_and_queue() {
        let cfg = SolverConfig {
            max_substeps: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroSubsteps));

        let cfg = SolverConfig {
            task_queue_capacity: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::TaskQueueZero));
    }

    #[test]
    fn non_positive_time_constant_is_allowed() {
        let mut cfg = SolverConfig::default();
        cfg.interpolation.resim_time_constant = 0.0;
        assert!(cfg.validate().is_ok());
        cfg.interpolation.resim_time_constant = -2.0;
        assert!(cfg.validate().is_ok());
        cfg.interpolation.resim_time_constant = f64::NAN;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidInterpolation { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_strength() {
        let mut cfg = SolverConfig::default();
        cfg.interpolation.resim_strength = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidInterpolation { .. })
        ));
    }
}
