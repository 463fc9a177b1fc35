//! Configuration for training and evaluation runs.
//!
//! Loaded from JSON at runtime; every field has a default so a config file
//! only needs to name what it changes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::critique::CritiqueConfig;
use crate::rollout::RolloutConfig;
use crate::verifier::RewardConfig;

/// Top-level training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Snapshots go under `<output_root>/<experiment_name>/step_<k>`
    pub experiment_name: String,
    pub output_root: PathBuf,
    /// Dataset name passed to the loader
    pub dataset: String,
    pub epochs: usize,
    /// Problems per training step
    pub batch_size: usize,
    /// Rollouts sampled per problem
    pub grpo_n: usize,
    /// Problems processed concurrently within a step
    pub problem_concurrency: usize,
    /// Show ground truth to the critic
    pub given_ground_truth: bool,
    /// Base seed for per-epoch shuffling
    pub seed: u64,
    /// Use only the first N dataset rows
    pub dataset_truncate: Option<usize>,
    /// Experiences rendered into each rollout prompt
    pub max_prompt_experiences: usize,
    pub rollout: RolloutConfig,
    pub critique: CritiqueConfig,
    pub reward: RewardConfig,
    /// Write every completed rollout to `rollouts.jsonl` in the experiment directory
    pub audit_rollouts: bool,
    pub eval_mode: EvalMode,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            experiment_name: "caco2_training_free_grpo".to_string(),
            output_root: PathBuf::from("data/experiences"),
            dataset: "caco2_wang".to_string(),
            epochs: 1,
            batch_size: 4,
            grpo_n: 4,
            problem_concurrency: 2,
            given_ground_truth: true,
            seed: 42,
            dataset_truncate: None,
            max_prompt_experiences: 20,
            rollout: RolloutConfig::default(),
            critique: CritiqueConfig::default(),
            reward: RewardConfig::default(),
            audit_rollouts: false,
            eval_mode: EvalMode::default(),
        }
    }
}

/// How the evaluator turns rollouts into one prediction per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EvalMode {
    /// One rollout per sample against the latest snapshot
    #[default]
    Snapshot,
    /// Test-time search per sample: `rounds` rounds of `grpo_n` rollouts,
    /// keeping the highest-reward prediction
    BestOf { rounds: usize, grpo_n: usize },
}

impl EvalMode {
    pub const DEFAULT_ROUNDS: usize = 5;
    pub const DEFAULT_GRPO_N: usize = 3;
}

impl fmt::Display for EvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot => write!(f, "snapshot"),
            Self::BestOf { rounds, grpo_n } => write!(f, "best-of ({rounds} x {grpo_n})"),
        }
    }
}

impl TrainingConfig {
    /// Load a config from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Path of the rollout audit log, when enabled.
    pub fn audit_path(&self) -> Option<PathBuf> {
        self.audit_rollouts
            .then(|| self.output_root.join(&self.experiment_name).join("rollouts.jsonl"))
    }
}

/// Convert a timeout in seconds from a config file.
///
/// Negative and NaN values become zero; values too large for a `Duration`
/// (including infinity) saturate to `Duration::MAX`.
pub(crate) fn duration_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
