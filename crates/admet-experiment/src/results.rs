//! Results collection and output for training and evaluation runs.
//!
//! Captures:
//! - Per-problem rollout and critique counts
//! - Per-step mutation outcomes and bank growth
//! - Run-level summaries, saved as timestamped JSON
//! - Evaluation error metrics (MAE/RMSE)

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use experience_kernel::OpOutcome;

use crate::config::{EvalMode, TrainingConfig};
use crate::rollout::RolloutBatch;
use crate::verifier::BatchStats;

/// What happened to one problem within a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemReport {
    /// Position of the problem in the step's batch
    pub index: usize,
    pub rollouts: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub avg_reward: f64,
    pub pass_rate: f64,
    /// Operations the critique proposed (after parsing and capping)
    pub proposed_ops: usize,
    /// The critique call failed; the problem contributed no operations
    pub critique_failed: bool,
}

/// Summary of one training step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// Index of the snapshot this step produced
    pub step: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub problems: Vec<ProblemReport>,
    /// Rewards over every completed rollout in the step
    pub avg_reward: f64,
    pub pass_rate: f64,
    pub proposed_ops: usize,
    pub applied_ops: usize,
    pub skipped_ops: usize,
    pub consolidation_ops: usize,
    pub consolidation_applied: usize,
    pub experiences_before: usize,
    pub experiences_after: usize,
    /// Per-operation outcomes, critique operations first
    pub outcomes: Vec<OpOutcome>,
}

impl StepReport {
    pub fn rollouts(&self) -> usize {
        self.problems.iter().map(|p| p.rollouts).sum()
    }

    pub fn dropped(&self) -> usize {
        self.problems.iter().map(|p| p.timed_out + p.failed).sum()
    }
}

/// Results from a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub run_id: Uuid,
    pub config: TrainingConfig,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Snapshot the run resumed from, if it was not a fresh start
    pub resumed_from: Option<usize>,
    pub final_step: usize,
    pub final_experiences: usize,
    pub steps: Vec<StepReport>,
}

impl RunResults {
    /// Mean of per-step average rewards, for a quick trend check.
    pub fn mean_step_reward(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.steps.iter().map(|s| s.avg_reward).sum::<f64>() / self.steps.len() as f64
    }

    /// Save results to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load results from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let results = serde_json::from_str(&json)?;
        Ok(results)
    }
}

/// Evaluation of a snapshot against a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    #[serde(default)]
    pub mode: EvalMode,
    pub snapshot_step: usize,
    pub experiences: usize,
    pub evaluated_at: DateTime<Utc>,
    /// Samples submitted
    pub samples: usize,
    /// Completed rollouts with a numeric prediction
    pub predicted: usize,
    /// Completed rollouts without a numeric prediction
    pub missing: usize,
    /// Timed-out or failed rollouts
    pub dropped: usize,
    /// Absent when nothing was predicted against a ground truth
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub avg_reward: f64,
    pub pass_rate: f64,
}

impl EvalReport {
    /// Metrics over one rollout per sample; `batch` counts samples that produced none.
    pub fn from_batch(
        snapshot_step: usize,
        experiences: usize,
        samples: usize,
        batch: &RolloutBatch,
    ) -> Self {
        let errors: Vec<f64> = batch
            .rollouts
            .iter()
            .filter_map(|r| Some(r.y_pred? - r.sample.groundtruth?))
            .collect();
        let predicted = batch.rollouts.iter().filter(|r| r.y_pred.is_some()).count();
        let BatchStats { avg_reward, pass_rate } = batch.stats();

        let (mae, rmse) = if errors.is_empty() {
            (None, None)
        } else {
            let n = errors.len() as f64;
            let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / n;
            let mse = errors.iter().map(|e| e * e).sum::<f64>() / n;
            (Some(mae), Some(mse.sqrt()))
        };

        Self {
            mode: EvalMode::Snapshot,
            snapshot_step,
            experiences,
            evaluated_at: Utc::now(),
            samples,
            predicted,
            missing: batch.rollouts.len() - predicted,
            dropped: batch.dropped(),
            mae,
            rmse,
            avg_reward,
            pass_rate,
        }
    }

    pub fn with_mode(mut self, mode: EvalMode) -> Self {
        self.mode = mode;
        self
    }

    /// Save report to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// `<dir>/<prefix>-<YYYYmmdd-HHMMSS>.json`
pub fn timestamped_path(dir: impl AsRef<Path>, prefix: &str, at: DateTime<Utc>) -> PathBuf {
    dir.as_ref()
        .join(format!("{}-{}.json", prefix, at.format("%Y%m%d-%H%M%S")))
}

/// Format a duration in milliseconds for display.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{:.1}m", ms as f64 / 60_000.0)
    }
}
