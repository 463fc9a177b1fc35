//! Training and evaluation runners.
//!
//! Orchestrates the run lifecycle:
//! 1. Resume from the latest snapshot (or persist the empty `step_0`)
//! 2. Shuffle the dataset per epoch and cut it into mini-batches
//! 3. Run one [`StepController`] step per mini-batch
//! 4. Collect step reports into [`RunResults`]
//!
//! Evaluation runs in one of the [`EvalMode`]s: a single rollout per sample,
//! or a per-sample best-of search over several rollout rounds.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};
use uuid::Uuid;

use experience_kernel::{Completion, Snapshot, SnapshotStore};

use crate::audit::RolloutAuditLog;
use crate::config::{EvalMode, TrainingConfig};
use crate::critique::CritiqueEngine;
use crate::dataset::Sample;
use crate::prompts::PromptTemplates;
use crate::results::{timestamped_path, EvalReport, RunResults};
use crate::rollout::{Rollout, RolloutBatch, RolloutOrchestrator, RolloutTask};
use crate::step::StepController;
use crate::verifier::Verifier;

/// Build the rollout orchestrator a config describes, attaching the audit log if enabled.
fn build_orchestrator(config: &TrainingConfig) -> Result<RolloutOrchestrator> {
    let verifier = Verifier::from_config(&config.reward);
    let orchestrator = RolloutOrchestrator::new(config.rollout.clone(), verifier);
    match config.audit_path() {
        Some(path) => {
            let audit = RolloutAuditLog::open(path)?;
            info!(path = %audit.path().display(), "Auditing rollouts");
            Ok(orchestrator.with_audit(Arc::new(audit)))
        }
        None => Ok(orchestrator),
    }
}

/// Sample order for one epoch, reproducible from `seed + epoch`.
pub fn epoch_order(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
    order.shuffle(&mut rng);
    order
}

/// Runs training epochs as a sequence of snapshot-producing steps.
pub struct TrainingRunner<C> {
    config: TrainingConfig,
    controller: StepController<C>,
}

impl<C: Completion> TrainingRunner<C> {
    pub fn new(completion: Arc<C>, config: TrainingConfig) -> Result<Self> {
        let store = SnapshotStore::new(&config.output_root, &config.experiment_name);
        let controller = StepController::new(
            completion,
            build_orchestrator(&config)?,
            CritiqueEngine::new(config.critique.clone()),
            store,
            &config,
        );
        Ok(Self { config, controller })
    }

    pub fn store(&self) -> &SnapshotStore {
        self.controller.store()
    }

    /// Load the latest snapshot, or persist and return the empty `step_0`.
    fn resume_or_start(&self) -> Result<(Snapshot, Option<usize>)> {
        let store = self.store();
        match store.load_latest().context("Failed to inspect existing snapshots")? {
            Some(snapshot) => {
                info!(
                    step = snapshot.step,
                    experiences = snapshot.bank.len(),
                    "Resuming from snapshot"
                );
                let step = snapshot.step;
                Ok((snapshot, Some(step)))
            }
            None => {
                let snapshot = Snapshot::initial();
                store.save(&snapshot).context("Failed to persist initial snapshot")?;
                Ok((snapshot, None))
            }
        }
    }

    /// Train over `samples`, resuming where a previous run stopped.
    ///
    /// Global step `epoch * batches_per_epoch + batch` turns snapshot `g` into
    /// `g + 1`; steps already covered by the latest snapshot are skipped.
    pub async fn run(&self, samples: &[Sample]) -> Result<RunResults> {
        anyhow::ensure!(!samples.is_empty(), "Training requires at least one sample");

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let batch_size = self.config.batch_size.max(1);
        let batches_per_epoch = samples.len().div_ceil(batch_size);
        let (mut current, resumed_from) = self.resume_or_start()?;

        info!(
            run_id = %run_id,
            samples = samples.len(),
            epochs = self.config.epochs,
            batches_per_epoch,
            grpo_n = self.config.grpo_n,
            "Starting training run"
        );

        let mut steps = Vec::new();
        for epoch in 0..self.config.epochs {
            let order = epoch_order(samples.len(), self.config.seed, epoch);
            for (batch_idx, chunk) in order.chunks(batch_size).enumerate() {
                let global_step = epoch * batches_per_epoch + batch_idx;
                if global_step < current.step {
                    continue;
                }

                let batch: Vec<Sample> = chunk.iter().map(|&i| samples[i].clone()).collect();
                let total_steps = self.config.epochs * batches_per_epoch;
                info!(
                    epoch,
                    batch = batch_idx,
                    progress = format!("{}/{}", global_step + 1, total_steps),
                    "Running step"
                );
                let outcome = self.controller.run_step(&current, &batch).await?;
                current = outcome.snapshot;
                steps.push(outcome.report);
            }
        }

        let results = RunResults {
            run_id,
            config: self.config.clone(),
            started_at,
            ended_at: Utc::now(),
            resumed_from,
            final_step: current.step,
            final_experiences: current.bank.len(),
            steps,
        };

        let path = timestamped_path(self.store().dir(), "run-results", started_at);
        results
            .save(&path)
            .with_context(|| format!("Failed to save run results to {}", path.display()))?;
        info!(
            final_step = results.final_step,
            experiences = results.final_experiences,
            path = %path.display(),
            "Training run complete"
        );

        Ok(results)
    }
}

/// Evaluates a dataset against the latest snapshot.
///
/// [`EvalMode::BestOf`] selects each sample's rollout by reward, which reads
/// the ground truth: it measures how close the model can get under search,
/// not what it would answer blind.
pub struct Evaluator<C> {
    completion: Arc<C>,
    orchestrator: RolloutOrchestrator,
    store: SnapshotStore,
    max_prompt_experiences: usize,
    mode: EvalMode,
}

impl<C: Completion> Evaluator<C> {
    pub fn new(completion: Arc<C>, config: &TrainingConfig) -> Result<Self> {
        Ok(Self {
            completion,
            orchestrator: build_orchestrator(config)?,
            store: SnapshotStore::new(&config.output_root, &config.experiment_name),
            max_prompt_experiences: config.max_prompt_experiences,
            mode: config.eval_mode,
        })
    }

    pub fn mode(&self) -> EvalMode {
        self.mode
    }

    /// Evaluate `samples`.
    ///
    /// Snapshot mode requires a trained snapshot. Best-of mode falls back to
    /// an empty bank when none exists.
    pub async fn run(&self, samples: &[Sample]) -> Result<EvalReport> {
        let snapshot = match self.mode {
            EvalMode::Snapshot => self
                .store
                .require_latest()
                .context("Evaluation needs a trained snapshot")?,
            EvalMode::BestOf { .. } => self
                .store
                .load_latest()
                .context("Failed to inspect existing snapshots")?
                .unwrap_or_else(Snapshot::initial),
        };
        let experiences = snapshot.bank.format_for_prompt(self.max_prompt_experiences);

        info!(
            mode = %self.mode,
            step = snapshot.step,
            experiences = snapshot.bank.len(),
            samples = samples.len(),
            "Evaluating snapshot"
        );

        let batch = match self.mode {
            EvalMode::Snapshot => {
                let tasks: Vec<RolloutTask> = samples
                    .iter()
                    .map(|s| {
                        let prompt =
                            PromptTemplates::problem_with_experience(&experiences, &s.problem);
                        RolloutTask::new(s.clone(), prompt)
                    })
                    .collect();
                self.orchestrator
                    .sample_batch(self.completion.as_ref(), &tasks)
                    .await
            }
            EvalMode::BestOf { rounds, grpo_n } => {
                self.best_of(samples, &experiences, rounds, grpo_n).await
            }
        };

        let report =
            EvalReport::from_batch(snapshot.step, snapshot.bank.len(), samples.len(), &batch)
                .with_mode(self.mode);
        info!(
            predicted = report.predicted,
            missing = report.missing,
            dropped = report.dropped,
            mae = ?report.mae,
            rmse = ?report.rmse,
            "Evaluation complete"
        );
        Ok(report)
    }

    /// Keep the best of `rounds * grpo_n` rollouts for each sample, one sample at a time.
    ///
    /// A sample whose every rollout was dropped counts as timed out if any of
    /// them timed out, else as failed.
    async fn best_of(
        &self,
        samples: &[Sample],
        experiences: &str,
        rounds: usize,
        grpo_n: usize,
    ) -> RolloutBatch {
        let mut best = RolloutBatch::default();

        for (index, sample) in samples.iter().enumerate() {
            let prompt = PromptTemplates::problem_with_experience(experiences, &sample.problem);
            let tasks: Vec<RolloutTask> = (0..grpo_n.max(1))
                .map(|_| RolloutTask::new(sample.clone(), prompt.clone()))
                .collect();

            let mut kept: Option<Rollout> = None;
            let mut timed_out = 0;
            for round in 0..rounds.max(1) {
                let batch = self
                    .orchestrator
                    .sample_batch(self.completion.as_ref(), &tasks)
                    .await;
                timed_out += batch.timed_out;
                for rollout in batch.rollouts {
                    let better = match &kept {
                        Some(current) => outranks(&rollout, current),
                        None => true,
                    };
                    if better {
                        kept = Some(rollout);
                    }
                }
                debug!(
                    sample = index,
                    round,
                    best_reward = ?kept.as_ref().map(|r| r.reward),
                    "Best-of round finished"
                );
            }

            match kept {
                Some(rollout) => {
                    info!(
                        sample = index,
                        prediction = ?rollout.y_pred,
                        error = ?rollout.error,
                        "Best-of sample done"
                    );
                    best.rollouts.push(rollout);
                }
                None if timed_out > 0 => best.timed_out += 1,
                None => best.failed += 1,
            }
        }

        best
    }
}

/// Higher reward wins. On equal reward the smaller error wins, and any
/// prediction beats none.
fn outranks(candidate: &Rollout, kept: &Rollout) -> bool {
    if candidate.reward != kept.reward {
        return candidate.reward > kept.reward;
    }
    match (candidate.error, kept.error) {
        (Some(c), Some(k)) => c < k,
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use experience_kernel::{CompletionError, CompletionRequest};

    #[test]
    fn test_epoch_order_is_seeded_permutation() {
        let first = epoch_order(20, 42, 0);
        assert_eq!(first, epoch_order(20, 42, 0));

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());

        // Next epoch reshuffles
        assert_ne!(first, epoch_order(20, 42, 1));
    }

    #[test]
    fn test_epoch_order_empty() {
        assert!(epoch_order(0, 7, 3).is_empty());
    }

    /// Replies per problem in call order, keyed by a token in the prompt.
    struct QueuedCompletion {
        replies: Mutex<Vec<(&'static str, VecDeque<&'static str>)>>,
        calls: AtomicUsize,
    }

    impl QueuedCompletion {
        fn new(replies: Vec<(&'static str, Vec<&'static str>)>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|(key, queue)| (key, queue.into_iter().collect()))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Completion for QueuedCompletion {
        async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            let next = replies
                .iter_mut()
                .find(|(key, _)| request.prompt.contains(key))
                .and_then(|(_, queue)| queue.pop_front());
            match next {
                Some(reply) => Ok(reply.to_string()),
                None => Err(CompletionError::Transport("no scripted reply".to_string())),
            }
        }
    }

    fn rollout(reward: f64, error: Option<f64>) -> Rollout {
        Rollout {
            sample: Sample::new("CCO", Some(-5.2)),
            response_text: String::new(),
            reward,
            correct: reward == 1.0,
            y_pred: error.map(|e| -5.2 + e),
            error,
        }
    }

    #[test]
    fn test_outranks_prefers_reward_then_error() {
        assert!(outranks(&rollout(1.0, Some(0.3)), &rollout(0.5, Some(0.5))));
        assert!(!outranks(&rollout(0.5, Some(0.5)), &rollout(1.0, Some(0.3))));
        assert!(outranks(&rollout(1.0, Some(0.05)), &rollout(1.0, Some(0.2))));
        assert!(!outranks(&rollout(1.0, Some(0.2)), &rollout(1.0, Some(0.2))));
        assert!(outranks(&rollout(0.0, Some(3.0)), &rollout(0.0, None)));
        assert!(!outranks(&rollout(0.0, None), &rollout(0.0, Some(3.0))));
    }

    #[tokio::test]
    async fn test_best_of_keeps_best_prediction_per_sample() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            output_root: dir.path().to_path_buf(),
            eval_mode: EvalMode::BestOf { rounds: 2, grpo_n: 2 },
            ..Default::default()
        };
        let completion = Arc::new(QueuedCompletion::new(vec![
            (
                "MOL-A",
                vec![
                    "Final prediction: -3.0",
                    "Final prediction: -3.0",
                    "Final prediction: -5.0",
                    "Final prediction: -5.15",
                ],
            ),
            ("MOL-B", vec!["I cannot tell.", "unsure", "no idea", "pass"]),
            ("MOL-C", vec![]),
        ]));
        let evaluator = Evaluator::new(Arc::clone(&completion), &config).unwrap();
        let samples = vec![
            Sample::new("MOL-A", Some(-5.2)),
            Sample::new("MOL-B", Some(-4.0)),
            Sample::new("MOL-C", Some(-6.0)),
        ];

        let report = evaluator.run(&samples).await.unwrap();

        assert_eq!(completion.calls.load(Ordering::SeqCst), 12);
        assert_eq!(report.mode, EvalMode::BestOf { rounds: 2, grpo_n: 2 });
        assert_eq!(report.snapshot_step, 0);
        assert_eq!(report.experiences, 0);
        assert_eq!(report.samples, 3);
        assert_eq!(report.predicted, 1);
        assert_eq!(report.missing, 1);
        assert_eq!(report.dropped, 1);
        assert!((report.mae.unwrap() - 0.05).abs() < 1e-9);
        assert!((report.rmse.unwrap() - 0.05).abs() < 1e-9);
    }
}
