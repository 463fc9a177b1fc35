//! One training step: `SAMPLE -> SCORE -> CRITIQUE -> RESOLVE -> SNAPSHOT -> DONE`.
//!
//! Every problem in the batch runs its own sample-then-critique pipeline,
//! with at most `problem_concurrency` problems in flight. All of them read the
//! same immutable snapshot. Their proposed operations meet only in RESOLVE,
//! which concatenates them in problem submission order and applies them in a
//! single pass; with two problems modifying the same ID, the later problem's
//! text wins. Every reference is checked against the step's input snapshot,
//! so one problem can never modify or merge an entry another problem added.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use experience_kernel::{
    Completion, ExperienceBank, MutationOp, MutationResolver, Snapshot, SnapshotStore,
};

use crate::config::TrainingConfig;
use crate::critique::CritiqueEngine;
use crate::dataset::Sample;
use crate::prompts::PromptTemplates;
use crate::results::{ProblemReport, StepReport};
use crate::rollout::{Rollout, RolloutOrchestrator, RolloutTask};
use crate::verifier::{BatchStats, Verification};

/// Name of the per-step report written next to each snapshot.
pub const STEP_REPORT_FILE: &str = "step_report.json";

/// Phases of a training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Sample,
    Score,
    Critique,
    Resolve,
    Snapshot,
    Done,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sample => "SAMPLE",
            Self::Score => "SCORE",
            Self::Critique => "CRITIQUE",
            Self::Resolve => "RESOLVE",
            Self::Snapshot => "SNAPSHOT",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Result of a committed step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub snapshot: Snapshot,
    pub report: StepReport,
}

/// One problem's rollouts and the operations its critique proposed.
struct ProblemResult {
    report: ProblemReport,
    rollouts: Vec<Rollout>,
    ops: Vec<MutationOp>,
}

/// Drives training steps against a completion backend.
pub struct StepController<C> {
    completion: Arc<C>,
    orchestrator: RolloutOrchestrator,
    critic: CritiqueEngine,
    resolver: MutationResolver,
    store: SnapshotStore,
    grpo_n: usize,
    problem_concurrency: usize,
    given_ground_truth: bool,
    max_prompt_experiences: usize,
}

impl<C: Completion> StepController<C> {
    pub fn new(
        completion: Arc<C>,
        orchestrator: RolloutOrchestrator,
        critic: CritiqueEngine,
        store: SnapshotStore,
        config: &TrainingConfig,
    ) -> Self {
        Self {
            completion,
            orchestrator,
            critic,
            resolver: MutationResolver::new(),
            store,
            grpo_n: config.grpo_n,
            problem_concurrency: config.problem_concurrency,
            given_ground_truth: config.given_ground_truth,
            max_prompt_experiences: config.max_prompt_experiences,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Run one step from `current` over `batch` and persist snapshot `current.step + 1`.
    ///
    /// Per-rollout and per-critique failures shrink the step instead of
    /// failing it, so a snapshot is always written, possibly identical to
    /// `current`. Only persistence errors propagate.
    pub async fn run_step(&self, current: &Snapshot, batch: &[Sample]) -> Result<StepOutcome> {
        let started_at = Utc::now();
        let start_time = Instant::now();
        let next_step = current.step + 1;
        let bank = current.bank.as_ref();

        info!(
            step = next_step,
            problems = batch.len(),
            experiences = bank.len(),
            "Starting training step"
        );

        let problems = self.sample_and_critique(next_step, bank, batch).await;

        enter(next_step, StepPhase::Resolve);
        let (ops, problem_reports, rollouts) = problems.into_iter().fold(
            (Vec::new(), Vec::new(), Vec::new()),
            |(mut ops, mut reports, mut rollouts), problem| {
                ops.extend(problem.ops);
                reports.push(problem.report);
                rollouts.extend(problem.rollouts);
                (ops, reports, rollouts)
            },
        );

        let resolution = self.resolver.apply_independent(bank, &ops);
        let (applied_ops, skipped_ops) = (resolution.applied(), resolution.skipped());
        let mut outcomes = resolution.outcomes;
        let mut candidate = resolution.bank;

        let mut consolidation_ops = 0;
        let mut consolidation_applied = 0;
        if self.critic.config().consolidate && applied_ops > 0 {
            match self.critic.consolidate(self.completion.as_ref(), &candidate).await {
                Ok(consolidation) if !consolidation.is_empty() => {
                    let pass = self.resolver.apply(&candidate, &consolidation);
                    consolidation_ops = consolidation.len();
                    consolidation_applied = pass.applied();
                    outcomes.extend(pass.outcomes);
                    candidate = pass.bank;
                }
                Ok(_) => debug!(step = next_step, "Consolidation proposed no changes"),
                Err(e) => warn!(
                    step = next_step,
                    error = %e,
                    "Consolidation failed, keeping unconsolidated bank"
                ),
            }
        }

        enter(next_step, StepPhase::Snapshot);
        let snapshot = Snapshot::new(next_step, candidate.rebased());
        self.store
            .save(&snapshot)
            .with_context(|| format!("Failed to persist snapshot for step {next_step}"))?;

        let verifications: Vec<Verification> =
            rollouts.iter().map(Rollout::verification).collect();
        let BatchStats { avg_reward, pass_rate } = BatchStats::from_verifications(&verifications);
        let report = StepReport {
            step: next_step,
            started_at,
            duration_ms: start_time.elapsed().as_millis() as u64,
            problems: problem_reports,
            avg_reward,
            pass_rate,
            proposed_ops: ops.len(),
            applied_ops,
            skipped_ops,
            consolidation_ops,
            consolidation_applied,
            experiences_before: bank.len(),
            experiences_after: snapshot.bank.len(),
            outcomes,
        };
        self.store
            .write_artifact(next_step, STEP_REPORT_FILE, &report)
            .with_context(|| format!("Failed to write step report for step {next_step}"))?;

        enter(next_step, StepPhase::Done);
        info!(
            step = next_step,
            rollouts = report.rollouts(),
            dropped = report.dropped(),
            avg_reward = format!("{:.3}", avg_reward),
            pass_rate = format!("{:.3}", pass_rate),
            applied = applied_ops,
            skipped = skipped_ops,
            experiences = report.experiences_after,
            "Step complete"
        );

        Ok(StepOutcome { snapshot, report })
    }

    async fn sample_and_critique(
        &self,
        step: usize,
        bank: &ExperienceBank,
        batch: &[Sample],
    ) -> Vec<ProblemResult> {
        enter(step, StepPhase::Sample);
        let semaphore = Arc::new(Semaphore::new(self.problem_concurrency.max(1)));
        let experiences = bank.format_for_prompt(self.max_prompt_experiences);

        let futures: Vec<_> = batch
            .iter()
            .enumerate()
            .map(|(index, sample)| {
                let semaphore = Arc::clone(&semaphore);
                let experiences = experiences.as_str();
                async move {
                    // The semaphore is never closed
                    let _permit = semaphore.acquire_owned().await.ok();
                    self.run_problem(step, index, sample, bank, experiences).await
                }
            })
            .collect();

        join_all(futures).await
    }

    async fn run_problem(
        &self,
        step: usize,
        index: usize,
        sample: &Sample,
        bank: &ExperienceBank,
        experiences: &str,
    ) -> ProblemResult {
        let prompt = PromptTemplates::problem_with_experience(experiences, &sample.problem);
        let tasks: Vec<RolloutTask> = (0..self.grpo_n)
            .map(|_| RolloutTask::new(sample.clone(), prompt.clone()))
            .collect();

        // Scoring happens inside the orchestrator as each completion lands
        let batch = self
            .orchestrator
            .sample_batch(self.completion.as_ref(), &tasks)
            .await;
        let stats = batch.stats();
        debug!(
            step,
            problem = index,
            phase = %StepPhase::Score,
            rollouts = batch.rollouts.len(),
            avg_reward = stats.avg_reward,
            "Problem scored"
        );

        let mut report = ProblemReport {
            index,
            rollouts: batch.rollouts.len(),
            timed_out: batch.timed_out,
            failed: batch.failed,
            avg_reward: stats.avg_reward,
            pass_rate: stats.pass_rate,
            proposed_ops: 0,
            critique_failed: false,
        };

        if batch.rollouts.is_empty() {
            warn!(step, problem = index, "No rollouts completed, skipping critique");
            return ProblemResult {
                report,
                rollouts: batch.rollouts,
                ops: Vec::new(),
            };
        }

        let groundtruth = if self.given_ground_truth {
            sample.groundtruth
        } else {
            None
        };
        let critique = self.critic.critique(
            self.completion.as_ref(),
            &sample.problem,
            groundtruth,
            bank,
            &batch.rollouts,
        );
        let ops = match critique.await {
            Ok(ops) => ops,
            Err(e) => {
                warn!(
                    step,
                    problem = index,
                    error = %e,
                    "Critique failed, problem contributes no operations"
                );
                report.critique_failed = true;
                Vec::new()
            }
        };
        report.proposed_ops = ops.len();
        debug!(
            step,
            problem = index,
            phase = %StepPhase::Critique,
            ops = ops.len(),
            "Problem critiqued"
        );

        ProblemResult {
            report,
            rollouts: batch.rollouts,
            ops,
        }
    }
}

fn enter(step: usize, phase: StepPhase) {
    debug!(step, phase = %phase, "Entering phase");
}
