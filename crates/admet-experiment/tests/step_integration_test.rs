//! Integration tests for the rollout-and-curation loop.
//!
//! Tests the full flow of:
//! - Bounded-concurrency rollouts with per-task timeouts
//! - Cross-problem operation ordering in RESOLVE
//! - Consolidation over the candidate bank
//! - Resuming training from the latest snapshot
//! - Evaluating a trained snapshot
//!
//! Every test runs against a scripted in-memory completion backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Duration;

use admet_experiment::config::TrainingConfig;
use admet_experiment::critique::{CritiqueConfig, CritiqueEngine};
use admet_experiment::dataset::Sample;
use admet_experiment::experiment::{Evaluator, TrainingRunner};
use admet_experiment::rollout::{RolloutConfig, RolloutOrchestrator, RolloutTask};
use admet_experiment::step::StepController;
use admet_experiment::verifier::Verifier;
use experience_kernel::{
    Completion, CompletionError, CompletionRequest, ExperienceBank, ExperienceId, KernelError,
    OpOutcome, SkipReason, Snapshot, SnapshotStore,
};

const ROLLOUT_REPLY: &str = "Polar surface area is moderate.\nFinal prediction:\n-5.0";

/// Answers the first rule whose needle appears in the prompt, after its delay.
struct Rule {
    needle: String,
    delay: Duration,
    reply: String,
}

struct ScriptedCompletion {
    rules: Vec<Rule>,
    default_reply: Option<String>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    /// Unmatched prompts echo back; use `with_default` for a fixed rollout answer.
    fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_reply: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn with_default(mut self, reply: &str) -> Self {
        self.default_reply = Some(reply.to_string());
        self
    }

    fn rule(mut self, needle: &str, delay: Duration, reply: &str) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            delay,
            reply: reply.to_string(),
        });
        self
    }

    fn prompts_containing(&self, needle: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains(needle))
            .cloned()
            .collect()
    }
}

/// Decrements the in-flight counter even when a timed-out call is dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Completion for ScriptedCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());

        let rule = self.rules.iter().find(|r| request.prompt.contains(&r.needle));
        let (delay, reply) = match rule {
            Some(rule) => (rule.delay, rule.reply.clone()),
            None => (
                Duration::ZERO,
                self.default_reply.clone().unwrap_or_else(|| request.prompt.clone()),
            ),
        };
        tokio::time::sleep(delay).await;
        Ok(reply)
    }
}

fn modify_reply(target: &str, text: &str) -> String {
    format!(
        "```json\n[{{\"option\": \"modify\", \"modified_from\": \"{target}\", \
         \"experience\": \"{text}\"}}]\n```"
    )
}

fn add_reply(text: &str) -> String {
    format!("```json\n[{{\"option\": \"add\", \"experience\": \"{text}\"}}]\n```")
}

fn critique_needle(problem: &str) -> String {
    format!("PROBLEM (Molecule):\n{problem}\n")
}

fn training_config(root: &std::path::Path) -> TrainingConfig {
    TrainingConfig {
        experiment_name: "integration".to_string(),
        output_root: root.to_path_buf(),
        grpo_n: 2,
        batch_size: 2,
        problem_concurrency: 2,
        ..Default::default()
    }
}

fn controller(
    completion: Arc<ScriptedCompletion>,
    config: &TrainingConfig,
) -> StepController<ScriptedCompletion> {
    StepController::new(
        completion,
        RolloutOrchestrator::new(config.rollout.clone(), Verifier::default()),
        CritiqueEngine::new(config.critique.clone()),
        SnapshotStore::new(&config.output_root, &config.experiment_name),
        config,
    )
}

#[tokio::test]
async fn test_timeouts_drop_tasks_and_preserve_order() {
    // Fast tasks echo their own prompt so order is observable
    let completion = ScriptedCompletion::new()
        .rule("task-2", Duration::from_secs(5), "too late")
        .rule("task-5", Duration::from_secs(5), "too late");

    let orchestrator = RolloutOrchestrator::new(
        RolloutConfig {
            concurrency: 3,
            task_timeout_secs: 0.3,
            ..Default::default()
        },
        Verifier::default(),
    );
    let tasks: Vec<RolloutTask> = (0..10)
        .map(|i| {
            RolloutTask::new(Sample::new(format!("problem {i}"), Some(-5.2)), format!("task-{i}"))
        })
        .collect();

    let batch = orchestrator.sample_batch(&completion, &tasks).await;

    assert_eq!(batch.rollouts.len(), 8);
    assert_eq!(batch.timed_out, 2);
    assert_eq!(batch.failed, 0);
    let order: Vec<&str> = batch.rollouts.iter().map(|r| r.response_text.as_str()).collect();
    assert_eq!(
        order,
        vec!["task-0", "task-1", "task-3", "task-4", "task-6", "task-7", "task-8", "task-9"]
    );
    assert!(batch.rollouts.iter().all(|r| !r.response_text.contains("too late")));
    assert!(completion.peak_in_flight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_conflicting_modifies_resolve_in_submission_order() {
    for (problems, winner) in [(["MOL-A", "MOL-B"], "textB"), (["MOL-B", "MOL-A"], "textA")] {
        let dir = tempfile::tempdir().unwrap();
        let config = training_config(dir.path());

        // MOL-A's critique lands last, so completion order never decides the winner
        let completion = Arc::new(
            ScriptedCompletion::new()
                .with_default(ROLLOUT_REPLY)
                .rule("CANDIDATE EXPERIENCE LIBRARY", Duration::ZERO, "[]")
                .rule(
                    &critique_needle("MOL-A"),
                    Duration::from_millis(150),
                    &modify_reply("G1", "textA"),
                )
                .rule(
                    &critique_needle("MOL-B"),
                    Duration::ZERO,
                    &modify_reply("G1", "textB"),
                ),
        );
        let controller = controller(Arc::clone(&completion), &config);
        let current = Snapshot::new(0, ExperienceBank::from_texts(["base", "original"]));
        let batch: Vec<Sample> =
            problems.iter().map(|p| Sample::new(*p, Some(-5.2))).collect();

        let outcome = controller.run_step(&current, &batch).await.unwrap();

        assert_eq!(outcome.snapshot.step, 1);
        assert_eq!(outcome.snapshot.bank.len(), 2);
        assert_eq!(outcome.snapshot.bank.get(&ExperienceId::original(0)), Some("base"));
        assert_eq!(outcome.snapshot.bank.get(&ExperienceId::original(1)), Some(winner));
        assert_eq!(outcome.report.applied_ops, 2);
        assert_eq!(current.bank.get(&ExperienceId::original(1)), Some("original"));
    }
}

#[tokio::test]
async fn test_problem_cannot_modify_entry_added_by_another_problem() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        critique: CritiqueConfig {
            consolidate: false,
            ..Default::default()
        },
        ..training_config(dir.path())
    };
    // MOL-B only saw G0, so its N0 is whatever MOL-A happens to allocate
    let completion = Arc::new(
        ScriptedCompletion::new()
            .with_default(ROLLOUT_REPLY)
            .rule(&critique_needle("MOL-A"), Duration::ZERO, &add_reply("from A"))
            .rule(
                &critique_needle("MOL-B"),
                Duration::ZERO,
                &modify_reply("N0", "B hijacked"),
            ),
    );
    let controller = controller(Arc::clone(&completion), &config);
    let current = Snapshot::new(0, ExperienceBank::from_texts(["base"]));
    let batch = vec![Sample::new("MOL-A", Some(-5.2)), Sample::new("MOL-B", Some(-5.2))];

    let outcome = controller.run_step(&current, &batch).await.unwrap();

    let texts: Vec<&str> = outcome.snapshot.bank.iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, vec!["base", "from A"]);
    assert_eq!(outcome.report.proposed_ops, 2);
    assert_eq!(outcome.report.applied_ops, 1);
    assert_eq!(outcome.report.skipped_ops, 1);
    assert_eq!(
        outcome.report.outcomes[1],
        OpOutcome::Skipped {
            reason: SkipReason::DanglingReference {
                missing: vec![ExperienceId::generated(0)]
            }
        }
    );
}

#[tokio::test]
async fn test_consolidation_merges_candidates_and_ignores_adds() {
    let dir = tempfile::tempdir().unwrap();
    let config = training_config(dir.path());
    let consolidation = r#"```json
[
  {"option": "merge", "merged_from": ["N0", "N1"],
   "experience": "Lipophilicity and size jointly drive permeability."},
  {"option": "add", "experience": "should be ignored"}
]
```"#;
    let completion = Arc::new(
        ScriptedCompletion::new()
            .with_default(ROLLOUT_REPLY)
            .rule("CANDIDATE EXPERIENCE LIBRARY", Duration::ZERO, consolidation)
            .rule(&critique_needle("MOL-A"), Duration::ZERO, &add_reply("High logP helps."))
            .rule(
                &critique_needle("MOL-B"),
                Duration::ZERO,
                &add_reply("Small molecules pass easily."),
            ),
    );
    let controller = controller(Arc::clone(&completion), &config);
    let batch = vec![Sample::new("MOL-A", Some(-5.2)), Sample::new("MOL-B", Some(-5.2))];

    let outcome = controller.run_step(&Snapshot::initial(), &batch).await.unwrap();

    let texts: Vec<&str> = outcome.snapshot.bank.iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, vec!["Lipophilicity and size jointly drive permeability."]);
    assert_eq!(outcome.snapshot.bank.ids().next(), Some(&ExperienceId::original(0)));
    assert_eq!(outcome.report.consolidation_ops, 1);
    assert_eq!(outcome.report.consolidation_applied, 1);
    assert!(matches!(outcome.report.outcomes.last(), Some(OpOutcome::Merged { .. })));

    let consolidation_prompts = completion.prompts_containing("CANDIDATE EXPERIENCE LIBRARY");
    assert_eq!(consolidation_prompts.len(), 1);
    assert!(consolidation_prompts[0].contains("[N0]. High logP helps."));
    assert!(consolidation_prompts[0].contains("[N1]. Small molecules pass easily."));
}

#[tokio::test]
async fn test_rollout_prompts_carry_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = training_config(dir.path());
    let completion = Arc::new(
        ScriptedCompletion::new()
            .with_default(ROLLOUT_REPLY)
            .rule("CURRENT EXPERIENCE LIBRARY", Duration::ZERO, &add_reply("fresh insight")),
    );
    let controller = controller(Arc::clone(&completion), &config);
    let current = Snapshot::new(0, ExperienceBank::from_texts(["old insight"]));

    controller
        .run_step(&current, &[Sample::new("MOL-A", Some(-5.2))])
        .await
        .unwrap();

    let rollout_prompts = completion.prompts_containing("[Molecule SMILES]");
    assert_eq!(rollout_prompts.len(), config.grpo_n);
    for prompt in &rollout_prompts {
        assert!(prompt.contains("[G0]. old insight"));
        assert!(!prompt.contains("fresh insight"));
    }
}

#[tokio::test]
async fn test_training_resumes_from_latest_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let samples: Vec<Sample> = ["MOL-A", "MOL-B", "MOL-C", "MOL-D"]
        .iter()
        .map(|p| Sample::new(*p, Some(-5.2)))
        .collect();
    let completion = Arc::new(
        ScriptedCompletion::new()
            .with_default(ROLLOUT_REPLY)
            .rule("CANDIDATE EXPERIENCE LIBRARY", Duration::ZERO, "[]")
            .rule("CURRENT EXPERIENCE LIBRARY", Duration::ZERO, &add_reply("insight")),
    );

    let first = TrainingRunner::new(Arc::clone(&completion), training_config(dir.path())).unwrap();
    let results = first.run(&samples).await.unwrap();

    assert_eq!(results.resumed_from, None);
    assert_eq!(results.steps.len(), 2);
    assert_eq!(results.final_step, 2);
    assert!(first.store().load(0).unwrap().bank.is_empty());
    assert_eq!(first.store().latest_step().unwrap(), Some(2));

    let second = TrainingRunner::new(
        Arc::clone(&completion),
        TrainingConfig {
            epochs: 2,
            ..training_config(dir.path())
        },
    )
    .unwrap();
    let results = second.run(&samples).await.unwrap();

    assert_eq!(results.resumed_from, Some(2));
    let steps: Vec<usize> = results.steps.iter().map(|s| s.step).collect();
    assert_eq!(steps, vec![3, 4]);
    assert_eq!(results.final_step, 4);

    // Nothing left to do: a rerun commits no new snapshots
    let results = second.run(&samples).await.unwrap();
    assert!(results.steps.is_empty());
    assert_eq!(second.store().latest_step().unwrap(), Some(4));
}

#[tokio::test]
async fn test_evaluation_requires_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = training_config(dir.path());
    let completion = Arc::new(ScriptedCompletion::new().with_default(ROLLOUT_REPLY));
    let evaluator = Evaluator::new(Arc::clone(&completion), &config).unwrap();
    let samples = vec![Sample::new("MOL-A", Some(-5.2)), Sample::new("MOL-B", Some(-4.0))];

    let err = evaluator.run(&samples).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<KernelError>(),
        Some(KernelError::SnapshotNotFound { .. })
    ));

    SnapshotStore::new(&config.output_root, &config.experiment_name)
        .save(&Snapshot::new(3, ExperienceBank::from_texts(["polar groups hurt"])))
        .unwrap();

    let report = evaluator.run(&samples).await.unwrap();
    assert_eq!(report.snapshot_step, 3);
    assert_eq!(report.samples, 2);
    assert_eq!(report.predicted, 2);
    assert!((report.mae.unwrap() - 0.6).abs() < 1e-9);
    assert!((report.pass_rate - 0.5).abs() < 1e-9);
    assert!(completion
        .prompts_containing("[Molecule SMILES]")
        .iter()
        .all(|p| p.contains("[G0]. polar groups hurt")));
}

#[tokio::test]
async fn test_critique_without_ground_truth_hides_answer() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        given_ground_truth: false,
        ..training_config(dir.path())
    };
    let completion = Arc::new(
        ScriptedCompletion::new()
            .with_default(ROLLOUT_REPLY)
            .rule("CURRENT EXPERIENCE LIBRARY", Duration::ZERO, "nothing to add"),
    );
    let controller = controller(Arc::clone(&completion), &config);

    let outcome = controller
        .run_step(&Snapshot::initial(), &[Sample::new("MOL-A", Some(-5.2))])
        .await
        .unwrap();

    let critiques = completion.prompts_containing("CURRENT EXPERIENCE LIBRARY");
    assert_eq!(critiques.len(), 1);
    assert!(!critiques[0].contains("GROUND TRUTH"));
    // Unparseable critique: no operations, but the step still commits
    assert!(outcome.snapshot.bank.is_empty());
    assert_eq!(outcome.report.proposed_ops, 0);
    assert!(!outcome.report.problems[0].critique_failed);
}

#[tokio::test]
async fn test_critique_config_caps_operations() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        critique: CritiqueConfig {
            max_operations: 1,
            consolidate: false,
            ..Default::default()
        },
        ..training_config(dir.path())
    };
    let reply = r#"[{"option":"add","experience":"one"},{"option":"add","experience":"two"}]"#;
    let completion = Arc::new(
        ScriptedCompletion::new()
            .with_default(ROLLOUT_REPLY)
            .rule("CURRENT EXPERIENCE LIBRARY", Duration::ZERO, reply),
    );
    let controller = controller(Arc::clone(&completion), &config);

    let outcome = controller
        .run_step(&Snapshot::initial(), &[Sample::new("MOL-A", Some(-5.2))])
        .await
        .unwrap();

    let texts: Vec<&str> = outcome.snapshot.bank.iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, vec!["one"]);
    assert!(completion.prompts_containing("CANDIDATE EXPERIENCE LIBRARY").is_empty());
}

#[tokio::test]
async fn test_problem_concurrency_bounds_in_flight_problems() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        problem_concurrency: 1,
        ..training_config(dir.path())
    };
    let completion = Arc::new(
        ScriptedCompletion::new()
            .rule("CANDIDATE EXPERIENCE LIBRARY", Duration::ZERO, "[]")
            .rule("CURRENT EXPERIENCE LIBRARY", Duration::ZERO, "[]")
            .rule("[Molecule SMILES]", Duration::from_millis(30), ROLLOUT_REPLY),
    );
    let controller = controller(Arc::clone(&completion), &config);
    let batch: Vec<Sample> = ["MOL-A", "MOL-B", "MOL-C"]
        .iter()
        .map(|p| Sample::new(*p, Some(-5.2)))
        .collect();

    let outcome = controller.run_step(&Snapshot::initial(), &batch).await.unwrap();

    // One problem at a time, each with grpo_n rollouts in flight
    assert!(completion.peak_in_flight.load(Ordering::SeqCst) <= config.grpo_n);
    assert_eq!(outcome.report.rollouts(), 3 * config.grpo_n);
    assert!(outcome.report.problems.iter().all(|p| !p.critique_failed));
}

#[tokio::test]
async fn test_evaluation_audit_log_records_rollouts() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        audit_rollouts: true,
        ..training_config(dir.path())
    };
    SnapshotStore::new(&config.output_root, &config.experiment_name)
        .save(&Snapshot::new(1, ExperienceBank::from_texts(["polar groups hurt"])))
        .unwrap();
    let completion = Arc::new(ScriptedCompletion::new().with_default(ROLLOUT_REPLY));
    let evaluator = Evaluator::new(Arc::clone(&completion), &config).unwrap();

    evaluator
        .run(&[Sample::new("MOL-A", Some(-5.2)), Sample::new("MOL-B", Some(-4.0))])
        .await
        .unwrap();

    let path = config.audit_path().unwrap();
    let lines = std::fs::read_to_string(&path).unwrap();
    assert_eq!(lines.lines().count(), 2);
}
