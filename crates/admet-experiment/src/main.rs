//! ADMET Experiment CLI.
//!
//! Commands:
//! - train: Run the training loop, resuming from the latest snapshot
//! - eval: Evaluate the latest snapshot (MAE/RMSE), optionally with best-of search
//! - verify: Score one response against a ground truth
//! - show: Print the latest experience snapshot

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use admet_experiment::config::{EvalMode, TrainingConfig};
use admet_experiment::dataset::{load_dataset, truncate, Sample};
use admet_experiment::experiment::{Evaluator, TrainingRunner};
use admet_experiment::results::{format_duration, timestamped_path};
use admet_experiment::verifier::{RewardConfig, Verifier};
use admet_experiment::vllm_client::VllmClient;
use experience_kernel::SnapshotStore;

#[derive(Parser)]
#[command(name = "admet-experiment")]
#[command(version)]
#[command(about = "Training-free GRPO experience curation for ADMET prediction")]
struct Cli {
    /// vLLM host URL
    #[arg(long = "vllm-host", env = "VLLM_HOST", default_value = "http://localhost:8000")]
    vllm_host: String,

    /// Model name served by the vLLM host
    #[arg(long, default_value = "Qwen/Qwen2.5-7B-Instruct")]
    model: String,

    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Experiment name (snapshot directory under the output root)
    #[arg(long)]
    experiment_name: Option<String>,

    /// Root directory for experience snapshots
    #[arg(long)]
    output_root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the training loop
    Train {
        /// Dataset name
        #[arg(long)]
        dataset: Option<String>,

        /// Number of epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Problems per step
        #[arg(long)]
        batch_size: Option<usize>,

        /// Rollouts per problem
        #[arg(long)]
        grpo_n: Option<usize>,

        /// Problems processed concurrently
        #[arg(long)]
        problem_concurrency: Option<usize>,

        /// Maximum in-flight rollout requests per problem
        #[arg(long)]
        rollout_concurrency: Option<usize>,

        /// Use only the first N samples
        #[arg(long)]
        truncate: Option<usize>,

        /// Shuffle seed
        #[arg(long)]
        seed: Option<u64>,

        /// Hide ground truth from the critic
        #[arg(long)]
        no_ground_truth: bool,

        /// Append every completed rollout to rollouts.jsonl
        #[arg(long)]
        audit: bool,
    },

    /// Evaluate the latest snapshot
    Eval {
        /// Dataset name
        #[arg(long)]
        dataset: Option<String>,

        /// Use only the first N samples
        #[arg(long)]
        truncate: Option<usize>,

        /// Directory for the timestamped evaluation report
        #[arg(long)]
        output: Option<PathBuf>,

        /// Evaluation mode (defaults to the config file's, else snapshot)
        #[arg(long, value_enum)]
        mode: Option<EvalModeArg>,

        /// Best-of: rollout rounds per sample
        #[arg(long)]
        rounds: Option<usize>,

        /// Best-of: rollouts per round
        #[arg(long)]
        grpo_n: Option<usize>,
    },

    /// Score a single response
    Verify {
        /// Response text to score
        #[arg(long)]
        response: String,

        /// Ground truth value
        #[arg(long, allow_hyphen_values = true)]
        groundtruth: f64,

        /// Use the smooth reward policy with this tolerance
        #[arg(long)]
        smooth_tolerance: Option<f64>,
    },

    /// Print the latest experience snapshot
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum EvalModeArg {
    /// One rollout per sample against the latest snapshot
    Snapshot,
    /// Keep the best-reward rollout of several rounds per sample
    BestOf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let mut config = match &cli.config {
        Some(path) => TrainingConfig::load_json(path)?,
        None => TrainingConfig::default(),
    };
    if let Some(name) = cli.experiment_name.clone() {
        config.experiment_name = name;
    }
    if let Some(root) = cli.output_root.clone() {
        config.output_root = root;
    }

    match cli.command {
        Commands::Train {
            dataset,
            epochs,
            batch_size,
            grpo_n,
            problem_concurrency,
            rollout_concurrency,
            truncate: limit,
            seed,
            no_ground_truth,
            audit,
        } => {
            if let Some(dataset) = dataset {
                config.dataset = dataset;
            }
            if let Some(epochs) = epochs {
                config.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if let Some(grpo_n) = grpo_n {
                config.grpo_n = grpo_n;
            }
            if let Some(n) = problem_concurrency {
                config.problem_concurrency = n;
            }
            if let Some(n) = rollout_concurrency {
                config.rollout.concurrency = n;
            }
            if limit.is_some() {
                config.dataset_truncate = limit;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }
            config.given_ground_truth &= !no_ground_truth;
            config.audit_rollouts |= audit;

            let samples = load_samples(&config)?;
            let client = connect(&cli.vllm_host, &cli.model).await?;
            let runner = TrainingRunner::new(Arc::new(client), config)?;
            let results = runner.run(&samples).await?;

            println!("\n=== Training Complete ===");
            println!("Run: {}", results.run_id);
            if let Some(step) = results.resumed_from {
                println!("Resumed from step: {}", step);
            }
            println!("Final step: {}", results.final_step);
            println!("Experiences: {}", results.final_experiences);
            println!("Mean step reward: {:.3}", results.mean_step_reward());

            println!("\nPer-Step Metrics:");
            println!(
                "  {:>4} {:>8} {:>8} {:>8} {:>8} {:>6} {:>8}",
                "Step", "Rollouts", "Dropped", "Reward", "Applied", "Exps", "Time"
            );
            for step in &results.steps {
                println!(
                    "  {:>4} {:>8} {:>8} {:>8.3} {:>8} {:>6} {:>8}",
                    step.step,
                    step.rollouts(),
                    step.dropped(),
                    step.avg_reward,
                    step.applied_ops + step.consolidation_applied,
                    step.experiences_after,
                    format_duration(step.duration_ms)
                );
            }
        }

        Commands::Eval {
            dataset,
            truncate: limit,
            output,
            mode,
            rounds,
            grpo_n,
        } => {
            if let Some(dataset) = dataset {
                config.dataset = dataset;
            }
            if limit.is_some() {
                config.dataset_truncate = limit;
            }
            config.eval_mode = eval_mode(config.eval_mode, mode, rounds, grpo_n);

            let samples = load_samples(&config)?;
            let client = connect(&cli.vllm_host, &cli.model).await?;
            let evaluator = Evaluator::new(Arc::new(client), &config)?;
            let report = evaluator.run(&samples).await?;

            println!("\n=== Evaluation ===");
            println!("Mode: {}", report.mode);
            println!(
                "Snapshot: step {} ({} experiences)",
                report.snapshot_step, report.experiences
            );
            println!("Samples: {}", report.samples);
            println!("Predicted: {}", report.predicted);
            println!("Missing prediction: {}", report.missing);
            println!("Dropped: {}", report.dropped);
            match (report.mae, report.rmse) {
                (Some(mae), Some(rmse)) => {
                    println!("MAE: {:.4}", mae);
                    println!("RMSE: {:.4}", rmse);
                }
                _ => println!("MAE/RMSE: n/a"),
            }
            println!("Avg reward: {:.3}", report.avg_reward);
            println!("Pass rate: {:.1}%", report.pass_rate * 100.0);

            if let Some(dir) = output {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
                let path = timestamped_path(&dir, "eval", Utc::now());
                report.save(&path)?;
                println!("Report saved to: {}", path.display());
            }
        }

        Commands::Verify {
            response,
            groundtruth,
            smooth_tolerance,
        } => {
            let reward = match smooth_tolerance {
                Some(tolerance) => RewardConfig::Smooth { tolerance },
                None => config.reward,
            };
            let verifier = Verifier::from_config(&reward);
            let verification = verifier.verify(&response, Some(groundtruth));

            println!("Policy: {}", verifier.policy_name());
            match verification.y_pred {
                Some(pred) => println!("Prediction: {}", pred),
                None => println!("Prediction: none"),
            }
            if let Some(error) = verification.error {
                println!("Error: {:.4}", error);
            }
            println!("Reward: {:.4}", verification.reward);
            println!("Correct: {}", verification.correct);
        }

        Commands::Show => {
            let store = SnapshotStore::new(&config.output_root, &config.experiment_name);
            let snapshot = store.require_latest()?;

            println!("=== {} @ step {} ===", config.experiment_name, snapshot.step);
            println!("{}", snapshot.bank.format_for_prompt(snapshot.bank.len()));
        }
    }

    Ok(())
}

/// Apply CLI overrides to the configured evaluation mode.
fn eval_mode(
    configured: EvalMode,
    mode: Option<EvalModeArg>,
    rounds: Option<usize>,
    grpo_n: Option<usize>,
) -> EvalMode {
    let (default_rounds, default_grpo_n) = match configured {
        EvalMode::BestOf { rounds, grpo_n } => (rounds, grpo_n),
        EvalMode::Snapshot => (EvalMode::DEFAULT_ROUNDS, EvalMode::DEFAULT_GRPO_N),
    };
    let best_of = match mode {
        Some(EvalModeArg::BestOf) => true,
        Some(EvalModeArg::Snapshot) => false,
        None => matches!(configured, EvalMode::BestOf { .. }),
    };
    if best_of {
        EvalMode::BestOf {
            rounds: rounds.unwrap_or(default_rounds),
            grpo_n: grpo_n.unwrap_or(default_grpo_n),
        }
    } else {
        EvalMode::Snapshot
    }
}

fn load_samples(config: &TrainingConfig) -> Result<Vec<Sample>> {
    let samples = load_dataset(&config.dataset)
        .with_context(|| format!("Failed to load dataset {}", config.dataset))?;
    Ok(truncate(samples, config.dataset_truncate))
}

async fn connect(host: &str, model: &str) -> Result<VllmClient> {
    let client = VllmClient::new(host, model);
    client.ensure_healthy().await?;
    info!(host, model, "Connected to vLLM");
    Ok(client)
}
