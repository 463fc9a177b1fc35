//! Rollout orchestration: bounded-concurrency sampling with per-task timeouts.
//!
//! Each task acquires a semaphore permit, then races its completion call
//! against `task_timeout`. Every task resolves to a [`TaskOutcome`]; the batch
//! keeps the completed ones in submission order and counts the rest. One slow
//! or failing call never fails the batch.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use experience_kernel::{Completion, CompletionError, CompletionRequest};

use crate::audit::RolloutAuditLog;
use crate::config::duration_from_secs;
use crate::dataset::Sample;
use crate::verifier::{BatchStats, Verification, Verifier};

/// Sampling configuration for rollouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Maximum in-flight completion requests
    pub concurrency: usize,
    /// Per-request timeout in seconds (queue wait excluded)
    pub task_timeout_secs: f64,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tokens to generate
    pub max_tokens: u32,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            task_timeout_secs: 600.0,
            temperature: 0.7,
            max_tokens: 2048,
        }
    }
}

impl RolloutConfig {
    pub fn task_timeout(&self) -> Duration {
        duration_from_secs(self.task_timeout_secs)
    }
}

/// A sample together with the fully rendered prompt to send for it.
#[derive(Debug, Clone)]
pub struct RolloutTask {
    pub sample: Sample,
    pub prompt: String,
}

impl RolloutTask {
    pub fn new(sample: Sample, prompt: impl Into<String>) -> Self {
        Self {
            sample,
            prompt: prompt.into(),
        }
    }
}

/// One sampled completion and its verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub sample: Sample,
    pub response_text: String,
    pub reward: f64,
    pub correct: bool,
    pub y_pred: Option<f64>,
    pub error: Option<f64>,
}

impl Rollout {
    fn new(sample: Sample, response_text: String, verification: Verification) -> Self {
        Self {
            sample,
            response_text,
            reward: verification.reward,
            correct: verification.correct,
            y_pred: verification.y_pred,
            error: verification.error,
        }
    }

    pub fn verification(&self) -> Verification {
        Verification {
            reward: self.reward,
            correct: self.correct,
            y_pred: self.y_pred,
            error: self.error,
        }
    }
}

/// Terminal state of a single rollout task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Rollout),
    TimedOut,
    Failed(String),
}

/// Rollouts that completed, plus counts of the tasks that were dropped.
#[derive(Debug, Clone, Default)]
pub struct RolloutBatch {
    pub rollouts: Vec<Rollout>,
    pub timed_out: usize,
    pub failed: usize,
}

impl RolloutBatch {
    fn from_outcomes(outcomes: Vec<TaskOutcome>) -> Self {
        let mut batch = Self::default();
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Completed(rollout) => batch.rollouts.push(rollout),
                TaskOutcome::TimedOut => batch.timed_out += 1,
                TaskOutcome::Failed(_) => batch.failed += 1,
            }
        }
        batch
    }

    pub fn dropped(&self) -> usize {
        self.timed_out + self.failed
    }

    pub fn stats(&self) -> BatchStats {
        let verifications: Vec<Verification> =
            self.rollouts.iter().map(Rollout::verification).collect();
        BatchStats::from_verifications(&verifications)
    }
}

/// Runs tasks through a completion backend and verifies every response.
#[derive(Debug, Clone)]
pub struct RolloutOrchestrator {
    config: RolloutConfig,
    verifier: Verifier,
    audit: Option<Arc<RolloutAuditLog>>,
}

impl RolloutOrchestrator {
    pub fn new(config: RolloutConfig, verifier: Verifier) -> Self {
        Self {
            config,
            verifier,
            audit: None,
        }
    }

    /// Append every completed rollout to `audit`.
    pub fn with_audit(mut self, audit: Arc<RolloutAuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Sample every task, at most `concurrency` at a time.
    ///
    /// Completed rollouts come back in submission order; timed-out and failed
    /// tasks leave no entry.
    pub async fn sample_batch<C: Completion>(
        &self,
        completion: &C,
        tasks: &[RolloutTask],
    ) -> RolloutBatch {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let timeout = self.config.task_timeout();

        let futures: Vec<_> = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    // Acquire semaphore permit for rate limiting
                    let Ok(_permit) = semaphore.acquire().await else {
                        return TaskOutcome::Failed("semaphore closed".to_string());
                    };
                    self.run_task(completion, index, task, timeout).await
                    // Permit is dropped here, releasing the slot
                }
            })
            .collect();

        let batch = RolloutBatch::from_outcomes(join_all(futures).await);
        debug!(
            submitted = tasks.len(),
            completed = batch.rollouts.len(),
            timed_out = batch.timed_out,
            failed = batch.failed,
            "Rollout batch finished"
        );
        batch
    }

    async fn run_task<C: Completion>(
        &self,
        completion: &C,
        index: usize,
        task: &RolloutTask,
        timeout: Duration,
    ) -> TaskOutcome {
        let request = CompletionRequest::new(
            task.prompt.clone(),
            self.config.temperature,
            self.config.max_tokens,
            timeout,
        );

        let response = match tokio::time::timeout(timeout, completion.complete(request)).await {
            Ok(Ok(text)) => text,
            Ok(Err(CompletionError::Timeout(_))) | Err(_) => {
                warn!(
                    task = index,
                    timeout_secs = timeout.as_secs_f64(),
                    "Rollout timed out, dropping"
                );
                return TaskOutcome::TimedOut;
            }
            Ok(Err(e)) => {
                warn!(task = index, error = %e, "Rollout failed, dropping");
                return TaskOutcome::Failed(e.to_string());
            }
        };

        let verification = self.verifier.verify(&response, task.sample.groundtruth);
        let rollout = Rollout::new(task.sample.clone(), response, verification);
        if let Some(audit) = &self.audit {
            audit.record(&rollout);
        }
        TaskOutcome::Completed(rollout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers with a fixed text, or fails for prompts containing "fail".
    struct EchoCompletion {
        calls: AtomicUsize,
    }

    impl Completion for EchoCompletion {
        async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.prompt.contains("fail") {
                return Err(CompletionError::Transport("connection reset".to_string()));
            }
            Ok(format!("Final prediction:\n{}", request.prompt))
        }
    }

    fn task(prompt: &str) -> RolloutTask {
        RolloutTask::new(Sample::new(prompt, Some(-5.2)), prompt)
    }

    #[tokio::test]
    async fn test_transport_errors_are_dropped() {
        let completion = EchoCompletion {
            calls: AtomicUsize::new(0),
        };
        let orchestrator = RolloutOrchestrator::new(RolloutConfig::default(), Verifier::default());
        let tasks = vec![task("-5.0"), task("fail"), task("-3.0")];

        let batch = orchestrator.sample_batch(&completion, &tasks).await;

        assert_eq!(completion.calls.load(Ordering::SeqCst), 3);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.timed_out, 0);
        let rewards: Vec<f64> = batch.rollouts.iter().map(|r| r.reward).collect();
        assert_eq!(rewards, vec![1.0, 0.0]);
        assert!((batch.stats().pass_rate - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let completion = EchoCompletion {
            calls: AtomicUsize::new(0),
        };
        let orchestrator = RolloutOrchestrator::new(RolloutConfig::default(), Verifier::default());
        let batch = orchestrator.sample_batch(&completion, &[]).await;
        assert!(batch.rollouts.is_empty());
        assert_eq!(batch.dropped(), 0);
    }

    #[test]
    fn test_task_timeout_conversion() {
        let config = RolloutConfig {
            task_timeout_secs: 0.25,
            ..Default::default()
        };
        assert_eq!(config.task_timeout(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_oversized_timeout_still_samples() {
        let completion = EchoCompletion {
            calls: AtomicUsize::new(0),
        };
        let config: RolloutConfig = serde_json::from_str(r#"{"task_timeout_secs": 1e30}"#).unwrap();
        assert_eq!(config.task_timeout(), Duration::MAX);
        let orchestrator = RolloutOrchestrator::new(config, Verifier::default());

        let batch = orchestrator.sample_batch(&completion, &[task("-5.0")]).await;

        assert_eq!(batch.rollouts.len(), 1);
        assert_eq!(batch.dropped(), 0);
    }
}
