//! Critique engine: turns observed trajectories into proposed bank mutations.
//!
//! The model is asked for a JSON array of operations. Parsing is tolerant by
//! construction:
//! - a fenced ```json block is preferred, else the first `[` that opens a
//!   valid JSON array (prose citations such as `[G1]` are stepped over)
//! - objects missing their required fields are dropped individually
//! - no parseable array at all means "no improvement suggested"
//! - at most `max_operations` valid operations are returned

use std::time::Duration;

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use experience_kernel::{
    Completion, CompletionError, CompletionRequest, ExperienceBank, ExperienceId, MutationOp,
};

use crate::config::duration_from_secs;
use crate::prompts::PromptTemplates;
use crate::rollout::Rollout;

static JSON_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("json block pattern is valid"));

/// Configuration for critique calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CritiqueConfig {
    /// Maximum operations accepted from one critique
    pub max_operations: usize,
    /// Sampling temperature for critique and summary calls
    pub temperature: f32,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Timeout for a single critique call, in seconds
    pub timeout_secs: f64,
    /// Characters of each trajectory shown to the critic
    pub max_trajectory_chars: usize,
    /// Summarize each trajectory before critiquing
    pub summarize_trajectories: bool,
    /// Run the cross-problem consolidation pass after resolving
    pub consolidate: bool,
    /// Maximum operations accepted from the consolidation pass
    pub max_consolidation_operations: usize,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        Self {
            max_operations: 3,
            temperature: 0.3,
            max_tokens: 4096,
            timeout_secs: 600.0,
            max_trajectory_chars: 4000,
            summarize_trajectories: false,
            consolidate: true,
            max_consolidation_operations: 5,
        }
    }
}

impl CritiqueConfig {
    pub fn timeout(&self) -> Duration {
        duration_from_secs(self.timeout_secs)
    }
}

/// Operations parsed from a model reply, with what was thrown away.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOperations {
    pub ops: Vec<MutationOp>,
    /// Objects dropped for missing or malformed fields
    pub invalid: usize,
    /// Valid operations cut by the `max_operations` cap
    pub truncated: usize,
    /// No JSON array could be located or parsed
    pub parse_failed: bool,
}

/// Parse a critique reply into at most `max_operations` operations.
pub fn parse_operations(reply: &str, max_operations: usize) -> ParsedOperations {
    let Some(items) = locate_array(reply) else {
        return ParsedOperations {
            parse_failed: true,
            ..Default::default()
        };
    };

    let mut parsed = ParsedOperations::default();
    for item in &items {
        match parse_operation(item) {
            Some(op) if parsed.ops.len() < max_operations => parsed.ops.push(op),
            Some(_) => parsed.truncated += 1,
            None => parsed.invalid += 1,
        }
    }
    parsed
}

fn locate_array(reply: &str) -> Option<Vec<Value>> {
    let fenced = JSON_BLOCK_RE
        .captures_iter(reply)
        .filter_map(|c| c.get(1))
        .find_map(|m| serde_json::from_str::<Vec<Value>>(m.as_str().trim()).ok());
    if fenced.is_some() {
        return fenced;
    }

    // Trailing prose after the array is fine: only the first value is read
    reply.match_indices('[').find_map(|(start, _)| {
        serde_json::Deserializer::from_str(&reply[start..])
            .into_iter::<Vec<Value>>()
            .next()
            .and_then(Result::ok)
    })
}

fn parse_operation(item: &Value) -> Option<MutationOp> {
    let obj = item.as_object()?;
    let option = obj.get("option")?.as_str()?.trim().to_lowercase();
    let text = obj.get("experience")?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    let text = text.to_string();

    match option.as_str() {
        "add" => Some(MutationOp::Add { text }),
        "modify" => {
            let target = obj.get("modified_from")?.as_str()?.trim();
            if target.is_empty() {
                return None;
            }
            Some(MutationOp::Modify {
                target: ExperienceId::from(target),
                text,
            })
        }
        "merge" => {
            let sources = obj
                .get("merged_from")?
                .as_array()?
                .iter()
                .map(|v| v.as_str().map(ExperienceId::from))
                .collect::<Option<Vec<_>>>()?;
            if sources.is_empty() {
                return None;
            }
            Some(MutationOp::Merge { sources, text })
        }
        _ => None,
    }
}

/// Render trajectories for the critic, each capped at `max_chars` characters.
pub fn render_trajectories(
    rollouts: &[Rollout],
    summaries: Option<&[String]>,
    max_chars: usize,
) -> String {
    if rollouts.is_empty() {
        return "None".to_string();
    }

    rollouts
        .iter()
        .enumerate()
        .map(|(i, rollout)| {
            let body = summaries
                .and_then(|s| s.get(i))
                .map(String::as_str)
                .unwrap_or(rollout.response_text.as_str());
            let prediction = rollout
                .y_pred
                .map(|p| format!("{p}"))
                .unwrap_or_else(|| "none".to_string());
            format!(
                "[Trajectory {}] reward={:.3} correct={} prediction={}\n{}",
                i + 1,
                rollout.reward,
                rollout.correct,
                prediction,
                truncate_chars(body, max_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}... [truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

/// Asks the model to critique trajectories and propose bank mutations.
#[derive(Debug, Clone)]
pub struct CritiqueEngine {
    config: CritiqueConfig,
}

impl CritiqueEngine {
    pub fn new(config: CritiqueConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CritiqueConfig {
        &self.config
    }

    fn request(&self, prompt: String) -> CompletionRequest {
        CompletionRequest::new(
            prompt,
            self.config.temperature,
            self.config.max_tokens,
            self.config.timeout(),
        )
    }

    async fn call<C: Completion>(
        &self,
        completion: &C,
        prompt: String,
    ) -> Result<String, CompletionError> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, completion.complete(self.request(prompt))).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(timeout)),
        }
    }

    /// Propose mutations for one problem.
    ///
    /// With `groundtruth` absent the prompt omits outcome-correctness framing;
    /// the returned operation list follows the same contract either way. A
    /// reply with no parseable array yields an empty list; only the call
    /// itself failing is an error.
    pub async fn critique<C: Completion>(
        &self,
        completion: &C,
        problem: &str,
        groundtruth: Option<f64>,
        bank: &ExperienceBank,
        rollouts: &[Rollout],
    ) -> Result<Vec<MutationOp>, CompletionError> {
        let summaries = if self.config.summarize_trajectories {
            Some(self.summarize(completion, rollouts, groundtruth).await)
        } else {
            None
        };

        let experiences = bank.format_for_prompt(bank.len());
        let trajectories = render_trajectories(
            rollouts,
            summaries.as_deref(),
            self.config.max_trajectory_chars,
        );
        let max_operations = self.config.max_operations;
        let prompt = match groundtruth {
            Some(answer) => PromptTemplates::critique(
                problem,
                answer,
                &experiences,
                &trajectories,
                max_operations,
            ),
            None => PromptTemplates::critique_no_gt(
                problem,
                &experiences,
                &trajectories,
                max_operations,
            ),
        };

        let reply = self.call(completion, prompt).await?;
        let parsed = parse_operations(&reply, max_operations);
        log_parse("critique", &parsed);
        Ok(parsed.ops)
    }

    /// Propose modify/merge operations over a candidate bank.
    ///
    /// Adds are discarded: consolidation only reshapes what the step's
    /// critiques already produced.
    pub async fn consolidate<C: Completion>(
        &self,
        completion: &C,
        candidate: &ExperienceBank,
    ) -> Result<Vec<MutationOp>, CompletionError> {
        let max_operations = self.config.max_consolidation_operations;
        let experiences = candidate.format_for_prompt(candidate.len());
        let prompt = PromptTemplates::consolidate(&experiences, max_operations);

        let reply = self.call(completion, prompt).await?;
        let parsed = parse_operations(&reply, usize::MAX);
        log_parse("consolidate", &parsed);

        let (ops, adds): (Vec<_>, Vec<_>) = parsed
            .ops
            .into_iter()
            .partition(|op| !matches!(op, MutationOp::Add { .. }));
        if !adds.is_empty() {
            debug!(discarded = adds.len(), "Consolidation proposed additions; ignoring them");
        }
        Ok(ops.into_iter().take(max_operations).collect())
    }

    /// Summarize each trajectory; a failed summary falls back to the raw response.
    pub async fn summarize<C: Completion>(
        &self,
        completion: &C,
        rollouts: &[Rollout],
        groundtruth: Option<f64>,
    ) -> Vec<String> {
        let futures = rollouts.iter().map(|rollout| async move {
            let trajectory =
                truncate_chars(&rollout.response_text, self.config.max_trajectory_chars);
            let prompt = match groundtruth {
                Some(answer) => {
                    let verdict = if rollout.correct { "correct" } else { "incorrect" };
                    let grade = format!("reward {:.3} ({})", rollout.reward, verdict);
                    PromptTemplates::trajectory_summary(&trajectory, &grade, answer)
                }
                None => PromptTemplates::trajectory_summary_no_gt(&trajectory),
            };
            match self.call(completion, prompt).await {
                Ok(summary) => summary.trim().to_string(),
                Err(e) => {
                    warn!(error = %e, "Trajectory summary failed, using raw response");
                    trajectory
                }
            }
        });
        join_all(futures).await
    }
}

fn log_parse(stage: &str, parsed: &ParsedOperations) {
    if parsed.parse_failed {
        warn!(stage, "No operation array in model reply; treating as no suggestions");
    } else {
        debug!(
            stage,
            accepted = parsed.ops.len(),
            invalid = parsed.invalid,
            truncated = parsed.truncated,
            "Parsed mutation operations"
        );
    }
}
