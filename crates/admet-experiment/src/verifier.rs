//! Verifier: scores one completion against a numeric ground truth.
//!
//! The prediction is the last numeric token in the response. The mapping from
//! prediction error to reward is a [`RewardPolicy`], chosen by [`RewardConfig`]:
//! - Banded: three reward levels with breakpoints at 0.4 and 1.5
//! - Smooth: `1 / (1 + e^error)`, correct within a tolerance
//!
//! Verification is pure: the same response and ground truth always yield the
//! same [`Verification`].

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dataset::Sample;
use crate::error::ExperimentError;

static NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?")
        .expect("numeric token pattern is valid")
});

/// Extract the last numeric token from a response.
///
/// Returns `None` when the text has no numeric token, or when the last one does
/// not parse to a finite value.
pub fn extract_prediction(response: &str) -> Option<f64> {
    NUMBER_RE
        .find_iter(response)
        .last()
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Reward assigned to a given prediction error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub reward: f64,
    pub correct: bool,
}

/// Maps absolute prediction error to a reward.
pub trait RewardPolicy: Send + Sync {
    /// Unique name for this policy.
    fn name(&self) -> &str;

    /// Score a non-negative prediction error.
    fn score(&self, error: f64) -> Score;
}

/// Three-level reward: near, partially right, wrong.
#[derive(Debug, Clone, Copy, Default)]
pub struct BandedReward;

impl BandedReward {
    pub const CORRECT_BELOW: f64 = 0.4;
    pub const PARTIAL_BELOW: f64 = 1.5;
}

impl RewardPolicy for BandedReward {
    fn name(&self) -> &str {
        "banded"
    }

    fn score(&self, error: f64) -> Score {
        if error < Self::CORRECT_BELOW {
            Score {
                reward: 1.0,
                correct: true,
            }
        } else if error < Self::PARTIAL_BELOW {
            Score {
                reward: 0.5,
                correct: false,
            }
        } else {
            Score {
                reward: 0.0,
                correct: false,
            }
        }
    }
}

/// Logistic reward `1 / (1 + e^error)`.
#[derive(Debug, Clone, Copy)]
pub struct SmoothReward {
    pub tolerance: f64,
}

impl Default for SmoothReward {
    fn default() -> Self {
        Self { tolerance: 1.0 }
    }
}

impl RewardPolicy for SmoothReward {
    fn name(&self) -> &str {
        "smooth"
    }

    fn score(&self, error: f64) -> Score {
        Score {
            reward: 1.0 / (1.0 + error.exp()),
            correct: error <= self.tolerance,
        }
    }
}

/// Reward policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RewardConfig {
    Banded,
    Smooth {
        #[serde(default = "default_tolerance")]
        tolerance: f64,
    },
}

fn default_tolerance() -> f64 {
    SmoothReward::default().tolerance
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self::Banded
    }
}

impl RewardConfig {
    pub fn build(&self) -> Arc<dyn RewardPolicy> {
        match *self {
            Self::Banded => Arc::new(BandedReward),
            Self::Smooth { tolerance } => Arc::new(SmoothReward { tolerance }),
        }
    }
}

/// Outcome of verifying one response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub reward: f64,
    pub correct: bool,
    pub y_pred: Option<f64>,
    pub error: Option<f64>,
}

impl Verification {
    fn miss(y_pred: Option<f64>) -> Self {
        Self {
            reward: 0.0,
            correct: false,
            y_pred,
            error: None,
        }
    }
}

/// Aggregate statistics of a verified batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub avg_reward: f64,
    pub pass_rate: f64,
}

impl BatchStats {
    pub fn from_verifications<'a>(items: impl IntoIterator<Item = &'a Verification>) -> Self {
        let (count, reward_sum, correct) = items.into_iter().fold((0usize, 0.0, 0usize), |acc, v| {
            (acc.0 + 1, acc.1 + v.reward, acc.2 + usize::from(v.correct))
        });
        if count == 0 {
            return Self::default();
        }
        Self {
            avg_reward: reward_sum / count as f64,
            pass_rate: correct as f64 / count as f64,
        }
    }
}

/// Scores completions with a configured reward policy.
#[derive(Clone)]
pub struct Verifier {
    policy: Arc<dyn RewardPolicy>,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("policy", &self.policy.name())
            .finish()
    }
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(Arc::new(BandedReward))
    }
}

impl Verifier {
    pub fn new(policy: Arc<dyn RewardPolicy>) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &RewardConfig) -> Self {
        Self::new(config.build())
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Verify a single response against an optional ground truth.
    pub fn verify(&self, response: &str, groundtruth: Option<f64>) -> Verification {
        let y_pred = extract_prediction(response);
        let (Some(pred), Some(truth)) = (y_pred, groundtruth) else {
            return Verification::miss(y_pred);
        };

        let error = (pred - truth).abs();
        let Score { reward, correct } = self.policy.score(error);
        Verification {
            reward,
            correct,
            y_pred: Some(pred),
            error: Some(error),
        }
    }

    /// Verify parallel sequences of samples and responses.
    ///
    /// A single pair is just a batch of one. Mismatched lengths are rejected
    /// rather than truncated.
    pub fn verify_batch<S: AsRef<str>>(
        &self,
        samples: &[Sample],
        responses: &[S],
    ) -> Result<(Vec<f64>, BatchStats), ExperimentError> {
        if samples.len() != responses.len() {
            return Err(ExperimentError::InputShape {
                samples: samples.len(),
                responses: responses.len(),
            });
        }

        let verifications: Vec<Verification> = samples
            .iter()
            .zip(responses)
            .map(|(sample, response)| self.verify(response.as_ref(), sample.groundtruth))
            .collect();

        let rewards = verifications.iter().map(|v| v.reward).collect();
        Ok((rewards, BatchStats::from_verifications(&verifications)))
    }
}
