//! ADMET Experiment: training-free GRPO on Caco-2 permeability prediction.
//!
//! This crate drives the rollout-and-curation loop over the experience kernel:
//! - Samples several completions per molecule with bounded concurrency
//! - Scores predictions with a configurable reward policy
//! - Critiques trajectories into experience mutations
//! - Commits one experience snapshot per training step

pub mod audit;
pub mod config;
pub mod critique;
pub mod dataset;
pub mod error;
pub mod experiment;
pub mod prompts;
pub mod results;
pub mod rollout;
pub mod step;
pub mod verifier;
pub mod vllm_client;
